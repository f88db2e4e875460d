//! Core model for the dobby loom server.
//!
//! This crate holds everything that does not touch the network or the loom:
//!
//! - [`ReducedPattern`]: a pattern reduced to what the loom needs, with the
//!   pick and end-group cursor that steps through it
//! - [`numbering`]: conversion between total numbers and per-repeat numbers
//! - [`Settings`]: validated loom settings with TOML persistence
//! - [`parse_pattern`]: WIF and JSON pattern readers
//! - the integer-coded enums shared with clients

pub mod enums;
pub mod error;
pub mod numbering;
pub mod parser;
pub mod pattern;
pub mod settings;
pub mod wif;

pub use enums::{ConnectionState, DirectionControl, Mode, Severity, ShaftState};
pub use error::{CursorError, PatternError, RepeatLengthError, SettingsError};
pub use numbering::{compute_num_within_and_repeats, compute_total_num, MAX_TOTAL_NUMBER};
pub use parser::parse_pattern;
pub use pattern::{
    shaft_set_from_shaft_word, shaft_word_from_shaft_set, Pick, ReducedPattern, ShaftWord,
    DEFAULT_THREAD_GROUP_SIZE, MAX_SHAFTS, NUM_ITEMS_FOR_REPEAT_SEPARATOR,
};
pub use settings::{check_thread_group_size, LoomCapabilities, Settings, MAX_THREAD_GROUP_SIZE};
