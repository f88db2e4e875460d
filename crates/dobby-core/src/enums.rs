//! Small integer-coded enums shared by the server and its clients.
//!
//! Every enum travels over the wire (and into the settings file) as its
//! integer code, so `serde` goes through `u8` in both directions.

use serde::{Deserialize, Serialize};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "u8", into = "u8")]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value,)+
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(value: u8) -> Result<Self, String> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(format!("invalid {} {}", stringify!($name), other)),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }
    };
}

wire_enum! {
    /// State of the link to the loom.
    pub enum ConnectionState {
        Disconnected = 0,
        Connected = 1,
        Connecting = 2,
        Disconnecting = 3,
    }
}

wire_enum! {
    /// Who decides the weaving/threading direction.
    pub enum DirectionControl {
        /// Loom and software can both change it (needs loom support).
        Full = 1,
        /// Only the loom can change it.
        Loom = 2,
        /// Only the software can change it.
        Software = 3,
    }
}

wire_enum! {
    /// Which cursor advances when the loom asks for the next pick.
    pub enum Mode {
        Weave = 1,
        Thread = 2,
        Settings = 3,
    }
}

wire_enum! {
    /// Severity of a message to the user.
    pub enum Severity {
        Info = 1,
        Warning = 2,
        Error = 3,
    }
}

wire_enum! {
    /// Shaft motion state as last reported by the loom.
    pub enum ShaftState {
        Unknown = 0,
        Done = 1,
        Moving = 2,
        Error = 3,
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::Weave
    }
}

impl Default for ShaftState {
    fn default() -> Self {
        Self::Unknown
    }
}
