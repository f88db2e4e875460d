//! Loom session engine and WebSocket server for dobby looms.
//!
//! One [`LoomSession`] owns the pattern, settings and loom link. A single
//! client at a time drives it over a WebSocket with JSON commands and
//! receives JSON replies; the loom talks to it through a [`LoomDriver`].
//!
//! # Usage
//!
//! ```ignore
//! use dobby_server::{serve, ExampleLoom, LoomSession, SessionConfig, SqlitePatternStore};
//! use std::sync::Arc;
//!
//! let store = SqlitePatternStore::open_in_memory()?;
//! let session = LoomSession::new(
//!     Arc::new(ExampleLoom::new(24)),
//!     SessionConfig::new("mock"),
//!     Box::new(store),
//! );
//! session.start().await;
//! serve(session.clone(), 8000, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! session.close().await;
//! ```

pub mod connection;
pub mod driver;
pub mod error;
pub mod example_loom;
pub mod mock;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

pub use driver::LoomDriver;
pub use error::{CommandError, CommandResult, LoomError, StoreError};
pub use example_loom::ExampleLoom;
pub use mock::MockLoomHandle;
pub use protocol::{Command, LoomInfo, Reply};
pub use server::{router, serve};
pub use session::{
    ClientConnection, ClientFrame, LoomSession, Outbound, SessionConfig, SessionCore,
    MOCK_PORT_NAME,
};
pub use store::{PatternStore, SqlitePatternStore, MAX_PATTERNS};
