//! Extension point for loom models.
//!
//! A [`LoomDriver`] knows one loom's byte protocol. The session hands it
//! every frame the loom sends and asks it to encode shaft and direction
//! commands; everything else (patterns, cursors, client traffic) is shared.

use async_trait::async_trait;
use dobby_core::{LoomCapabilities, ShaftWord};
use std::time::Duration;
use tokio::io::DuplexStream;

use crate::error::LoomError;
use crate::mock::MockLoomHandle;
use crate::session::SessionCore;

/// Protocol binding for one loom model.
#[async_trait]
pub trait LoomDriver: Send + Sync + 'static {
    /// Loom name used when the settings do not name one.
    fn default_name(&self) -> &str;

    fn num_shafts(&self) -> usize;

    fn capabilities(&self) -> LoomCapabilities;

    /// Byte that ends every frame in both directions.
    fn terminator(&self) -> u8 {
        b'\n'
    }

    /// Process one frame from the loom (terminator already removed).
    ///
    /// Malformed frames should be reported as [`LoomError::Protocol`]; the
    /// session reports those to the client and keeps reading. Any other
    /// error ends the loom connection.
    async fn handle_loom_reply(
        &self,
        session: &mut SessionCore,
        frame: &[u8],
    ) -> Result<(), LoomError>;

    /// Command the loom to raise the shafts in `shaft_word`.
    async fn write_shafts_to_loom(
        &self,
        session: &mut SessionCore,
        shaft_word: ShaftWord,
    ) -> Result<(), LoomError>;

    /// Tell the loom which direction the software wants.
    async fn write_direction_to_loom(
        &self,
        session: &mut SessionCore,
        forward: bool,
    ) -> Result<(), LoomError>;

    /// Query or set up loom state right after connecting.
    async fn get_initial_loom_state(&self, _session: &mut SessionCore) -> Result<(), LoomError> {
        Ok(())
    }

    /// Start a simulated loom speaking this protocol.
    ///
    /// Returns the server's end of the link and a handle to the simulator.
    fn spawn_mock_loom(&self, motion_duration: Duration) -> (DuplexStream, MockLoomHandle);
}
