//! Driver for the example dobby loom protocol.
//!
//! Newline-terminated ASCII frames.
//!
//! Loom to server:
//! - `c<hex>`: shafts that are up
//! - `m0` / `m1`: shafts done / moving
//! - `p`: next pick wanted
//! - `u0` / `u1`: weave forward / backward
//!
//! Server to loom:
//! - `C<hex>`: shafts to raise (8 hex digits)
//! - `U0` / `U1`: weave forward / backward

use async_trait::async_trait;
use dobby_core::{DirectionControl, LoomCapabilities, ShaftState, ShaftWord};
use std::time::Duration;
use tokio::io::DuplexStream;

use crate::driver::LoomDriver;
use crate::error::LoomError;
use crate::mock::{spawn_example_mock_loom, MockLoomHandle};
use crate::session::SessionCore;

/// The example loom.
#[derive(Debug, Clone)]
pub struct ExampleLoom {
    num_shafts: usize,
    full_direction_control: bool,
}

impl ExampleLoom {
    pub fn new(num_shafts: usize) -> Self {
        Self {
            num_shafts,
            full_direction_control: true,
        }
    }

    /// Declare whether the loom accepts direction changes from both sides.
    pub fn with_full_direction_control(mut self, full: bool) -> Self {
        self.full_direction_control = full;
        self
    }
}

#[async_trait]
impl LoomDriver for ExampleLoom {
    fn default_name(&self) -> &str {
        "example"
    }

    fn num_shafts(&self) -> usize {
        self.num_shafts
    }

    fn capabilities(&self) -> LoomCapabilities {
        LoomCapabilities {
            full_direction_control: self.full_direction_control,
        }
    }

    async fn handle_loom_reply(
        &self,
        session: &mut SessionCore,
        frame: &[u8],
    ) -> Result<(), LoomError> {
        let reply = std::str::from_utf8(frame)
            .map_err(|_| LoomError::Protocol(format!("non-ASCII reply {frame:?}")))?
            .trim();
        let mut chars = reply.chars();
        let Some(reply_char) = chars.next() else {
            return Ok(());
        };
        let data = chars.as_str();
        match reply_char {
            'c' => {
                let word = ShaftWord::from_str_radix(data, 16).map_err(|_| {
                    LoomError::Protocol(format!("{reply:?}: shaft word must be hex"))
                })?;
                session.set_shaft_word(word);
            }
            'm' => {
                let state = match data {
                    "0" => ShaftState::Done,
                    "1" => ShaftState::Moving,
                    _ => {
                        return Err(LoomError::Protocol(format!(
                            "{reply:?}: motion state must be 0 or 1"
                        )))
                    }
                };
                session.set_shaft_state(state);
            }
            'p' => {
                session.handle_next_pick_request().await?;
            }
            'u' => {
                let forward = match data {
                    "0" => true,
                    "1" => false,
                    _ => {
                        return Err(LoomError::Protocol(format!(
                            "{reply:?}: direction must be 0 or 1"
                        )))
                    }
                };
                session.handle_loom_direction(forward).await?;
            }
            _ => return Err(LoomError::Protocol(format!("unknown reply {reply:?}"))),
        }
        Ok(())
    }

    async fn write_shafts_to_loom(
        &self,
        session: &mut SessionCore,
        shaft_word: ShaftWord,
    ) -> Result<(), LoomError> {
        session.write_to_loom(&format!("C{shaft_word:08x}")).await
    }

    async fn write_direction_to_loom(
        &self,
        session: &mut SessionCore,
        forward: bool,
    ) -> Result<(), LoomError> {
        session
            .write_to_loom(if forward { "U0" } else { "U1" })
            .await
    }

    async fn get_initial_loom_state(&self, session: &mut SessionCore) -> Result<(), LoomError> {
        if session.settings().direction_control != DirectionControl::Loom {
            let forward = session.direction_forward();
            self.write_direction_to_loom(session, forward).await?;
        }
        Ok(())
    }

    fn spawn_mock_loom(&self, motion_duration: Duration) -> (DuplexStream, MockLoomHandle) {
        spawn_example_mock_loom(motion_duration, self.terminator())
    }
}
