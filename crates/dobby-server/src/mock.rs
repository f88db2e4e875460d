//! Simulated loom speaking the example protocol.
//!
//! The simulator runs as its own task on one end of an in-memory pipe. Tests
//! and users drive it with out-of-band commands that stand in for a weaver
//! at the loom:
//!
//! - `n`: press the pedal (request the next pick; reports `p`)
//! - `d`: toggle the weave direction (reports `u0`/`u1`)
//! - `c`: drop the connection
//!
//! A `C<hex>` shaft command is only obeyed while a pick is wanted; the
//! simulator then reports `m1`, waits the motion duration, and reports the
//! new shafts (`c<hex>`) followed by `m0`.

use dobby_core::ShaftWord;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{split_loom_io, LoomReader, LoomWriter};
use crate::error::LoomError;

/// In-memory pipe capacity.
const PIPE_CAPACITY: usize = 4096;

/// Default time the simulated shafts take to move.
pub const DEFAULT_MOTION_DURATION: Duration = Duration::from_secs(1);

/// Control handle for a running simulator.
#[derive(Debug)]
pub struct MockLoomHandle {
    oob: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl MockLoomHandle {
    /// Queue an out-of-band command.
    pub fn oob_command(&self, command: &str) {
        if self.oob.send(command.to_string()).is_err() {
            log::warn!("Mock loom is not running; ignoring oob command {:?}", command);
        }
    }

    /// Stop the simulator; the server sees end of stream.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockLoomHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a simulator for the example protocol.
pub fn spawn_example_mock_loom(
    motion_duration: Duration,
    terminator: u8,
) -> (DuplexStream, MockLoomHandle) {
    let (server_end, loom_end) = tokio::io::duplex(PIPE_CAPACITY);
    let (reader, writer) = split_loom_io(loom_end, terminator);
    let (oob_tx, oob_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let mock = MockLoom {
        writer,
        motion_duration,
        pick_wanted: false,
        weave_forward: true,
        moving: false,
        shaft_word: 0,
        pending_move: None,
    };
    tokio::spawn(mock.run(reader, oob_rx, cancel.clone()));

    (
        server_end,
        MockLoomHandle {
            oob: oob_tx,
            cancel,
        },
    )
}

struct MockLoom {
    writer: LoomWriter,
    motion_duration: Duration,
    pick_wanted: bool,
    weave_forward: bool,
    moving: bool,
    shaft_word: ShaftWord,
    /// When the current motion ends, and the shafts it raises.
    pending_move: Option<(Instant, ShaftWord)>,
}

enum Flow {
    Continue,
    Close,
}

impl MockLoom {
    async fn run(
        mut self,
        mut reader: LoomReader,
        mut oob_rx: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.report_initial_status().await {
            log::warn!("MockLoom: could not report initial status: {}", e);
            return;
        }
        loop {
            let move_deadline = self
                .pending_move
                .map(|(deadline, _)| deadline)
                .unwrap_or_else(Instant::now);
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = reader.read_frame() => match frame {
                    Ok(Some(frame)) => self.handle_command(&frame).await,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("MockLoom: read failed: {}", e);
                        break;
                    }
                },
                Some(command) = oob_rx.recv() => self.handle_oob_command(&command).await,
                _ = tokio::time::sleep_until(move_deadline), if self.pending_move.is_some() => {
                    self.finish_move().await
                }
            };
            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => break,
                Err(e) => {
                    log::warn!("MockLoom: write failed: {}", e);
                    break;
                }
            }
        }
        self.writer.close().await;
        log::info!("MockLoom: stopped");
    }

    async fn report_initial_status(&mut self) -> Result<(), LoomError> {
        self.report_direction().await?;
        self.report_motion_state().await?;
        self.report_pick_wanted().await
    }

    async fn handle_command(&mut self, frame: &[u8]) -> Result<Flow, LoomError> {
        let command = String::from_utf8_lossy(frame);
        let command = command.trim();
        log::debug!("MockLoom: command {:?}", command);
        let mut chars = command.chars();
        match (chars.next(), chars.as_str()) {
            (Some('C'), data) => match ShaftWord::from_str_radix(data, 16) {
                Ok(word) => self.set_shaft_word(word).await?,
                Err(_) => log::warn!("MockLoom: invalid command {:?}: not a hex value", command),
            },
            (Some('U'), "0") => self.set_weave_forward(true).await?,
            (Some('U'), "1") => self.set_weave_forward(false).await?,
            (Some('U'), _) => log::warn!("MockLoom: invalid command {:?}: arg must be 0 or 1", command),
            _ => log::warn!("MockLoom: unrecognized command {:?}", command),
        }
        Ok(Flow::Continue)
    }

    async fn handle_oob_command(&mut self, command: &str) -> Result<Flow, LoomError> {
        match command.chars().next() {
            Some('c') => {
                log::info!("MockLoom: oob close command");
                return Ok(Flow::Close);
            }
            Some('d') => {
                self.weave_forward = !self.weave_forward;
                log::info!(
                    "MockLoom: oob toggle direction to {}",
                    if self.weave_forward { "weave" } else { "unweave" }
                );
                self.report_direction().await?;
            }
            Some('n') => {
                log::info!("MockLoom: oob request next pick");
                self.pick_wanted = true;
                self.report_pick_wanted().await?;
            }
            _ => log::warn!("MockLoom: unrecognized oob command {:?}", command),
        }
        Ok(Flow::Continue)
    }

    async fn set_shaft_word(&mut self, word: ShaftWord) -> Result<(), LoomError> {
        if !self.pick_wanted {
            return Ok(());
        }
        self.pick_wanted = false;
        self.moving = true;
        self.pending_move = Some((Instant::now() + self.motion_duration, word));
        self.report_motion_state().await
    }

    async fn finish_move(&mut self) -> Result<Flow, LoomError> {
        if let Some((_, word)) = self.pending_move.take() {
            self.moving = false;
            self.shaft_word = word;
            self.report_shafts().await?;
            self.report_motion_state().await?;
        }
        Ok(Flow::Continue)
    }

    async fn set_weave_forward(&mut self, forward: bool) -> Result<(), LoomError> {
        self.weave_forward = forward;
        self.report_direction().await
    }

    async fn report_direction(&mut self) -> Result<(), LoomError> {
        let code = if self.weave_forward { 0 } else { 1 };
        self.writer.write_frame(&format!("u{code}")).await
    }

    async fn report_motion_state(&mut self) -> Result<(), LoomError> {
        let code = if self.moving { 1 } else { 0 };
        self.writer.write_frame(&format!("m{code}")).await
    }

    async fn report_pick_wanted(&mut self) -> Result<(), LoomError> {
        if self.pick_wanted {
            self.writer.write_frame("p").await?;
        }
        Ok(())
    }

    async fn report_shafts(&mut self) -> Result<(), LoomError> {
        self.writer
            .write_frame(&format!("c{:08x}", self.shaft_word))
            .await
    }
}
