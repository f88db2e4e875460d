//! The loom session: one client, one loom, and the pattern between them.
//!
//! All mutable state lives in [`SessionCore`] behind a single async mutex.
//! Two tasks feed it: the client loop (one JSON command at a time) and the
//! loom loop (one frame at a time). Each task owns a cancellation token and
//! re-checks it after taking the lock, so a loop that was superseded while
//! it waited never touches the new state.

use dobby_core::{
    check_thread_group_size, compute_num_within_and_repeats, parse_pattern, ConnectionState,
    CursorError, DirectionControl, Mode, ReducedPattern, Settings, Severity, ShaftState,
    ShaftWord, MAX_THREAD_GROUP_SIZE, MAX_TOTAL_NUMBER,
};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{open_serial_port, split_loom_io, LoomReader, LoomWriter};
use crate::driver::LoomDriver;
use crate::error::{CommandError, CommandResult, LoomError};
use crate::mock::{MockLoomHandle, DEFAULT_MOTION_DURATION};
use crate::protocol::{decode_command, Command, Decoded, EndJump, LoomInfo, PickJump, Reply};
use crate::store::{PatternStore, MAX_PATTERNS};

/// Serial port name that selects the simulated loom.
pub const MOCK_PORT_NAME: &str = "mock";

/// WebSocket close codes.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_ERROR: u16 = 1011;

const LOG_SUMMARY_LEN: usize = 120;

/// One message from the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close,
}

/// One message for the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// A client transport: frames in, frames out.
pub struct ClientConnection {
    pub incoming: BoxStream<'static, ClientFrame>,
    pub outgoing: mpsc::UnboundedSender<Outbound>,
}

/// How the session reaches its loom and where it keeps settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Serial device path, or [`MOCK_PORT_NAME`].
    pub serial_port: String,
    /// Loom name overriding the stored one.
    pub loom_name: Option<String>,
    pub settings_path: Option<PathBuf>,
    /// How long the simulated loom takes to move its shafts.
    pub motion_duration: Duration,
}

impl SessionConfig {
    pub fn new(serial_port: impl Into<String>) -> Self {
        Self {
            serial_port: serial_port.into(),
            loom_name: None,
            settings_path: None,
            motion_duration: DEFAULT_MOTION_DURATION,
        }
    }

    pub fn is_mock(&self) -> bool {
        self.serial_port == MOCK_PORT_NAME
    }
}

struct ClientSlot {
    id: Uuid,
    outgoing: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ClientSlot {
    fn close(self, code: u16, reason: &str) {
        self.cancel.cancel();
        let _ = self.outgoing.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Where the cursor moves once the loom has the new shafts.
#[derive(Debug, Clone, Copy)]
enum NextPosition {
    Pick {
        pick_number: usize,
        pick_repeat_number: i64,
    },
    Ends {
        end_number0: usize,
        end_number1: usize,
        end_repeat_number: i64,
    },
}

struct LoomTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Session state shared by the client and loom loops.
pub struct SessionCore {
    this: Weak<Mutex<SessionCore>>,
    driver: Arc<dyn LoomDriver>,
    config: SessionConfig,
    store: Box<dyn PatternStore>,
    settings: Settings,
    mode: Mode,
    direction_forward: bool,
    current_pattern: Option<ReducedPattern>,
    jump_pick: Option<PickJump>,
    jump_end: Option<EndJump>,
    shaft_state: ShaftState,
    shaft_word: ShaftWord,
    connection_state: ConnectionState,
    loom_writer: Option<LoomWriter>,
    loom_task: Option<LoomTask>,
    mock_loom: Option<MockLoomHandle>,
    client: Option<ClientSlot>,
}

/// Handle to a running loom session.
#[derive(Clone)]
pub struct LoomSession {
    core: Arc<Mutex<SessionCore>>,
}

impl LoomSession {
    pub fn new(
        driver: Arc<dyn LoomDriver>,
        config: SessionConfig,
        store: Box<dyn PatternStore>,
    ) -> Self {
        let capabilities = driver.capabilities();
        let default_name = config
            .loom_name
            .clone()
            .unwrap_or_else(|| driver.default_name().to_string());
        let mut settings = match &config.settings_path {
            Some(path) => Settings::load_or_default(path, &default_name, capabilities),
            None => Settings::for_loom(&default_name, capabilities),
        };
        if let Some(name) = &config.loom_name {
            settings.loom_name = name.clone();
        }

        let core = Arc::new_cyclic(|this| {
            Mutex::new(SessionCore {
                this: this.clone(),
                driver,
                config,
                store,
                settings,
                mode: Mode::Weave,
                direction_forward: true,
                current_pattern: None,
                jump_pick: None,
                jump_end: None,
                shaft_state: ShaftState::Unknown,
                shaft_word: 0,
                connection_state: ConnectionState::Disconnected,
                loom_writer: None,
                loom_task: None,
                mock_loom: None,
                client: None,
            })
        });
        Self { core }
    }

    /// Restore the most recent pattern and connect to the loom.
    ///
    /// A failed loom connection is logged, not returned; the next client
    /// to attach retries it.
    pub async fn start(&self) {
        let mut core = self.core.lock().await;
        core.clear_jumps(false);
        match core.store.pattern_names() {
            Ok(names) => {
                if let Some(name) = names.last() {
                    match core.select_pattern(name) {
                        Ok(()) => log::info!("Restored pattern {:?}", name),
                        Err(e) => log::warn!("Could not restore pattern {:?}: {}", name, e),
                    }
                }
            }
            Err(e) => log::error!("Could not read pattern names: {}", e),
        }
        if let Err(e) = core.connect_to_loom().await {
            log::error!("Could not connect to the loom: {}", e);
        }
    }

    /// Make `connection` the active client, evicting any previous one.
    ///
    /// The returned token is cancelled once this client's session ends.
    pub async fn attach_client(&self, connection: ClientConnection) -> CancellationToken {
        let ClientConnection { incoming, outgoing } = connection;
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let mut core = self.core.lock().await;
        if let Some(previous) = core.client.take() {
            log::info!("Client {} superseded by client {}", previous.id, id);
            previous.close(CLOSE_GOING_AWAY, "superseded");
        }
        log::info!("Client {} connected", id);
        core.client = Some(ClientSlot {
            id,
            outgoing,
            cancel: cancel.clone(),
            task: None,
        });
        core.report_initial_server_state();
        if core.connection_state != ConnectionState::Connected {
            if let Err(e) = core.connect_to_loom().await {
                log::error!("Could not connect to the loom: {}", e);
            }
        }

        let handle = tokio::spawn(run_client_loop(
            self.core.clone(),
            id,
            incoming,
            cancel.clone(),
        ));
        if let Some(slot) = core.client.as_mut().filter(|slot| slot.id == id) {
            slot.task = Some(handle);
        }
        cancel
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Mutex<SessionCore>> {
        &self.core
    }

    /// Close the client and the loom, and wait for both loops to finish.
    pub async fn close(&self) {
        let (client_task, loom_task) = {
            let mut core = self.core.lock().await;
            let client_task = core.client.take().and_then(|mut slot| {
                let task = slot.task.take();
                slot.close(CLOSE_NORMAL, "");
                task
            });
            let loom_task = core.loom_task.take().map(|task| {
                task.cancel.cancel();
                task.handle
            });
            core.disconnect_from_loom().await;
            (client_task, loom_task)
        };
        for handle in [client_task, loom_task].into_iter().flatten() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("Session task panicked: {}", e);
                }
            }
        }
        log::info!("Session closed");
    }
}

async fn run_client_loop(
    core: Arc<Mutex<SessionCore>>,
    id: Uuid,
    mut incoming: BoxStream<'static, ClientFrame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = incoming.next() => frame,
        };
        let mut core = core.lock().await;
        if cancel.is_cancelled() {
            break;
        }
        let text = match frame {
            Some(ClientFrame::Text(text)) => text,
            Some(ClientFrame::Close) | None => {
                log::info!("Client {} disconnected", id);
                core.detach_client(id);
                break;
            }
        };
        let outcome = AssertUnwindSafe(core.handle_client_message(&text))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            log::error!(
                "Bug: client {} read loop failed on {}",
                id,
                summarize(&text)
            );
            core.report_command_problem("Client read loop failed; try refreshing", Severity::Error);
            core.close_client(id, CLOSE_ERROR, "internal error");
            break;
        }
    }
    cancel.cancel();
}

async fn run_loom_loop(
    core: Arc<Mutex<SessionCore>>,
    mut reader: LoomReader,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.read_frame() => frame,
        };
        let mut core = core.lock().await;
        if cancel.is_cancelled() {
            break;
        }
        match frame {
            Ok(Some(frame)) => {
                log::debug!("Read from loom: {:?}", String::from_utf8_lossy(&frame));
                let driver = core.driver.clone();
                let outcome = AssertUnwindSafe(driver.handle_loom_reply(&mut core, &frame))
                    .catch_unwind()
                    .await;
                let Ok(handled) = outcome else {
                    log::error!(
                        "Bug: loom reply handler failed on {:?}",
                        String::from_utf8_lossy(&frame)
                    );
                    core.loom_failed("Server stopped listening to the loom: internal error")
                        .await;
                    break;
                };
                match handled {
                    Ok(()) => {}
                    Err(LoomError::Protocol(message)) => {
                        log::warn!("Invalid loom reply: {}", message);
                        core.report_command_problem(
                            &format!("invalid loom reply: {message}"),
                            Severity::Warning,
                        );
                    }
                    Err(e) => {
                        core.loom_failed(&format!("Server stopped listening to the loom: {e}"))
                            .await;
                        break;
                    }
                }
            }
            Ok(None) => {
                core.loom_failed("Loom closed the connection").await;
                break;
            }
            Err(e) => {
                core.loom_failed(&format!("Server stopped listening to the loom: {e}"))
                    .await;
                break;
            }
        }
    }
}

impl SessionCore {
    // --- Accessors for loom drivers ---

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn direction_forward(&self) -> bool {
        self.direction_forward
    }

    pub fn current_pattern(&self) -> Option<&ReducedPattern> {
        self.current_pattern.as_ref()
    }

    pub fn shaft_state(&self) -> (ShaftState, ShaftWord) {
        (self.shaft_state, self.shaft_word)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn loom_info(&self) -> LoomInfo {
        LoomInfo {
            name: self.driver.default_name().to_string(),
            num_shafts: self.driver.num_shafts(),
            serial_port: self.config.serial_port.clone(),
            is_mock: self.config.is_mock(),
        }
    }

    /// Record and report the shafts the loom says are up.
    pub fn set_shaft_word(&mut self, shaft_word: ShaftWord) {
        self.shaft_word = shaft_word;
        self.report_shaft_state();
    }

    /// Record and report the loom's motion state.
    pub fn set_shaft_state(&mut self, state: ShaftState) {
        self.shaft_state = state;
        self.report_shaft_state();
    }

    /// Write one frame to the loom.
    pub async fn write_to_loom(&mut self, frame: &str) -> Result<(), LoomError> {
        match self.loom_writer.as_mut() {
            Some(writer) if !writer.is_closed() => writer.write_frame(frame).await,
            _ => Err(LoomError::NotConnected),
        }
    }

    /// The loom wants the next shafts.
    ///
    /// Applies a pending jump or advances the cursor for the current mode,
    /// sends the shafts to the loom and reports the new position. Returns
    /// `false` without writing to the loom when there is nothing to do or
    /// the cursor is already at the start. The cursor only moves once the
    /// loom has been sent the new shafts.
    pub async fn handle_next_pick_request(&mut self) -> Result<bool, LoomError> {
        let mode = self.mode;
        let forward = self.direction_forward;
        let low_to_high = self.settings.thread_low_to_high(forward);
        let (jump_pick, jump_end) = (self.jump_pick, self.jump_end);
        let Some(pattern) = self.current_pattern.as_ref() else {
            log::debug!("Ignoring pick request: no pattern");
            return Ok(false);
        };

        let next = match mode {
            Mode::Weave => match jump_pick {
                Some(jump) => Ok((jump.pick_number, jump.pick_repeat_number)),
                None => pattern.compute_next_pick(forward),
            }
            .and_then(|(pick_number, pick_repeat_number)| {
                let shaft_word = pattern.get_pick(pick_number)?.shaft_word;
                Ok((
                    NextPosition::Pick {
                        pick_number,
                        pick_repeat_number,
                    },
                    shaft_word,
                ))
            }),
            Mode::Thread => match jump_end {
                Some(jump) => Ok((jump.end_number0, jump.end_number1, jump.end_repeat_number)),
                None => pattern.compute_next_end_numbers(low_to_high),
            }
            .and_then(|(end_number0, end_number1, end_repeat_number)| {
                let shaft_word = pattern.shaft_word_for_ends(end_number0, end_number1)?;
                Ok((
                    NextPosition::Ends {
                        end_number0,
                        end_number1,
                        end_repeat_number,
                    },
                    shaft_word,
                ))
            }),
            Mode::Settings => {
                log::warn!("Ignoring pick request in settings mode");
                return Ok(false);
            }
        };

        let (next, shaft_word) = match next {
            Ok(next) => next,
            Err(CursorError::StartOfSequence) => {
                let what = if mode == Mode::Weave { "weaving" } else { "threading" };
                log::info!("At start of {}", what);
                self.report_status_message(&format!("At start of {what}"), Severity::Error);
                return Ok(false);
            }
            Err(CursorError::OutOfRange(message)) => {
                log::warn!("Cannot advance: {}", message);
                self.report_status_message(&message, Severity::Error);
                return Ok(false);
            }
        };

        let driver = self.driver.clone();
        driver.write_shafts_to_loom(self, shaft_word).await?;

        let committed = match (next, self.current_pattern.as_mut()) {
            (
                NextPosition::Pick {
                    pick_number,
                    pick_repeat_number,
                },
                Some(pattern),
            ) => pattern.set_current_pick_position(pick_number, pick_repeat_number),
            (
                NextPosition::Ends {
                    end_number0,
                    end_number1,
                    end_repeat_number,
                },
                Some(pattern),
            ) => pattern.set_current_end_position(end_number0, Some(end_number1), end_repeat_number),
            (_, None) => Ok(()),
        };
        if let Err(e) = committed {
            log::error!("Could not move the cursor after writing to the loom: {}", e);
        }
        self.clear_jumps(false);
        if mode == Mode::Weave {
            self.report_current_pick_number();
        } else {
            self.report_current_end_numbers();
        }
        Ok(true)
    }

    /// The loom reported its direction.
    ///
    /// Under software control the report is overridden by re-sending our
    /// direction; otherwise the loom's direction is adopted.
    pub async fn handle_loom_direction(&mut self, forward: bool) -> Result<(), LoomError> {
        if self.settings.direction_control == DirectionControl::Software {
            if forward != self.direction_forward {
                log::info!("Loom direction change ignored: software controls direction");
                let driver = self.driver.clone();
                let ours = self.direction_forward;
                driver.write_direction_to_loom(self, ours).await?;
            }
            return Ok(());
        }
        self.direction_forward = forward;
        self.send(Reply::Direction { forward });
        Ok(())
    }

    // --- Loom connection ---

    /// Open the loom link, dropping any existing one first.
    pub async fn connect_to_loom(&mut self) -> Result<(), LoomError> {
        if self.connection_state == ConnectionState::Connected {
            self.disconnect_from_loom().await;
        }
        self.set_connection_state(ConnectionState::Connecting, "");
        let (reader, writer, mock) = match self.open_loom_link().await {
            Ok(link) => link,
            Err(e) => {
                self.set_connection_state(ConnectionState::Disconnected, &e.to_string());
                return Err(e);
            }
        };
        self.loom_writer = Some(writer);
        self.mock_loom = mock;
        self.set_connection_state(ConnectionState::Connected, "");
        log::info!("Connected to loom on {}", self.config.serial_port);

        if let Some(core) = self.this.upgrade() {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_loom_loop(core, reader, cancel.clone()));
            self.loom_task = Some(LoomTask { cancel, handle });
        }
        let driver = self.driver.clone();
        if let Err(e) = driver.get_initial_loom_state(self).await {
            log::warn!("Could not set up initial loom state: {}", e);
        }
        Ok(())
    }

    async fn open_loom_link(
        &mut self,
    ) -> Result<(LoomReader, LoomWriter, Option<MockLoomHandle>), LoomError> {
        let terminator = self.driver.terminator();
        if self.config.is_mock() {
            let (io, handle) = self.driver.spawn_mock_loom(self.config.motion_duration);
            let (reader, writer) = split_loom_io(io, terminator);
            return Ok((reader, writer, Some(handle)));
        }
        let path = PathBuf::from(&self.config.serial_port);
        let port = open_serial_port(&path)?;
        let (reader, writer) = split_loom_io(port, terminator);
        Ok((reader, writer, None))
    }

    /// Close the loom link. A no-op if already disconnected.
    pub async fn disconnect_from_loom(&mut self) {
        if self.connection_state == ConnectionState::Disconnected {
            return;
        }
        self.set_connection_state(ConnectionState::Disconnecting, "");
        if let Some(task) = self.loom_task.take() {
            task.cancel.cancel();
        }
        if let Some(mut writer) = self.loom_writer.take() {
            writer.close().await;
        }
        if let Some(mock) = self.mock_loom.take() {
            mock.close();
        }
        self.set_connection_state(ConnectionState::Disconnected, "");
    }

    async fn loom_failed(&mut self, message: &str) {
        log::error!("{}", message);
        self.report_status_message(message, Severity::Error);
        self.disconnect_from_loom().await;
    }

    // --- Client connection ---

    fn detach_client(&mut self, id: Uuid) {
        if self.client.as_ref().is_some_and(|slot| slot.id == id) {
            self.client = None;
        }
    }

    fn close_client(&mut self, id: Uuid, code: u16, reason: &str) {
        if self.client.as_ref().is_some_and(|slot| slot.id == id) {
            if let Some(slot) = self.client.take() {
                slot.close(code, reason);
            }
        }
    }

    async fn handle_client_message(&mut self, text: &str) {
        match decode_command(text) {
            Decoded::NotJson(e) => log::info!("Ignoring invalid command: not JSON ({})", e),
            Decoded::MissingType(message) => {
                log::warn!("{}", message);
                self.report_command_problem(&message, Severity::Warning);
            }
            Decoded::Rejected { cmd_type, message } => {
                log::warn!("Rejected command: {}", message);
                self.send(Reply::command_done(cmd_type, Err(message)));
            }
            Decoded::Command(command) => {
                let cmd_type = command.cmd_type();
                log::debug!("Read command {}", summarize(text));
                let outcome = match self.run_command(command).await {
                    Ok(()) => Ok(()),
                    Err(CommandError::Internal(e)) => {
                        log::error!("Command {} failed unexpectedly: {:#}", cmd_type, e);
                        Err(format!("{cmd_type} failed unexpectedly; see the server log"))
                    }
                    Err(e) => {
                        log::info!("Command {} failed: {}", cmd_type, e);
                        Err(e.to_string())
                    }
                };
                self.send(Reply::command_done(cmd_type, outcome));
            }
        }
    }

    // --- Commands ---

    async fn run_command(&mut self, command: Command) -> CommandResult {
        match command {
            Command::Upload { name, data } => self.cmd_upload(&name, &data),
            Command::SelectPattern { name } => self.cmd_select_pattern(&name),
            Command::Mode { mode } => {
                self.mode = mode;
                self.send(Reply::Mode { mode });
                Ok(())
            }
            Command::JumpToPick { total_pick_number } => self.cmd_jump_to_pick(total_pick_number),
            Command::JumpToEnd { total_end_number0 } => self.cmd_jump_to_end(total_end_number0),
            Command::Direction { forward } => self.cmd_direction(forward).await,
            Command::Settings(fields) => self.cmd_settings(&fields),
            Command::ThreadGroupSize { group_size } => self.cmd_thread_group_size(group_size),
            Command::SeparateThreadingRepeats { separate } => {
                let pattern = self.require_pattern_mut("cannot set separate threading repeats")?;
                pattern.separate_threading_repeats = separate;
                let name = pattern.name.clone();
                self.store.update_separate_threading_repeats(&name, separate)?;
                self.send(Reply::SeparateThreadingRepeats { separate });
                Ok(())
            }
            Command::SeparateWeavingRepeats { separate } => {
                let pattern = self.require_pattern_mut("cannot set separate weaving repeats")?;
                pattern.separate_weaving_repeats = separate;
                let name = pattern.name.clone();
                self.store.update_separate_weaving_repeats(&name, separate)?;
                self.send(Reply::SeparateWeavingRepeats { separate });
                Ok(())
            }
            Command::ClearPatternNames => {
                self.store.clear()?;
                if let Some(pattern) = &self.current_pattern {
                    self.store.add_pattern(pattern, MAX_PATTERNS)?;
                }
                self.report_pattern_names()
            }
            Command::Oobcommand { command } => match &self.mock_loom {
                Some(mock) => {
                    mock.oob_command(&command);
                    Ok(())
                }
                None => Err(CommandError::invalid(format!(
                    "cannot send oob command {command:?}: no mock loom"
                ))),
            },
        }
    }

    fn cmd_upload(&mut self, name: &str, data: &str) -> CommandResult {
        log::info!("Reading pattern {:?}", name);
        let pattern = parse_pattern(name, data, self.settings.thread_group_size)
            .map_err(|e| CommandError::invalid(format!("cannot load pattern {name:?}: {e}")))?;
        self.store.add_pattern(&pattern, MAX_PATTERNS)?;
        self.report_pattern_names()?;
        if self
            .current_pattern
            .as_ref()
            .is_some_and(|current| current.name == pattern.name)
        {
            log::info!("Reloading replaced current pattern {:?}", pattern.name);
            self.select_pattern(&pattern.name)?;
            self.clear_jumps(false);
        }
        Ok(())
    }

    fn cmd_select_pattern(&mut self, name: &str) -> CommandResult {
        if self
            .current_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.name == name)
        {
            return Ok(());
        }
        self.select_pattern(name)?;
        self.clear_jumps(false);
        Ok(())
    }

    fn cmd_jump_to_pick(&mut self, total_pick_number: Option<i64>) -> CommandResult {
        let pattern = self.require_pattern("cannot jump to a pick")?;
        let jump = match total_pick_number {
            None => None,
            Some(total) if !(0..=MAX_TOTAL_NUMBER).contains(&total) => {
                return Err(CommandError::invalid(format!(
                    "invalid total pick number {total} not in range [0, {MAX_TOTAL_NUMBER}]"
                )))
            }
            Some(total) => {
                let (pick_number, pick_repeat_number) =
                    compute_num_within_and_repeats(total, pattern.num_picks() as i64)
                        .map_err(|e| CommandError::invalid(e.to_string()))?;
                Some(PickJump {
                    total_pick_number: total,
                    pick_number: pick_number as usize,
                    pick_repeat_number,
                })
            }
        };
        self.jump_pick = jump;
        self.send(Reply::from(jump));
        Ok(())
    }

    fn cmd_jump_to_end(&mut self, total_end_number0: Option<i64>) -> CommandResult {
        let pattern = self.require_pattern("cannot jump to an end")?;
        let jump = match total_end_number0 {
            None => None,
            Some(total) if !(0..=MAX_TOTAL_NUMBER).contains(&total) => {
                return Err(CommandError::invalid(format!(
                    "invalid total end number {total} not in range [0, {MAX_TOTAL_NUMBER}]"
                )))
            }
            Some(total) => {
                let (end_number0, end_repeat_number) =
                    compute_num_within_and_repeats(total, pattern.num_ends() as i64)
                        .map_err(|e| CommandError::invalid(e.to_string()))?;
                let end_number0 = end_number0 as usize;
                let end_number1 = pattern.compute_end_number1(end_number0);
                Some(EndJump {
                    total_end_number0: total,
                    total_end_number1: total - end_number0 as i64 + end_number1 as i64,
                    end_number0,
                    end_number1,
                    end_repeat_number,
                })
            }
        };
        self.jump_end = jump;
        self.send(Reply::from(jump));
        Ok(())
    }

    async fn cmd_direction(&mut self, forward: bool) -> CommandResult {
        if self.settings.direction_control == DirectionControl::Loom {
            return Err(CommandError::invalid(
                "cannot set direction: the loom controls direction",
            ));
        }
        self.direction_forward = forward;
        self.send(Reply::Direction { forward });
        if self.loom_writer.is_some() {
            let driver = self.driver.clone();
            driver.write_direction_to_loom(self, forward).await?;
        }
        Ok(())
    }

    fn cmd_settings(&mut self, fields: &Map<String, Value>) -> CommandResult {
        let updated = self
            .settings
            .with_updates(fields, self.driver.capabilities())?;
        self.settings = updated;
        let saved = match &self.config.settings_path {
            Some(path) => self.settings.save(path),
            None => Ok(()),
        };
        if let Err(e) = saved {
            log::error!("Could not save settings: {}", e);
            self.report_command_problem(&format!("could not save settings: {e}"), Severity::Warning);
        }
        self.send(Reply::Settings(self.settings.clone()));
        Ok(())
    }

    fn cmd_thread_group_size(&mut self, group_size: i64) -> CommandResult {
        let size = usize::try_from(group_size)
            .ok()
            .filter(|&size| check_thread_group_size(size).is_ok())
            .ok_or_else(|| {
                CommandError::invalid(format!(
                    "thread group size {group_size} not in range [1, {MAX_THREAD_GROUP_SIZE}]"
                ))
            })?;
        let pattern = self.require_pattern_mut("cannot set thread group size")?;
        pattern.set_thread_group_size(size)?;
        let name = pattern.name.clone();
        self.store.update_thread_group_size(&name, size)?;
        self.clear_jump_end(false);
        self.send(Reply::ThreadGroupSize { group_size: size });
        self.report_current_end_numbers();
        Ok(())
    }

    fn require_pattern(&self, action: &str) -> CommandResult<&ReducedPattern> {
        self.current_pattern
            .as_ref()
            .ok_or_else(|| CommandError::invalid(format!("{action}: no pattern")))
    }

    fn require_pattern_mut(&mut self, action: &str) -> CommandResult<&mut ReducedPattern> {
        self.current_pattern
            .as_mut()
            .ok_or_else(|| CommandError::invalid(format!("{action}: no pattern")))
    }

    fn select_pattern(&mut self, name: &str) -> CommandResult {
        let pattern = self.store.get_pattern(name)?;
        self.current_pattern = Some(pattern);
        self.report_current_pattern();
        self.report_current_end_numbers();
        self.report_current_pick_number();
        Ok(())
    }

    fn clear_jump_pick(&mut self, force: bool) {
        let changed = self.jump_pick.take().is_some();
        if changed || force {
            self.send(Reply::from(None::<PickJump>));
        }
    }

    fn clear_jump_end(&mut self, force: bool) {
        let changed = self.jump_end.take().is_some();
        if changed || force {
            self.send(Reply::from(None::<EndJump>));
        }
    }

    fn clear_jumps(&mut self, force: bool) {
        self.clear_jump_end(force);
        self.clear_jump_pick(force);
    }

    // --- Reports ---

    fn send(&mut self, reply: Reply) {
        let json = reply.to_json();
        let Some(client) = &self.client else {
            log::debug!("No client; not sending {}", summarize(&json));
            return;
        };
        log::debug!("Reply to client: {}", summarize(&json));
        if client.outgoing.send(Outbound::Text(json)).is_err() {
            log::debug!("Client {} is gone; reply dropped", client.id);
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState, reason: &str) {
        self.connection_state = state;
        self.report_loom_connection_state(reason);
    }

    fn report_loom_connection_state(&mut self, reason: &str) {
        self.send(Reply::LoomConnectionState {
            state: self.connection_state,
            reason: reason.to_string(),
        });
    }

    fn report_initial_server_state(&mut self) {
        self.report_loom_connection_state("");
        self.send(Reply::LoomInfo(self.loom_info()));
        self.send(Reply::Settings(self.settings.clone()));
        self.send(Reply::Mode { mode: self.mode });
        if let Err(e) = self.report_pattern_names() {
            log::error!("Could not report pattern names: {}", e);
        }
        self.send(Reply::Direction {
            forward: self.direction_forward,
        });
        self.clear_jumps(true);
        self.report_current_pattern();
        self.report_current_end_numbers();
        self.report_current_pick_number();
        self.report_shaft_state();
    }

    pub fn report_command_problem(&mut self, message: &str, severity: Severity) {
        self.send(Reply::CommandProblem {
            message: message.to_string(),
            severity,
        });
    }

    pub fn report_status_message(&mut self, message: &str, severity: Severity) {
        self.send(Reply::StatusMessage {
            message: message.to_string(),
            severity,
        });
    }

    fn report_pattern_names(&mut self) -> CommandResult {
        let names = self.store.pattern_names()?;
        self.send(Reply::PatternNames { names });
        Ok(())
    }

    fn report_current_pattern(&mut self) {
        if let Some(pattern) = &self.current_pattern {
            let reply = Reply::ReducedPattern(pattern.clone());
            self.send(reply);
        }
    }

    /// Persist and report the pick position.
    fn report_current_pick_number(&mut self) {
        let Some(pattern) = &self.current_pattern else {
            return;
        };
        if let Err(e) = self.store.update_pick_position(
            &pattern.name,
            pattern.pick_number,
            pattern.pick_repeat_number,
        ) {
            log::error!("Could not save pick position: {}", e);
        }
        let reply = Reply::CurrentPickNumber {
            total_pick_number: pattern.total_pick_number(),
            pick_number: pattern.pick_number,
            pick_repeat_number: pattern.pick_repeat_number,
        };
        self.send(reply);
    }

    /// Persist and report the end position.
    fn report_current_end_numbers(&mut self) {
        let Some(pattern) = &self.current_pattern else {
            return;
        };
        if let Err(e) = self.store.update_end_position(
            &pattern.name,
            pattern.end_number0,
            pattern.end_number1,
            pattern.end_repeat_number,
        ) {
            log::error!("Could not save end position: {}", e);
        }
        let (total_end_number0, total_end_number1) = pattern.total_end_numbers();
        let reply = Reply::CurrentEndNumber {
            total_end_number0,
            total_end_number1,
            end_number0: pattern.end_number0,
            end_number1: pattern.end_number1,
            end_repeat_number: pattern.end_repeat_number,
        };
        self.send(reply);
    }

    fn report_shaft_state(&mut self) {
        self.send(Reply::ShaftState {
            state: self.shaft_state,
            shaft_word: self.shaft_word,
        });
    }
}

fn summarize(text: &str) -> String {
    if text.chars().count() <= LOG_SUMMARY_LEN {
        return text.to_string();
    }
    let mut summary: String = text.chars().take(LOG_SUMMARY_LEN).collect();
    summary.push_str("...");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example_loom::ExampleLoom;
    use crate::store::SqlitePatternStore;
    use crate::error::StoreError;
    use dobby_core::LoomCapabilities;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn make_session_with(loom: ExampleLoom, settings_path: Option<PathBuf>) -> LoomSession {
        let mut config = SessionConfig::new(MOCK_PORT_NAME);
        config.motion_duration = Duration::from_millis(1);
        config.settings_path = settings_path;
        let store = SqlitePatternStore::open_in_memory().unwrap();
        LoomSession::new(Arc::new(loom), config, Box::new(store))
    }

    fn make_session() -> LoomSession {
        make_session_with(ExampleLoom::new(16), None)
    }

    fn pattern_json(num_picks: usize, num_ends: usize) -> String {
        json!({
            "name": "unused",
            "threading": (0..num_ends).map(|i| i % 4).collect::<Vec<_>>(),
            "picks": (0..num_picks)
                .map(|i| json!({"color": 0, "shaftWord": 1 << (i % 4)}))
                .collect::<Vec<_>>(),
            "pick0": {"color": 0, "shaftWord": 0},
        })
        .to_string()
    }

    fn make_pattern(num_picks: usize, num_ends: usize) -> ReducedPattern {
        parse_pattern("test.json", &pattern_json(num_picks, num_ends), 4).unwrap()
    }

    struct TestClient {
        incoming: futures::channel::mpsc::UnboundedSender<ClientFrame>,
        outgoing: mpsc::UnboundedReceiver<Outbound>,
        done: CancellationToken,
    }

    impl TestClient {
        async fn connect(session: &LoomSession) -> Self {
            let (in_tx, in_rx) = futures::channel::mpsc::unbounded();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let done = session
                .attach_client(ClientConnection {
                    incoming: in_rx.boxed(),
                    outgoing: out_tx,
                })
                .await;
            Self {
                incoming: in_tx,
                outgoing: out_rx,
                done,
            }
        }

        fn send(&self, command: Value) {
            self.incoming
                .unbounded_send(ClientFrame::Text(command.to_string()))
                .unwrap();
        }

        async fn next(&mut self) -> Outbound {
            tokio::time::timeout(TIMEOUT, self.outgoing.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("reply channel closed")
        }

        async fn next_reply(&mut self) -> Value {
            match self.next().await {
                Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected a reply, got {other:?}"),
            }
        }

        /// Skip replies until one of `reply_type` arrives.
        async fn read_until(&mut self, reply_type: &str) -> Value {
            loop {
                let reply = self.next_reply().await;
                if reply["type"] == reply_type {
                    return reply;
                }
            }
        }

        /// Collect replies up to and including the CommandDone for `cmd_type`.
        async fn run(&mut self, command: Value) -> (Vec<Value>, Value) {
            let cmd_type = command["type"].as_str().unwrap().to_string();
            self.send(command);
            let mut replies = Vec::new();
            loop {
                let reply = self.next_reply().await;
                if reply["type"] == "CommandDone" && reply["cmdType"] == cmd_type.as_str() {
                    return (replies, reply);
                }
                replies.push(reply);
            }
        }

        /// Skip the initial sync up to the loom connecting.
        async fn wait_connected(&mut self) {
            loop {
                let state = self.read_until("LoomConnectionState").await;
                if state["state"] == 1 {
                    return;
                }
            }
        }

        async fn upload_and_select(&mut self, name: &str, num_picks: usize, num_ends: usize) {
            let (_, done) = self
                .run(json!({"type": "upload", "name": name, "data": pattern_json(num_picks, num_ends)}))
                .await;
            assert_eq!(done["success"], true, "{done}");
            let (_, done) = self.run(json!({"type": "select_pattern", "name": name})).await;
            assert_eq!(done["success"], true, "{done}");
        }
    }

    /// Example loom that panics in the reply handler or on direction writes.
    struct PanickyLoom {
        inner: ExampleLoom,
        panic_on_replies: bool,
    }

    #[async_trait::async_trait]
    impl LoomDriver for PanickyLoom {
        fn default_name(&self) -> &str {
            self.inner.default_name()
        }

        fn num_shafts(&self) -> usize {
            self.inner.num_shafts()
        }

        fn capabilities(&self) -> LoomCapabilities {
            self.inner.capabilities()
        }

        async fn handle_loom_reply(
            &self,
            session: &mut SessionCore,
            frame: &[u8],
        ) -> Result<(), LoomError> {
            if self.panic_on_replies {
                panic!("cannot handle {:?}", String::from_utf8_lossy(frame));
            }
            self.inner.handle_loom_reply(session, frame).await
        }

        async fn write_shafts_to_loom(
            &self,
            session: &mut SessionCore,
            shaft_word: ShaftWord,
        ) -> Result<(), LoomError> {
            self.inner.write_shafts_to_loom(session, shaft_word).await
        }

        async fn write_direction_to_loom(
            &self,
            _session: &mut SessionCore,
            _forward: bool,
        ) -> Result<(), LoomError> {
            panic!("direction writes are broken");
        }

        fn spawn_mock_loom(&self, motion_duration: Duration) -> (DuplexStream, MockLoomHandle) {
            self.inner.spawn_mock_loom(motion_duration)
        }
    }

    /// Pattern store whose `clear` always fails.
    struct BrokenClearStore(SqlitePatternStore);

    impl PatternStore for BrokenClearStore {
        fn pattern_names(&self) -> Result<Vec<String>, StoreError> {
            self.0.pattern_names()
        }

        fn get_pattern(&self, name: &str) -> Result<ReducedPattern, StoreError> {
            self.0.get_pattern(name)
        }

        fn add_pattern(
            &mut self,
            pattern: &ReducedPattern,
            max_entries: usize,
        ) -> Result<(), StoreError> {
            self.0.add_pattern(pattern, max_entries)
        }

        fn update_pick_position(
            &mut self,
            name: &str,
            pick_number: usize,
            pick_repeat_number: i64,
        ) -> Result<(), StoreError> {
            self.0.update_pick_position(name, pick_number, pick_repeat_number)
        }

        fn update_end_position(
            &mut self,
            name: &str,
            end_number0: usize,
            end_number1: usize,
            end_repeat_number: i64,
        ) -> Result<(), StoreError> {
            self.0
                .update_end_position(name, end_number0, end_number1, end_repeat_number)
        }

        fn update_thread_group_size(&mut self, name: &str, size: usize) -> Result<(), StoreError> {
            self.0.update_thread_group_size(name, size)
        }

        fn update_separate_weaving_repeats(
            &mut self,
            name: &str,
            separate: bool,
        ) -> Result<(), StoreError> {
            self.0.update_separate_weaving_repeats(name, separate)
        }

        fn update_separate_threading_repeats(
            &mut self,
            name: &str,
            separate: bool,
        ) -> Result<(), StoreError> {
            self.0.update_separate_threading_repeats(name, separate)
        }

        fn clear(&mut self) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk unplugged")))
        }
    }

    fn make_session_with_driver(driver: Arc<dyn LoomDriver>) -> LoomSession {
        let mut config = SessionConfig::new(MOCK_PORT_NAME);
        config.motion_duration = Duration::from_millis(1);
        let store = SqlitePatternStore::open_in_memory().unwrap();
        LoomSession::new(driver, config, Box::new(store))
    }

    fn types_of(replies: &[Value]) -> Vec<&str> {
        replies.iter().filter_map(|r| r["type"].as_str()).collect()
    }

    #[tokio::test]
    async fn test_initial_sync() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;
        let mut replies = Vec::new();
        for _ in 0..11 {
            replies.push(client.next_reply().await);
        }
        assert_eq!(
            types_of(&replies),
            vec![
                "LoomConnectionState",
                "LoomInfo",
                "Settings",
                "Mode",
                "PatternNames",
                "Direction",
                "JumpEndNumber",
                "JumpPickNumber",
                "ShaftState",
                "LoomConnectionState",
                "LoomConnectionState",
            ]
        );
        assert_eq!(replies[0]["state"], 0);
        assert_eq!(replies[1]["numShafts"], 16);
        assert_eq!(replies[1]["isMock"], true);
        assert_eq!(replies[2]["directionControl"], 1);
        assert!(replies[7]["totalPickNumber"].is_null());
        assert_eq!(replies[9]["state"], 2);
        assert_eq!(replies[10]["state"], 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_weave_with_jump() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;
        client.upload_and_select("ten.json", 10, 8).await;

        let (replies, done) = client
            .run(json!({"type": "separate_weaving_repeats", "separate": true}))
            .await;
        assert_eq!(done["success"], true);
        assert!(replies.iter().any(|r| r["type"] == "SeparateWeavingRepeats"));

        let (replies, done) = client
            .run(json!({"type": "jump_to_pick", "totalPickNumber": 23}))
            .await;
        assert_eq!(done["success"], true);
        let jump = replies.iter().find(|r| r["type"] == "JumpPickNumber").unwrap();
        assert_eq!(jump["pickNumber"], 3);
        assert_eq!(jump["pickRepeatNumber"], 3);

        client.run(json!({"type": "oobcommand", "command": "n"})).await;
        let cleared = client.read_until("JumpPickNumber").await;
        assert!(cleared["pickNumber"].is_null());
        let current = client.read_until("CurrentPickNumber").await;
        assert_eq!(current["totalPickNumber"], 23);
        assert_eq!(current["pickNumber"], 3);
        assert_eq!(current["pickRepeatNumber"], 3);

        // The mock raises the shafts of pick 3 and reports them.
        loop {
            let state = client.read_until("ShaftState").await;
            if state["state"] == 1 && state["shaftWord"] == 4 {
                break;
            }
        }

        client.run(json!({"type": "oobcommand", "command": "n"})).await;
        let current = client.read_until("CurrentPickNumber").await;
        assert_eq!(current["totalPickNumber"], 24);
        assert_eq!(current["pickNumber"], 4);
        session.close().await;
    }

    #[tokio::test]
    async fn test_jump_to_end() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;
        client.upload_and_select("thirty.json", 4, 30).await;

        let (replies, done) = client
            .run(json!({"type": "jump_to_end", "totalEndNumber0": 28}))
            .await;
        assert_eq!(done["success"], true);
        let jump = replies.iter().find(|r| r["type"] == "JumpEndNumber").unwrap();
        assert_eq!(jump["endNumber0"], 28);
        assert_eq!(jump["endNumber1"], 30);
        assert_eq!(jump["totalEndNumber1"], 30);
        assert_eq!(jump["endRepeatNumber"], 1);

        let (_, done) = client
            .run(json!({"type": "jump_to_end", "totalEndNumber0": -1}))
            .await;
        assert_eq!(done["success"], false);

        let (replies, _) = client
            .run(json!({"type": "jump_to_end", "totalEndNumber0": null}))
            .await;
        let jump = replies.iter().find(|r| r["type"] == "JumpEndNumber").unwrap();
        assert!(jump["endNumber0"].is_null());
        session.close().await;
    }

    #[tokio::test]
    async fn test_start_of_weaving() {
        let loom = ExampleLoom::new(8).with_full_direction_control(false);
        let session = make_session_with(loom, None);
        let mut client = TestClient::connect(&session).await;
        client.upload_and_select("five.json", 5, 8).await;

        let (_, done) = client.run(json!({"type": "direction", "forward": false})).await;
        assert_eq!(done["success"], true);
        client.run(json!({"type": "oobcommand", "command": "n"})).await;
        let status = client.read_until("StatusMessage").await;
        assert_eq!(status["message"], "At start of weaving");
        assert_eq!(status["severity"], 3);
        session.close().await;
    }

    #[tokio::test]
    async fn test_direction_under_loom_control() {
        let loom = ExampleLoom::new(8).with_full_direction_control(false);
        let session = make_session_with(loom, None);
        let mut client = TestClient::connect(&session).await;
        let (_, done) = client
            .run(json!({"type": "settings", "directionControl": 2}))
            .await;
        assert_eq!(done["success"], true);
        let (_, done) = client.run(json!({"type": "direction", "forward": false})).await;
        assert_eq!(done["success"], false);
        session.close().await;
    }

    #[tokio::test]
    async fn test_settings_atomic_and_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        let session = make_session_with(ExampleLoom::new(16), Some(path.clone()));
        let mut client = TestClient::connect(&session).await;
        client.wait_connected().await;

        let (replies, done) = client
            .run(json!({"type": "settings", "loomName": "Ada", "threadGroupSize": 0}))
            .await;
        assert_eq!(done["success"], false);
        assert!(!replies.iter().any(|r| r["type"] == "Settings"));
        assert!(!path.exists());

        let (_, done) = client
            .run(json!({"type": "settings", "directionControl": 3}))
            .await;
        assert_eq!(done["success"], false);

        let (replies, done) = client
            .run(json!({"type": "settings", "loomName": "Ada", "threadGroupSize": 6}))
            .await;
        assert_eq!(done["success"], true);
        let settings = replies.iter().find(|r| r["type"] == "Settings").unwrap();
        assert_eq!(settings["loomName"], "Ada");
        assert_eq!(settings["threadGroupSize"], 6);

        let saved = Settings::load(&path).unwrap();
        assert_eq!(saved.loom_name, "Ada");
        assert_eq!(saved.thread_group_size, 6);
        session.close().await;
    }

    #[tokio::test]
    async fn test_bad_commands() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;

        client
            .incoming
            .unbounded_send(ClientFrame::Text("not json".into()))
            .unwrap();
        client.send(json!({"name": "no type"}));
        let problem = client.read_until("CommandProblem").await;
        assert_eq!(problem["severity"], 2);

        let (_, done) = client.run(json!({"type": "fly"})).await;
        assert_eq!(done["success"], false);
        assert!(done["message"].as_str().unwrap().contains("unknown command type"));

        let (_, done) = client
            .run(json!({"type": "jump_to_pick", "totalPickNumber": 3}))
            .await;
        assert_eq!(done["success"], false);
        assert!(done["message"].as_str().unwrap().contains("no pattern"));

        let (_, done) = client.run(json!({"type": "select_pattern", "name": "nope"})).await;
        assert_eq!(done["success"], false);

        let (_, done) = client.run(json!({"type": "upload", "name": "x.dtx", "data": ""})).await;
        assert_eq!(done["success"], false);

        let (_, done) = client.run(json!({"type": "thread_group_size", "groupSize": 3})).await;
        assert_eq!(done["success"], false);
        session.close().await;
    }

    #[tokio::test]
    async fn test_session_takeover() {
        let session = make_session();
        let mut first = TestClient::connect(&session).await;
        let mut second = TestClient::connect(&session).await;

        loop {
            if let Outbound::Close { code, reason } = first.next().await {
                assert_eq!(code, CLOSE_GOING_AWAY);
                assert_eq!(reason, "superseded");
                break;
            }
        }
        tokio::time::timeout(TIMEOUT, first.done.cancelled())
            .await
            .unwrap();

        let reply = second.next_reply().await;
        assert_eq!(reply["type"], "LoomConnectionState");
        let (_, done) = second.run(json!({"type": "mode", "mode": 2})).await;
        assert_eq!(done["success"], true);
        assert!(!second.done.is_cancelled());
        session.close().await;
    }

    #[tokio::test]
    async fn test_loom_eof_disconnects() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;
        client.wait_connected().await;

        client.run(json!({"type": "oobcommand", "command": "c"})).await;
        let status = client.read_until("StatusMessage").await;
        assert_eq!(status["severity"], 3);
        let state = client.read_until("LoomConnectionState").await;
        assert_eq!(state["state"], 3);
        let state = client.read_until("LoomConnectionState").await;
        assert_eq!(state["state"], 0);

        let (replies, done) = client.run(json!({"type": "mode", "mode": 2})).await;
        assert_eq!(done["success"], true);
        assert!(replies.iter().any(|r| r["type"] == "Mode" && r["mode"] == 2));

        let (_, done) = client.run(json!({"type": "oobcommand", "command": "n"})).await;
        assert_eq!(done["success"], false);
        session.close().await;
    }

    #[tokio::test]
    async fn test_next_pick_request_threading() {
        let session = make_session();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (near, far) = tokio::io::duplex(1024);
        let (_reader, writer) = split_loom_io(near, b'\n');
        let (mut loom, _loom_writer) = split_loom_io(far, b'\n');

        let mut core = session.core.lock().await;
        core.client = Some(ClientSlot {
            id: Uuid::new_v4(),
            outgoing: out_tx,
            cancel: CancellationToken::new(),
            task: None,
        });
        core.loom_writer = Some(writer);

        assert!(!core.handle_next_pick_request().await.unwrap());

        let pattern = make_pattern(4, 30);
        core.store.add_pattern(&pattern, MAX_PATTERNS).unwrap();
        core.current_pattern = Some(pattern);
        core.mode = Mode::Thread;

        core.direction_forward = false;
        assert!(!core.handle_next_pick_request().await.unwrap());
        let status = loop {
            if let Outbound::Text(text) = out_rx.recv().await.unwrap() {
                let reply: Value = serde_json::from_str(&text).unwrap();
                if reply["type"] == "StatusMessage" {
                    break reply;
                }
            }
        };
        assert_eq!(status["message"], "At start of threading");

        core.direction_forward = true;
        assert!(core.handle_next_pick_request().await.unwrap());
        assert_eq!(loom.read_frame().await.unwrap().unwrap(), "C0000000f");
        let pattern = core.current_pattern().unwrap();
        assert_eq!((pattern.end_number0, pattern.end_number1), (1, 4));

        core.jump_end = Some(EndJump {
            total_end_number0: 28,
            total_end_number1: 30,
            end_number0: 28,
            end_number1: 30,
            end_repeat_number: 1,
        });
        assert!(core.handle_next_pick_request().await.unwrap());
        assert_eq!(loom.read_frame().await.unwrap().unwrap(), "C0000000b");
        assert!(core.jump_end.is_none());
        let stored = core.store.get_pattern("test.json").unwrap();
        assert_eq!((stored.end_number0, stored.end_number1), (28, 30));

        core.mode = Mode::Settings;
        assert!(!core.handle_next_pick_request().await.unwrap());
    }

    #[tokio::test]
    async fn test_start_restores_latest_pattern() {
        let mut store = SqlitePatternStore::open_in_memory().unwrap();
        let mut older = make_pattern(4, 8);
        older.name = "older.json".into();
        let mut newer = make_pattern(6, 8);
        newer.name = "newer.json".into();
        store.add_pattern(&older, MAX_PATTERNS).unwrap();
        store.add_pattern(&newer, MAX_PATTERNS).unwrap();

        let mut config = SessionConfig::new(MOCK_PORT_NAME);
        config.motion_duration = Duration::from_millis(1);
        let session = LoomSession::new(Arc::new(ExampleLoom::new(8)), config, Box::new(store));
        session.start().await;
        {
            let core = session.core.lock().await;
            assert_eq!(core.current_pattern().unwrap().name, "newer.json");
            assert_eq!(core.connection_state(), ConnectionState::Connected);
        }

        let mut client = TestClient::connect(&session).await;
        let pattern = client.read_until("ReducedPattern").await;
        assert_eq!(pattern["name"], "newer.json");
        session.close().await;
        match client.next().await {
            Outbound::Close { code, .. } => assert_eq!(code, CLOSE_NORMAL),
            Outbound::Text(_) => loop {
                if let Outbound::Close { code, .. } = client.next().await {
                    assert_eq!(code, CLOSE_NORMAL);
                    break;
                }
            },
        }
        assert_eq!(
            session.core.lock().await.connection_state(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_failed_loom_write_keeps_cursor() {
        let session = make_session();
        let mut core = session.core.lock().await;
        let pattern = make_pattern(4, 8);
        core.store.add_pattern(&pattern, MAX_PATTERNS).unwrap();
        core.current_pattern = Some(pattern);

        for _ in 0..3 {
            assert!(matches!(
                core.handle_next_pick_request().await,
                Err(LoomError::NotConnected)
            ));
        }
        assert_eq!(core.current_pattern().unwrap().pick_number, 0);
        assert_eq!(core.store.get_pattern("test.json").unwrap().pick_number, 0);

        core.jump_pick = Some(PickJump {
            total_pick_number: 3,
            pick_number: 3,
            pick_repeat_number: 1,
        });
        assert!(core.handle_next_pick_request().await.is_err());
        assert_eq!(core.current_pattern().unwrap().pick_number, 0);
        assert!(core.jump_pick.is_some());

        core.mode = Mode::Thread;
        assert!(core.handle_next_pick_request().await.is_err());
        assert_eq!(core.current_pattern().unwrap().end_number0, 0);

        let (near, far) = tokio::io::duplex(1024);
        let (_reader, writer) = split_loom_io(near, b'\n');
        let (mut loom, _loom_writer) = split_loom_io(far, b'\n');
        core.loom_writer = Some(writer);
        core.mode = Mode::Weave;
        assert!(core.handle_next_pick_request().await.unwrap());
        assert_eq!(loom.read_frame().await.unwrap().unwrap(), "C00000004");
        assert_eq!(core.current_pattern().unwrap().pick_number, 3);
        assert!(core.jump_pick.is_none());
        assert_eq!(core.store.get_pattern("test.json").unwrap().pick_number, 3);
    }

    #[tokio::test]
    async fn test_internal_error_is_reported_generically() {
        let mut config = SessionConfig::new(MOCK_PORT_NAME);
        config.motion_duration = Duration::from_millis(1);
        let store = BrokenClearStore(SqlitePatternStore::open_in_memory().unwrap());
        let session = LoomSession::new(Arc::new(ExampleLoom::new(8)), config, Box::new(store));
        let mut client = TestClient::connect(&session).await;

        let (_, done) = client.run(json!({"type": "clear_pattern_names"})).await;
        assert_eq!(done["success"], false);
        assert_eq!(
            done["message"],
            "clear_pattern_names failed unexpectedly; see the server log"
        );

        let (_, done) = client.run(json!({"type": "mode", "mode": 2})).await;
        assert_eq!(done["success"], true);
        assert!(!client.done.is_cancelled());
        session.close().await;
    }

    #[tokio::test]
    async fn test_handler_panic_closes_client() {
        let session = make_session_with_driver(Arc::new(PanickyLoom {
            inner: ExampleLoom::new(8),
            panic_on_replies: false,
        }));
        let mut client = TestClient::connect(&session).await;
        client.wait_connected().await;

        client.send(json!({"type": "direction", "forward": false}));
        let problem = client.read_until("CommandProblem").await;
        assert_eq!(problem["message"], "Client read loop failed; try refreshing");
        assert_eq!(problem["severity"], 3);
        loop {
            if let Outbound::Close { code, reason } = client.next().await {
                assert_eq!(code, CLOSE_ERROR);
                assert_eq!(reason, "internal error");
                break;
            }
        }
        tokio::time::timeout(TIMEOUT, client.done.cancelled())
            .await
            .unwrap();

        let mut next = TestClient::connect(&session).await;
        let (_, done) = next.run(json!({"type": "mode", "mode": 2})).await;
        assert_eq!(done["success"], true);
        session.close().await;
    }

    #[tokio::test]
    async fn test_loom_reply_panic_disconnects() {
        let session = make_session_with_driver(Arc::new(PanickyLoom {
            inner: ExampleLoom::new(8),
            panic_on_replies: true,
        }));
        let mut client = TestClient::connect(&session).await;
        client.wait_connected().await;

        let status = client.read_until("StatusMessage").await;
        assert_eq!(
            status["message"],
            "Server stopped listening to the loom: internal error"
        );
        let state = client.read_until("LoomConnectionState").await;
        assert_eq!(state["state"], 3);
        let state = client.read_until("LoomConnectionState").await;
        assert_eq!(state["state"], 0);

        {
            let core = session.core.lock().await;
            assert_eq!(core.connection_state(), ConnectionState::Disconnected);
            assert!(core.loom_writer.is_none());
        }
        let (_, done) = client.run(json!({"type": "mode", "mode": 2})).await;
        assert_eq!(done["success"], true);
        session.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_disconnects_first() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;
        client.wait_connected().await;

        session.core.lock().await.connect_to_loom().await.unwrap();
        let mut states = Vec::new();
        for _ in 0..4 {
            let state = client.read_until("LoomConnectionState").await;
            states.push(state["state"].as_u64().unwrap());
        }
        assert_eq!(states, vec![3, 0, 2, 1]);
        assert_eq!(
            session.core.lock().await.connection_state(),
            ConnectionState::Connected
        );
        session.close().await;
    }

    #[tokio::test]
    async fn test_huge_jump_is_bounded() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;
        client.upload_and_select("one.json", 1, 8).await;

        let (_, done) = client
            .run(json!({"type": "jump_to_pick", "totalPickNumber": i64::MAX}))
            .await;
        assert_eq!(done["success"], false);
        let (_, done) = client
            .run(json!({"type": "jump_to_end", "totalEndNumber0": i64::MAX}))
            .await;
        assert_eq!(done["success"], false);

        let (replies, done) = client
            .run(json!({"type": "jump_to_pick", "totalPickNumber": MAX_TOTAL_NUMBER}))
            .await;
        assert_eq!(done["success"], true);
        let jump = replies.iter().find(|r| r["type"] == "JumpPickNumber").unwrap();
        assert_eq!(jump["pickRepeatNumber"], MAX_TOTAL_NUMBER);

        client.run(json!({"type": "oobcommand", "command": "n"})).await;
        let current = client.read_until("CurrentPickNumber").await;
        assert_eq!(current["totalPickNumber"], MAX_TOTAL_NUMBER);

        loop {
            let state = client.read_until("ShaftState").await;
            if state["state"] == 1 && state["shaftWord"] == 1 {
                break;
            }
        }
        client.run(json!({"type": "oobcommand", "command": "n"})).await;
        let current = client.read_until("CurrentPickNumber").await;
        assert_eq!(current["totalPickNumber"], MAX_TOTAL_NUMBER + 1);
        assert_eq!(current["pickRepeatNumber"], MAX_TOTAL_NUMBER + 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_reupload_reloads_current_pattern() {
        let session = make_session();
        let mut client = TestClient::connect(&session).await;
        client.upload_and_select("grow.json", 4, 8).await;

        let (replies, done) = client
            .run(json!({"type": "upload", "name": "grow.json", "data": pattern_json(6, 12)}))
            .await;
        assert_eq!(done["success"], true);
        let pattern = replies.iter().find(|r| r["type"] == "ReducedPattern").unwrap();
        assert_eq!(pattern["picks"].as_array().unwrap().len(), 6);

        let core = session.core.lock().await;
        let current = core.current_pattern().unwrap();
        assert_eq!(current.num_picks(), 6);
        assert_eq!(current.num_ends(), 12);
        drop(core);

        let (replies, done) = client
            .run(json!({"type": "upload", "name": "other.json", "data": pattern_json(2, 4)}))
            .await;
        assert_eq!(done["success"], true);
        assert!(!replies.iter().any(|r| r["type"] == "ReducedPattern"));
        session.close().await;
    }

    #[test]
    fn test_summarize() {
        assert_eq!(summarize("short"), "short");
        let long = "x".repeat(200);
        assert_eq!(summarize(&long).len(), LOG_SUMMARY_LEN + 3);
    }
}
