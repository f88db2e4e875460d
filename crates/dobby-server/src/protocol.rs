//! Client wire protocol: JSON commands in, JSON replies out.
//!
//! Every message is a JSON object whose `type` field names its kind.
//! Commands use snake_case type names, replies use PascalCase.

use dobby_core::{
    ConnectionState, Mode, ReducedPattern, Settings, Severity, ShaftState, ShaftWord,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Type names of all known commands.
pub const COMMAND_TYPES: &[&str] = &[
    "upload",
    "select_pattern",
    "mode",
    "jump_to_pick",
    "jump_to_end",
    "direction",
    "settings",
    "thread_group_size",
    "separate_threading_repeats",
    "separate_weaving_repeats",
    "clear_pattern_names",
    "oobcommand",
];

/// A command from the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    /// Upload a pattern file.
    Upload { name: String, data: String },
    /// Make a stored pattern current.
    SelectPattern { name: String },
    Mode { mode: Mode },
    /// Set (or with `null` clear) the pending pick jump.
    JumpToPick { total_pick_number: Option<i64> },
    /// Set (or with `null` clear) the pending end jump.
    JumpToEnd { total_end_number0: Option<i64> },
    /// Set the weaving/threading direction.
    Direction { forward: bool },
    /// Change any subset of the settings.
    Settings(Map<String, Value>),
    ThreadGroupSize { group_size: i64 },
    SeparateThreadingRepeats { separate: bool },
    SeparateWeavingRepeats { separate: bool },
    ClearPatternNames,
    /// Out-of-band command for the mock loom.
    Oobcommand { command: String },
}

/// Outcome of decoding one client message.
#[derive(Debug)]
pub enum Decoded {
    Command(Command),
    /// Not JSON at all; ignored.
    NotJson(String),
    /// JSON without a string `type` field.
    MissingType(String),
    /// A command that cannot be run: unknown type or bad fields.
    Rejected { cmd_type: String, message: String },
}

/// Decode one client text message.
pub fn decode_command(text: &str) -> Decoded {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Decoded::NotJson(e.to_string()),
    };
    let Some(cmd_type) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        return Decoded::MissingType(format!("invalid command; no 'type' field: {value}"));
    };
    if !COMMAND_TYPES.contains(&cmd_type.as_str()) {
        return Decoded::Rejected {
            message: format!("unknown command type {cmd_type:?}"),
            cmd_type,
        };
    }
    match serde_json::from_value(value) {
        Ok(command) => Decoded::Command(command),
        Err(e) => Decoded::Rejected {
            message: format!("invalid {cmd_type} command: {e}"),
            cmd_type,
        },
    }
}

impl Command {
    /// The wire type name.
    pub fn cmd_type(&self) -> &'static str {
        match self {
            Command::Upload { .. } => "upload",
            Command::SelectPattern { .. } => "select_pattern",
            Command::Mode { .. } => "mode",
            Command::JumpToPick { .. } => "jump_to_pick",
            Command::JumpToEnd { .. } => "jump_to_end",
            Command::Direction { .. } => "direction",
            Command::Settings(_) => "settings",
            Command::ThreadGroupSize { .. } => "thread_group_size",
            Command::SeparateThreadingRepeats { .. } => "separate_threading_repeats",
            Command::SeparateWeavingRepeats { .. } => "separate_weaving_repeats",
            Command::ClearPatternNames => "clear_pattern_names",
            Command::Oobcommand { .. } => "oobcommand",
        }
    }
}

/// Static description of the loom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoomInfo {
    pub name: String,
    pub num_shafts: usize,
    pub serial_port: String,
    pub is_mock: bool,
}

/// A reply to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Reply {
    /// Terminal reply for every command.
    CommandDone {
        cmd_type: String,
        success: bool,
        message: String,
    },
    CommandProblem {
        message: String,
        severity: Severity,
    },
    StatusMessage {
        message: String,
        severity: Severity,
    },
    LoomConnectionState {
        state: ConnectionState,
        reason: String,
    },
    LoomInfo(LoomInfo),
    Settings(Settings),
    Mode {
        mode: Mode,
    },
    PatternNames {
        names: Vec<String>,
    },
    ReducedPattern(ReducedPattern),
    CurrentPickNumber {
        total_pick_number: i64,
        pick_number: usize,
        pick_repeat_number: i64,
    },
    CurrentEndNumber {
        total_end_number0: i64,
        total_end_number1: i64,
        end_number0: usize,
        end_number1: usize,
        end_repeat_number: i64,
    },
    JumpPickNumber {
        total_pick_number: Option<i64>,
        pick_number: Option<usize>,
        pick_repeat_number: Option<i64>,
    },
    JumpEndNumber {
        total_end_number0: Option<i64>,
        total_end_number1: Option<i64>,
        end_number0: Option<usize>,
        end_number1: Option<usize>,
        end_repeat_number: Option<i64>,
    },
    ShaftState {
        state: ShaftState,
        shaft_word: ShaftWord,
    },
    Direction {
        forward: bool,
    },
    ThreadGroupSize {
        group_size: usize,
    },
    SeparateThreadingRepeats {
        separate: bool,
    },
    SeparateWeavingRepeats {
        separate: bool,
    },
}

impl Reply {
    pub fn command_done(cmd_type: impl Into<String>, result: Result<(), String>) -> Self {
        let (success, message) = match result {
            Ok(()) => (true, String::new()),
            Err(message) => (false, message),
        };
        Reply::CommandDone {
            cmd_type: cmd_type.into(),
            success,
            message,
        }
    }

    pub fn to_json(&self) -> String {
        // Replies hold only strings, integers and booleans.
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to encode reply {:?}: {}", self, e);
            String::from("{}")
        })
    }
}

/// A pick jump waiting for the next pick request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PickJump {
    pub total_pick_number: i64,
    pub pick_number: usize,
    pub pick_repeat_number: i64,
}

/// An end jump waiting for the next pick request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndJump {
    pub total_end_number0: i64,
    pub total_end_number1: i64,
    pub end_number0: usize,
    pub end_number1: usize,
    pub end_repeat_number: i64,
}

impl From<Option<PickJump>> for Reply {
    fn from(jump: Option<PickJump>) -> Self {
        Reply::JumpPickNumber {
            total_pick_number: jump.map(|j| j.total_pick_number),
            pick_number: jump.map(|j| j.pick_number),
            pick_repeat_number: jump.map(|j| j.pick_repeat_number),
        }
    }
}

impl From<Option<EndJump>> for Reply {
    fn from(jump: Option<EndJump>) -> Self {
        Reply::JumpEndNumber {
            total_end_number0: jump.map(|j| j.total_end_number0),
            total_end_number1: jump.map(|j| j.total_end_number1),
            end_number0: jump.map(|j| j.end_number0),
            end_number1: jump.map(|j| j.end_number1),
            end_repeat_number: jump.map(|j| j.end_repeat_number),
        }
    }
}
