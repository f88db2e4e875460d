//! Loom settings: validation, direction derivation and TOML persistence.
//!
//! The settings file is a flat TOML table whose keys match the `Settings`
//! reply sent to clients, e.g.
//!
//! ```toml
//! loomName = "example"
//! language = "English"
//! directionControl = 1
//! end1OnRight = true
//! threadGroupSize = 4
//! threadRightToLeft = true
//! threadBackToFront = true
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;

use crate::enums::DirectionControl;
use crate::error::SettingsError;
use crate::pattern::DEFAULT_THREAD_GROUP_SIZE;

/// Largest allowed thread group size.
pub const MAX_THREAD_GROUP_SIZE: usize = 10;

/// Language used when none is configured.
pub const DEFAULT_LANGUAGE: &str = "English";

/// What the loom can do, as far as settings are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoomCapabilities {
    /// The loom accepts direction changes from both sides.
    pub full_direction_control: bool,
}

impl LoomCapabilities {
    /// Direction control used when none is configured.
    pub fn default_direction_control(&self) -> DirectionControl {
        if self.full_direction_control {
            DirectionControl::Full
        } else {
            DirectionControl::Software
        }
    }

    /// Check a direction control value against this loom.
    pub fn check_direction_control(&self, value: DirectionControl) -> Result<(), SettingsError> {
        match (self.full_direction_control, value) {
            (true, DirectionControl::Full) | (false, DirectionControl::Loom | DirectionControl::Software) => Ok(()),
            (true, other) => Err(SettingsError::Invalid(format!(
                "directionControl {} not allowed: this loom only supports {}",
                u8::from(other),
                u8::from(DirectionControl::Full)
            ))),
            (false, other) => Err(SettingsError::Invalid(format!(
                "directionControl {} not allowed: this loom does not support full direction control",
                u8::from(other)
            ))),
        }
    }
}

/// User-editable loom settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub loom_name: String,
    pub language: String,
    pub direction_control: DirectionControl,
    pub end1_on_right: bool,
    /// Group size given to newly loaded patterns.
    pub thread_group_size: usize,
    pub thread_right_to_left: bool,
    pub thread_back_to_front: bool,
}

impl Settings {
    /// Default settings for a loom.
    pub fn for_loom(loom_name: impl Into<String>, capabilities: LoomCapabilities) -> Self {
        Self {
            loom_name: loom_name.into(),
            language: DEFAULT_LANGUAGE.to_string(),
            direction_control: capabilities.default_direction_control(),
            end1_on_right: true,
            thread_group_size: DEFAULT_THREAD_GROUP_SIZE,
            thread_right_to_left: true,
            thread_back_to_front: true,
        }
    }

    /// Check every field.
    pub fn validate(&self, capabilities: LoomCapabilities) -> Result<(), SettingsError> {
        check_thread_group_size(self.thread_group_size)?;
        capabilities.check_direction_control(self.direction_control)
    }

    /// Does threading run from low to high end numbers?
    ///
    /// `thread_forward` is the current software/loom direction.
    pub fn thread_low_to_high(&self, thread_forward: bool) -> bool {
        let mut low_to_high = self.thread_back_to_front == self.thread_right_to_left;
        if !self.end1_on_right {
            low_to_high = !low_to_high;
        }
        if !thread_forward {
            low_to_high = !low_to_high;
        }
        low_to_high
    }

    /// Build a copy with `updates` applied.
    ///
    /// Each key must name a settings field and carry a valid value; if any
    /// does not, nothing is applied.
    pub fn with_updates(
        &self,
        updates: &Map<String, Value>,
        capabilities: LoomCapabilities,
    ) -> Result<Settings, SettingsError> {
        let mut candidate = self.clone();
        for (key, value) in updates {
            match key.as_str() {
                "loomName" => {
                    let name = expect_str(key, value)?.trim();
                    if name.is_empty() {
                        return Err(SettingsError::Invalid("loomName must not be blank".into()));
                    }
                    candidate.loom_name = name.to_string();
                }
                "language" => candidate.language = expect_str(key, value)?.to_string(),
                "directionControl" => {
                    let code = expect_int(key, value)?;
                    let control = u8::try_from(code)
                        .map_err(|_| format!("invalid DirectionControl {code}"))
                        .and_then(DirectionControl::try_from)
                        .map_err(|msg| SettingsError::Invalid(format!("directionControl: {msg}")))?;
                    capabilities.check_direction_control(control)?;
                    candidate.direction_control = control;
                }
                "end1OnRight" => candidate.end1_on_right = expect_bool(key, value)?,
                "threadGroupSize" => {
                    let size = expect_int(key, value)?;
                    let size = usize::try_from(size).map_err(|_| group_size_error(size))?;
                    check_thread_group_size(size)?;
                    candidate.thread_group_size = size;
                }
                "threadRightToLeft" => candidate.thread_right_to_left = expect_bool(key, value)?,
                "threadBackToFront" => candidate.thread_back_to_front = expect_bool(key, value)?,
                other => {
                    return Err(SettingsError::Invalid(format!("unknown setting {other:?}")));
                }
            }
        }
        Ok(candidate)
    }

    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Read settings, falling back to defaults for a missing or bad file.
    ///
    /// A stored direction control the loom cannot honor, or an out-of-range
    /// group size, is replaced by its default.
    pub fn load_or_default(
        path: &Path,
        loom_name: &str,
        capabilities: LoomCapabilities,
    ) -> Self {
        let defaults = Self::for_loom(loom_name, capabilities);
        if !path.exists() {
            log::info!("No settings file at {}; using defaults", path.display());
            return defaults;
        }
        let mut settings = match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Could not read settings file {}: {}; using defaults", path.display(), e);
                return defaults;
            }
        };
        if let Err(e) = capabilities.check_direction_control(settings.direction_control) {
            log::warn!("{e}; using default direction control");
            settings.direction_control = defaults.direction_control;
        }
        if let Err(e) = check_thread_group_size(settings.thread_group_size) {
            log::warn!("{e}; using default thread group size");
            settings.thread_group_size = defaults.thread_group_size;
        }
        settings
    }

    /// Write settings to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Check a thread group size against `[1, MAX_THREAD_GROUP_SIZE]`.
pub fn check_thread_group_size(size: usize) -> Result<(), SettingsError> {
    if size < 1 || size > MAX_THREAD_GROUP_SIZE {
        return Err(group_size_error(size));
    }
    Ok(())
}

fn group_size_error(size: impl std::fmt::Display) -> SettingsError {
    SettingsError::Invalid(format!(
        "threadGroupSize {size} not in range [1, {MAX_THREAD_GROUP_SIZE}]"
    ))
}

fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str, SettingsError> {
    value
        .as_str()
        .ok_or_else(|| SettingsError::Invalid(format!("{key} must be a string, not {value}")))
}

fn expect_bool(key: &str, value: &Value) -> Result<bool, SettingsError> {
    value
        .as_bool()
        .ok_or_else(|| SettingsError::Invalid(format!("{key} must be a boolean, not {value}")))
}

fn expect_int(key: &str, value: &Value) -> Result<i64, SettingsError> {
    value
        .as_i64()
        .ok_or_else(|| SettingsError::Invalid(format!("{key} must be an integer, not {value}")))
}
