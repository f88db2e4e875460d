//! The reduced pattern: what the server needs to weave or thread, plus the
//! cursor that tracks progress through it.
//!
//! Picks are 1-based (`pick_number == 0` means nothing woven yet, shown as
//! `pick0`). Ends are selected in groups as the inclusive 1-based range
//! `end_number0..=end_number1`; `end_number0 == 0` means no ends selected.
//! Threading entries are 0-based shaft indices, -1 meaning "not threaded".
//! In a shaft word bit 0 is shaft 1.

use serde::{Deserialize, Serialize};

use crate::error::{CursorError, PatternError};

/// Patterns longer than this separate repeats by default.
pub const NUM_ITEMS_FOR_REPEAT_SEPARATOR: usize = 20;

/// Default number of ends threaded at once.
pub const DEFAULT_THREAD_GROUP_SIZE: usize = 4;

/// Highest shaft count a shaft word can describe.
pub const MAX_SHAFTS: usize = 32;

/// Bit mask of raised shafts.
pub type ShaftWord = u32;

/// One weft pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pick {
    /// Index into the pattern's color table.
    #[serde(rename = "color", alias = "colorIndex")]
    pub color_index: i32,
    pub shaft_word: ShaftWord,
}

fn one() -> i64 {
    1
}

fn default_thread_group_size() -> usize {
    DEFAULT_THREAD_GROUP_SIZE
}

/// A pattern reduced to colors, threading and shaft words, with its cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducedPattern {
    pub name: String,
    /// Colors as `#rrggbb`.
    #[serde(default)]
    pub color_table: Vec<String>,
    #[serde(default)]
    pub warp_colors: Vec<i32>,
    pub threading: Vec<i32>,
    pub picks: Vec<Pick>,
    pub pick0: Pick,
    #[serde(default)]
    pub pick_number: usize,
    #[serde(default = "one")]
    pub pick_repeat_number: i64,
    #[serde(default)]
    pub end_number0: usize,
    #[serde(default)]
    pub end_number1: usize,
    #[serde(default = "one")]
    pub end_repeat_number: i64,
    #[serde(default = "default_thread_group_size")]
    pub thread_group_size: usize,
    #[serde(default)]
    pub separate_weaving_repeats: bool,
    #[serde(default)]
    pub separate_threading_repeats: bool,
}

impl ReducedPattern {
    /// Create a pattern with its cursor at the very start.
    pub fn new(
        name: impl Into<String>,
        color_table: Vec<String>,
        warp_colors: Vec<i32>,
        threading: Vec<i32>,
        picks: Vec<Pick>,
        pick0: Pick,
    ) -> Self {
        let mut pattern = Self {
            name: name.into(),
            color_table,
            warp_colors,
            threading,
            picks,
            pick0,
            pick_number: 0,
            pick_repeat_number: 1,
            end_number0: 0,
            end_number1: 0,
            end_repeat_number: 1,
            thread_group_size: DEFAULT_THREAD_GROUP_SIZE,
            separate_weaving_repeats: false,
            separate_threading_repeats: false,
        };
        pattern.reset_cursor(DEFAULT_THREAD_GROUP_SIZE);
        pattern
    }

    /// Move the cursor to the start and apply the default repeat separation.
    pub fn reset_cursor(&mut self, thread_group_size: usize) {
        self.pick_number = 0;
        self.pick_repeat_number = 1;
        self.end_number0 = 0;
        self.end_number1 = 0;
        self.end_repeat_number = 1;
        self.thread_group_size = thread_group_size.max(1);
        self.separate_weaving_repeats = self.picks.len() > NUM_ITEMS_FOR_REPEAT_SEPARATOR;
        self.separate_threading_repeats = self.threading.len() > NUM_ITEMS_FOR_REPEAT_SEPARATOR;
    }

    /// Check that the pattern can be woven and its cursor is consistent.
    pub fn validate(&self) -> Result<(), PatternError> {
        if self.picks.is_empty() {
            return Err(PatternError::Invalid("pattern has no picks".into()));
        }
        if self.threading.is_empty() {
            return Err(PatternError::Invalid("pattern has no threading".into()));
        }
        if let Some(bad) = self
            .threading
            .iter()
            .find(|&&shaft| shaft < -1 || shaft >= MAX_SHAFTS as i32)
        {
            return Err(PatternError::Invalid(format!(
                "threading shaft index {bad} not in range [-1, {})",
                MAX_SHAFTS
            )));
        }
        if self.thread_group_size < 1 {
            return Err(PatternError::Invalid("thread group size must be at least 1".into()));
        }
        self.check_pick_number(self.pick_number)
            .and_then(|_| self.check_end_numbers(self.end_number0, self.end_number1))
            .map_err(|err| PatternError::Invalid(err.to_string()))
    }

    // --- Picks ---

    /// Number of picks in one repeat.
    pub fn num_picks(&self) -> usize {
        self.picks.len()
    }

    /// Get a pick by number; 0 is `pick0`.
    pub fn get_pick(&self, pick_number: usize) -> Result<&Pick, CursorError> {
        self.check_pick_number(pick_number)?;
        if pick_number == 0 {
            Ok(&self.pick0)
        } else {
            Ok(&self.picks[pick_number - 1])
        }
    }

    /// The pick at the cursor.
    pub fn current_pick(&self) -> &Pick {
        self.get_pick(self.pick_number).unwrap_or(&self.pick0)
    }

    /// Pick count across repeats for the cursor position.
    pub fn total_pick_number(&self) -> i64 {
        (self.picks.len() as i64)
            .saturating_mul(self.pick_repeat_number.saturating_sub(1))
            .saturating_add(self.pick_number as i64)
    }

    /// Compute the position one pick forward or backward from the cursor.
    ///
    /// Returns `(pick_number, pick_repeat_number)`. Leaving the last pick
    /// always starts the next repeat, at 0 if weaving repeats are separated
    /// and at 1 otherwise.
    pub fn compute_next_pick(&self, forward: bool) -> Result<(usize, i64), CursorError> {
        self.check_pick_number(self.pick_number)?;
        if self.picks.is_empty() {
            return Err(CursorError::OutOfRange("pattern has no picks".into()));
        }
        let pick = self.pick_number;
        let repeat = self.pick_repeat_number;
        let len = self.picks.len();
        let separate = self.separate_weaving_repeats;

        if forward {
            if pick == len {
                return Ok((if separate { 0 } else { 1 }, next_repeat(repeat)?));
            }
            return Ok((pick + 1, repeat));
        }

        if pick == 0 && repeat == 1 {
            return Err(CursorError::StartOfSequence);
        }
        if pick == 1 && (separate || repeat == 1) {
            Ok((0, repeat))
        } else if pick == 0 || (pick == 1 && !separate) {
            Ok((len, repeat - 1))
        } else {
            Ok((pick - 1, repeat))
        }
    }

    /// Step the cursor one pick.
    pub fn increment_pick_number(&mut self, forward: bool) -> Result<(), CursorError> {
        let (pick_number, pick_repeat_number) = self.compute_next_pick(forward)?;
        self.pick_number = pick_number;
        self.pick_repeat_number = pick_repeat_number;
        Ok(())
    }

    /// Set the pick number within the current repeat.
    pub fn set_current_pick_number(&mut self, pick_number: usize) -> Result<(), CursorError> {
        self.check_pick_number(pick_number)?;
        self.pick_number = pick_number;
        Ok(())
    }

    /// Set both the pick number and its repeat number.
    pub fn set_current_pick_position(
        &mut self,
        pick_number: usize,
        pick_repeat_number: i64,
    ) -> Result<(), CursorError> {
        self.set_current_pick_number(pick_number)?;
        self.pick_repeat_number = pick_repeat_number;
        Ok(())
    }

    fn check_pick_number(&self, pick_number: usize) -> Result<(), CursorError> {
        if pick_number > self.picks.len() {
            return Err(CursorError::OutOfRange(format!(
                "pick number {pick_number} not in range [0, {}]",
                self.picks.len()
            )));
        }
        Ok(())
    }

    // --- Ends ---

    /// Number of ends in one repeat.
    pub fn num_ends(&self) -> usize {
        self.threading.len()
    }

    /// Totals for `end_number0` and `end_number1` across repeats.
    pub fn total_end_numbers(&self) -> (i64, i64) {
        let base = (self.threading.len() as i64)
            .saturating_mul(self.end_repeat_number.saturating_sub(1));
        (
            base.saturating_add(self.end_number0 as i64),
            base.saturating_add(self.end_number1 as i64),
        )
    }

    /// The last end of the group that starts at `end_number0`.
    pub fn compute_end_number1(&self, end_number0: usize) -> usize {
        if end_number0 == 0 {
            return 0;
        }
        (end_number0 + self.thread_group_size - 1).min(self.threading.len())
    }

    /// Compute the next group of ends from the cursor.
    ///
    /// Returns `(end_number0, end_number1, end_repeat_number)`.
    pub fn compute_next_end_numbers(
        &self,
        thread_low_to_high: bool,
    ) -> Result<(usize, usize, i64), CursorError> {
        self.check_end_numbers(self.end_number0, self.end_number1)?;
        if self.threading.is_empty() {
            return Err(CursorError::OutOfRange("pattern has no threading".into()));
        }
        let end0 = self.end_number0;
        let end1 = self.end_number1;
        let repeat = self.end_repeat_number;
        let max_end = self.threading.len();
        let group = self.thread_group_size.max(1);
        let separate = self.separate_threading_repeats;

        if thread_low_to_high {
            let (next0, next_repeat) = if end0 == 0 {
                (1, repeat)
            } else if end1 < max_end {
                (end1 + 1, repeat)
            } else {
                (if separate { 0 } else { 1 }, next_repeat(repeat)?)
            };
            return Ok((next0, self.compute_end_number1(next0), next_repeat));
        }

        if end0 == 0 && repeat == 1 {
            return Err(CursorError::StartOfSequence);
        }
        if end0 == 1 && (separate || repeat == 1) {
            Ok((0, 0, repeat))
        } else if end0 == 0 || (end0 == 1 && !separate) {
            let next0 = (max_end + 1).saturating_sub(group).max(1);
            Ok((next0, max_end, repeat - 1))
        } else {
            let next0 = end0.saturating_sub(group).max(1);
            Ok((next0, end0 - 1, repeat))
        }
    }

    /// Step the cursor one group of ends.
    pub fn increment_end_numbers(&mut self, thread_low_to_high: bool) -> Result<(), CursorError> {
        let (end0, end1, repeat) = self.compute_next_end_numbers(thread_low_to_high)?;
        self.end_number0 = end0;
        self.end_number1 = end1;
        self.end_repeat_number = repeat;
        Ok(())
    }

    /// Set the current group of ends.
    ///
    /// If `end_number1` is `None` it is computed from the group size.
    pub fn set_current_end_number(
        &mut self,
        end_number0: usize,
        end_number1: Option<usize>,
    ) -> Result<(), CursorError> {
        let end_number1 = end_number1.unwrap_or_else(|| self.compute_end_number1(end_number0));
        self.check_end_numbers(end_number0, end_number1)?;
        self.end_number0 = end_number0;
        self.end_number1 = end_number1;
        Ok(())
    }

    /// Set the current group of ends and its repeat number.
    pub fn set_current_end_position(
        &mut self,
        end_number0: usize,
        end_number1: Option<usize>,
        end_repeat_number: i64,
    ) -> Result<(), CursorError> {
        self.set_current_end_number(end_number0, end_number1)?;
        self.end_repeat_number = end_repeat_number;
        Ok(())
    }

    /// Change the group size, regrouping the current ends from `end_number0`.
    pub fn set_thread_group_size(&mut self, thread_group_size: usize) -> Result<(), CursorError> {
        if thread_group_size < 1 {
            return Err(CursorError::OutOfRange(format!(
                "thread group size {thread_group_size} must be at least 1"
            )));
        }
        self.thread_group_size = thread_group_size;
        self.end_number1 = self.compute_end_number1(self.end_number0);
        Ok(())
    }

    /// Shafts to raise for the current group of ends.
    pub fn threading_shaft_word(&self) -> ShaftWord {
        self.ends_shaft_word(self.end_number0, self.end_number1)
    }

    /// Shafts to raise for the group of ends `end_number0..=end_number1`.
    pub fn shaft_word_for_ends(
        &self,
        end_number0: usize,
        end_number1: usize,
    ) -> Result<ShaftWord, CursorError> {
        self.check_end_numbers(end_number0, end_number1)?;
        Ok(self.ends_shaft_word(end_number0, end_number1))
    }

    fn ends_shaft_word(&self, end_number0: usize, end_number1: usize) -> ShaftWord {
        if end_number0 == 0 {
            return 0;
        }
        let end1 = end_number1.min(self.threading.len());
        let start = (end_number0 - 1).min(end1);
        self.threading[start..end1]
            .iter()
            .filter(|&&shaft| shaft >= 0)
            .fold(0, |word, &shaft| {
                word | 1u32.checked_shl(shaft as u32).unwrap_or(0)
            })
    }

    fn check_end_numbers(&self, end_number0: usize, end_number1: usize) -> Result<(), CursorError> {
        let max_end = self.threading.len();
        if end_number0 > max_end {
            return Err(CursorError::OutOfRange(format!(
                "end number 0 = {end_number0} not in range [0, {max_end}]"
            )));
        }
        if end_number0 == 0 {
            if end_number1 != 0 {
                return Err(CursorError::OutOfRange(format!(
                    "end number 1 = {end_number1} must be 0 when end number 0 is 0"
                )));
            }
        } else if end_number1 < end_number0 || end_number1 > max_end {
            return Err(CursorError::OutOfRange(format!(
                "end number 1 = {end_number1} not in range [{end_number0}, {max_end}]"
            )));
        }
        Ok(())
    }
}

fn next_repeat(repeat: i64) -> Result<i64, CursorError> {
    repeat
        .checked_add(1)
        .ok_or_else(|| CursorError::OutOfRange(format!("repeat number {repeat} is too large")))
}

/// Convert 1-based shaft numbers to a shaft word; 0 and numbers past
/// [`MAX_SHAFTS`] are ignored.
pub fn shaft_word_from_shaft_set<I: IntoIterator<Item = usize>>(shafts: I) -> ShaftWord {
    shafts
        .into_iter()
        .filter(|&shaft| shaft > 0 && shaft <= MAX_SHAFTS)
        .fold(0, |word, shaft| word | (1 << (shaft - 1)))
}

/// Convert a shaft word to the sorted list of raised 1-based shaft numbers.
pub fn shaft_set_from_shaft_word(word: ShaftWord) -> Vec<usize> {
    (0..MAX_SHAFTS)
        .filter(|bit| word & (1 << bit) != 0)
        .map(|bit| bit + 1)
        .collect()
}
