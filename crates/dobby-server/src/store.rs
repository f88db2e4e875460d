//! Pattern history, persisted in SQLite.
//!
//! Each stored pattern keeps its cursor in dedicated columns so position
//! updates do not rewrite the pattern JSON. Patterns are ordered by last
//! use; the most recently used one is restored at startup.

use dobby_core::ReducedPattern;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::StoreError;

/// Number of patterns the server keeps.
pub const MAX_PATTERNS: usize = 25;

/// Fewest patterns pruning will leave.
const MIN_RETAINED: usize = 2;

/// Storage for uploaded patterns and their positions.
pub trait PatternStore: Send {
    /// Names ordered from least to most recently used.
    fn pattern_names(&self) -> Result<Vec<String>, StoreError>;

    fn get_pattern(&self, name: &str) -> Result<ReducedPattern, StoreError>;

    /// Add a pattern, replacing any with the same name, then prune the
    /// oldest entries beyond `max_entries` (0 disables pruning).
    fn add_pattern(&mut self, pattern: &ReducedPattern, max_entries: usize)
        -> Result<(), StoreError>;

    fn update_pick_position(
        &mut self,
        name: &str,
        pick_number: usize,
        pick_repeat_number: i64,
    ) -> Result<(), StoreError>;

    fn update_end_position(
        &mut self,
        name: &str,
        end_number0: usize,
        end_number1: usize,
        end_repeat_number: i64,
    ) -> Result<(), StoreError>;

    fn update_thread_group_size(&mut self, name: &str, size: usize) -> Result<(), StoreError>;

    fn update_separate_weaving_repeats(&mut self, name: &str, separate: bool)
        -> Result<(), StoreError>;

    fn update_separate_threading_repeats(
        &mut self,
        name: &str,
        separate: bool,
    ) -> Result<(), StoreError>;

    /// Remove every pattern.
    fn clear(&mut self) -> Result<(), StoreError>;
}

/// [`PatternStore`] backed by a SQLite database.
pub struct SqlitePatternStore {
    conn: Connection,
}

impl SqlitePatternStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Delete any existing database at `path`, then open a fresh one.
    pub fn open_reset(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            log::info!("Resetting pattern database {}", path.display());
            std::fs::remove_file(path)?;
        }
        Self::open(path)
    }

    /// A database that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS patterns (
                id INTEGER PRIMARY KEY,
                pattern_name TEXT NOT NULL,
                pattern_json TEXT NOT NULL,
                pick_number INTEGER NOT NULL,
                pick_repeat_number INTEGER NOT NULL,
                end_number0 INTEGER NOT NULL,
                end_number1 INTEGER NOT NULL,
                end_repeat_number INTEGER NOT NULL,
                thread_group_size INTEGER NOT NULL,
                separate_weaving_repeats INTEGER NOT NULL,
                separate_threading_repeats INTEGER NOT NULL,
                timestamp_sec REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_name ON patterns(pattern_name);
            "#,
        )?;
        Ok(Self { conn })
    }

    /// A timestamp later than every stored one, so the row just touched
    /// sorts last even within one clock tick.
    fn next_timestamp(&self) -> Result<f64, StoreError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let latest: Option<f64> =
            self.conn
                .query_row("SELECT MAX(timestamp_sec) FROM patterns", [], |row| row.get(0))?;
        Ok(match latest {
            Some(latest) if latest >= now => latest + 0.001,
            _ => now,
        })
    }

    fn update(&mut self, name: &str, set_clause: &str, value: i64) -> Result<(), StoreError> {
        let timestamp = self.next_timestamp()?;
        let sql = format!(
            "UPDATE patterns SET {set_clause} = ?1, timestamp_sec = ?2 WHERE pattern_name = ?3"
        );
        let changed = self.conn.execute(&sql, params![value, timestamp, name])?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }
}

impl PatternStore for SqlitePatternStore {
    fn pattern_names(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT pattern_name FROM patterns ORDER BY timestamp_sec ASC, id ASC")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn get_pattern(&self, name: &str) -> Result<ReducedPattern, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT pattern_json, pick_number, pick_repeat_number, end_number0, end_number1, \
                 end_repeat_number, thread_group_size, separate_weaving_repeats, \
                 separate_threading_repeats FROM patterns WHERE pattern_name = ?1 \
                 ORDER BY id DESC LIMIT 1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, bool>(8)?,
                    ))
                },
            )
            .optional()?;
        let Some((json, pick, pick_repeat, end0, end1, end_repeat, group, sep_weave, sep_thread)) =
            row
        else {
            return Err(StoreError::NotFound(name.to_string()));
        };

        let mut pattern: ReducedPattern = serde_json::from_str(&json)?;
        pattern.pick_number = pick.max(0) as usize;
        pattern.pick_repeat_number = pick_repeat;
        pattern.end_number0 = end0.max(0) as usize;
        pattern.end_number1 = end1.max(0) as usize;
        pattern.end_repeat_number = end_repeat;
        pattern.thread_group_size = group.max(1) as usize;
        pattern.separate_weaving_repeats = sep_weave;
        pattern.separate_threading_repeats = sep_thread;
        if let Err(e) = pattern.validate() {
            log::warn!("Stored pattern {:?} has an invalid position ({}); rewinding it", name, e);
            pattern.pick_number = 0;
            pattern.pick_repeat_number = 1;
            pattern.end_number0 = 0;
            pattern.end_number1 = 0;
            pattern.end_repeat_number = 1;
        }
        Ok(pattern)
    }

    fn add_pattern(
        &mut self,
        pattern: &ReducedPattern,
        max_entries: usize,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(pattern)?;
        let timestamp = self.next_timestamp()?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM patterns WHERE pattern_name = ?1",
            params![pattern.name],
        )?;
        tx.execute(
            "INSERT INTO patterns (pattern_name, pattern_json, pick_number, pick_repeat_number, \
             end_number0, end_number1, end_repeat_number, thread_group_size, \
             separate_weaving_repeats, separate_threading_repeats, timestamp_sec) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                pattern.name,
                json,
                pattern.pick_number as i64,
                pattern.pick_repeat_number,
                pattern.end_number0 as i64,
                pattern.end_number1 as i64,
                pattern.end_repeat_number,
                pattern.thread_group_size as i64,
                pattern.separate_weaving_repeats,
                pattern.separate_threading_repeats,
                timestamp,
            ],
        )?;
        if max_entries > 0 {
            let keep = max_entries.max(MIN_RETAINED) as i64;
            tx.execute(
                "DELETE FROM patterns WHERE id NOT IN \
                 (SELECT id FROM patterns ORDER BY timestamp_sec DESC, id DESC LIMIT ?1)",
                params![keep],
            )?;
        }
        tx.commit()?;
        log::debug!("Stored pattern {:?}", pattern.name);
        Ok(())
    }

    fn update_pick_position(
        &mut self,
        name: &str,
        pick_number: usize,
        pick_repeat_number: i64,
    ) -> Result<(), StoreError> {
        let timestamp = self.next_timestamp()?;
        let changed = self.conn.execute(
            "UPDATE patterns SET pick_number = ?1, pick_repeat_number = ?2, timestamp_sec = ?3 \
             WHERE pattern_name = ?4",
            params![pick_number as i64, pick_repeat_number, timestamp, name],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn update_end_position(
        &mut self,
        name: &str,
        end_number0: usize,
        end_number1: usize,
        end_repeat_number: i64,
    ) -> Result<(), StoreError> {
        let timestamp = self.next_timestamp()?;
        let changed = self.conn.execute(
            "UPDATE patterns SET end_number0 = ?1, end_number1 = ?2, end_repeat_number = ?3, \
             timestamp_sec = ?4 WHERE pattern_name = ?5",
            params![
                end_number0 as i64,
                end_number1 as i64,
                end_repeat_number,
                timestamp,
                name
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    fn update_thread_group_size(&mut self, name: &str, size: usize) -> Result<(), StoreError> {
        self.update(name, "thread_group_size", size as i64)
    }

    fn update_separate_weaving_repeats(
        &mut self,
        name: &str,
        separate: bool,
    ) -> Result<(), StoreError> {
        self.update(name, "separate_weaving_repeats", separate as i64)
    }

    fn update_separate_threading_repeats(
        &mut self,
        name: &str,
        separate: bool,
    ) -> Result<(), StoreError> {
        self.update(name, "separate_threading_repeats", separate as i64)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM patterns", [])?;
        Ok(())
    }
}
