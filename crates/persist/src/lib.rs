//! Last-known user state. One row per user, replaced only after a submission's shards
//! all acknowledged; writes for the same user are serialized by the connection lock.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use heatgrid_core::{Action, CellId, UserLastState};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Get/set of the single open state per user. Absence is a normal answer, not an error.
pub trait LastStateStore: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<UserLastState>>;
    /// Upsert keyed by user id.
    fn set(&self, state: &UserLastState) -> Result<()>;
}

fn decode_row(user_id: &str, cell: i64, action: i64) -> Result<UserLastState> {
    let code = u8::try_from(action).map_err(|_| anyhow!("action code out of range: {}", action))?;
    let action = Action::try_from(code).with_context(|| format!("decoding stored action for {}", user_id))?;
    if !action.is_increment() {
        bail!("stored action for {} is not an increment: {:?}", user_id, action);
    }
    Ok(UserLastState { user_id: user_id.to_string(), cell: CellId(cell as u64), category: action.category() })
}

/// SQLite-backed store. Simple, synchronous; a single row write per submission.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// `HEATGRID_DB_PATH` when set, else `~/.heatgrid/heatgrid.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var_os("HEATGRID_DB_PATH").filter(|p| !p.is_empty()).map(PathBuf::from);
        Self::open(path.unwrap_or_else(default_db_path))
    }

    /// Opens (creating parent directories and the table as needed) the file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let started = std::time::Instant::now();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path.display()))?;
        Self::init(db, started)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db, std::time::Instant::now())
    }

    fn init(db: rusqlite::Connection, started: std::time::Instant) -> Result<Self> {
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS last_user_state (
                user_id TEXT PRIMARY KEY NOT NULL,
                cell    INTEGER NOT NULL,
                action  INTEGER NOT NULL
            )",
            [],
        )
        .context("creating last_user_state table")?;
        histogram!("laststate_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

impl LastStateStore for SqliteStore {
    fn get(&self, user_id: &str) -> Result<Option<UserLastState>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let row: Option<(i64, i64)> = db
            .query_row(
                "SELECT cell, action FROM last_user_state WHERE user_id = ?1",
                [user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("reading last state for {}", user_id))?;
        histogram!("laststate_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        match row {
            Some((cell, action)) => decode_row(user_id, cell, action).map(Some),
            None => {
                debug!(user = %user_id, "no last user state");
                Ok(None)
            }
        }
    }

    fn set(&self, state: &UserLastState) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO last_user_state (user_id, cell, action) VALUES (?1, ?2, ?3)
             ON CONFLICT (user_id) DO UPDATE SET cell = excluded.cell, action = excluded.action",
            (&state.user_id, state.cell.0 as i64, state.action().code() as i64),
        )
        .with_context(|| format!("writing last state for {}", state.user_id))?;
        histogram!("laststate_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("laststate_put_total", 1u64);
        Ok(())
    }
}

/// Map-backed store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<FxHashMap<String, UserLastState>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_state(state: UserLastState) -> Self {
        let me = Self::default();
        if let Ok(mut rows) = me.rows.lock() {
            rows.insert(state.user_id.clone(), state);
        }
        me
    }

    pub fn len(&self) -> usize { self.rows.lock().map(|r| r.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl LastStateStore for MemoryStore {
    fn get(&self, user_id: &str) -> Result<Option<UserLastState>> {
        let rows = self.rows.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        Ok(rows.get(user_id).cloned())
    }

    fn set(&self, state: &UserLastState) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        rows.insert(state.user_id.clone(), state.clone());
        Ok(())
    }
}

/// `~/.heatgrid/heatgrid.db`; `./heatgrid.db` when `HOME` is unset.
fn default_db_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".heatgrid").join("heatgrid.db"),
        None => PathBuf::from("heatgrid.db"),
    }
}
