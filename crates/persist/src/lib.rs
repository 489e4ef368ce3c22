//! Keel persistence: observed state keyed by node id, behind an injected store.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use keel_core::{NodeId, NodeStatus, ObservedState};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::warn;

pub type StateMap = FxHashMap<NodeId, ObservedState>;

/// Durable home for `{generationSeen, remoteFingerprint, status}` per node.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<StateMap>;
    fn save(&self, id: &NodeId, state: &ObservedState) -> Result<()>;
    fn remove(&self, id: &NodeId) -> Result<()>;
}

/// Process-local store; state is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<StateMap>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<StateMap> {
        Ok(self.rows.lock().map_err(|_| anyhow!("memory store poisoned"))?.clone())
    }

    fn save(&self, id: &NodeId, state: &ObservedState) -> Result<()> {
        self.rows.lock().map_err(|_| anyhow!("memory store poisoned"))?.insert(id.clone(), state.clone());
        Ok(())
    }

    fn remove(&self, id: &NodeId) -> Result<()> {
        self.rows.lock().map_err(|_| anyhow!("memory store poisoned"))?.remove(id);
        Ok(())
    }
}

/// SQLite-backed store. Simple, synchronous; one small row per node.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS observed_state (
                id          TEXT PRIMARY KEY,
                generation  INTEGER NOT NULL,
                fingerprint TEXT,
                status      TEXT NOT NULL,
                ts          INTEGER NOT NULL
            )",
            [],
        ).context("creating observed_state table")?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection poisoned"))
    }
}

impl StateStore for SqliteStore {
    fn load(&self) -> Result<StateMap> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT id, generation, fingerprint, status FROM observed_state")?;
        let mut rows = stmt.query([])?;
        let mut out = StateMap::default();
        while let Some(row) = rows.next()? {
            let id_s: String = row.get(0)?;
            let generation: i64 = row.get(1)?;
            let fingerprint: Option<String> = row.get(2)?;
            let status_s: String = row.get(3)?;
            // Skip rows written by something else rather than failing the whole load.
            let Ok(id) = id_s.parse::<NodeId>() else {
                warn!(id = %id_s, "skipping observed_state row with malformed id");
                continue;
            };
            let status = match status_s.parse::<NodeStatus>() {
                Ok(s) => s,
                Err(e) => {
                    warn!(node = %id, error = %e, "unreadable status; treating as unknown");
                    NodeStatus::Unknown
                }
            };
            out.insert(id, ObservedState { generation_seen: generation.max(0) as u64, remote_fingerprint: fingerprint, status });
        }
        histogram!("persist_load_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn save(&self, id: &NodeId, state: &ObservedState) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO observed_state(id, generation, fingerprint, status, ts) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                generation = excluded.generation,
                fingerprint = excluded.fingerprint,
                status = excluded.status,
                ts = excluded.ts",
            (
                id.to_string(),
                state.generation_seen as i64,
                state.remote_fingerprint.as_deref(),
                state.status.as_str(),
                now_ts(),
            ),
        )?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn remove(&self, id: &NodeId) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM observed_state WHERE id = ?1", [id.to_string()])?;
        counter!("persist_remove_total", 1u64);
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "keel.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}
