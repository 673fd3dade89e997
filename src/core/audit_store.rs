//! Append-only audit trail of isolation state transitions.
//!
//! During an episode the trail lives in an [`AuditLog`], a shared in-memory
//! handle whose appends are serialized by a single lock. After the episode the
//! records are persisted through an [`AuditSink`]: newline-delimited JSON or
//! SQLite.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::domain::{ActionId, ActionState, TransitionRecord};

/// Shared handle to the in-memory audit trail
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    records: Arc<Mutex<Vec<TransitionRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TransitionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one transition, assigning the next global sequence number
    pub fn append(
        &self,
        action_id: ActionId,
        from_state: ActionState,
        to_state: ActionState,
        actor: &str,
        timestamp: DateTime<Utc>,
    ) -> TransitionRecord {
        let mut records = self.lock();
        let record = TransitionRecord {
            seq: records.len() as u64 + 1,
            action_id,
            from_state,
            to_state,
            actor: actor.to_string(),
            timestamp,
        };
        records.push(record.clone());
        record
    }

    /// Snapshot of every record in append order
    pub fn records(&self) -> Vec<TransitionRecord> {
        self.lock().clone()
    }

    pub fn for_action(&self, action_id: ActionId) -> Vec<TransitionRecord> {
        self.lock()
            .iter()
            .filter(|r| r.action_id == action_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Which persistent store to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditBackend {
    #[default]
    Jsonl,
    Sqlite,
}

impl fmt::Display for AuditBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jsonl => f.write_str("jsonl"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

impl FromStr for AuditBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jsonl" => Ok(Self::Jsonl),
            "sqlite" => Ok(Self::Sqlite),
            other => anyhow::bail!("Unknown audit backend '{}' (expected jsonl or sqlite)", other),
        }
    }
}

/// Persistent destination for transition records
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Append records in order
    async fn append_all(&self, records: &[TransitionRecord]) -> Result<()>;

    /// Load every stored record in append order
    async fn load(&self) -> Result<Vec<TransitionRecord>>;

    /// Load the records of one action
    async fn records_for(&self, action_id: ActionId) -> Result<Vec<TransitionRecord>> {
        let records = self.load().await?;
        Ok(records
            .into_iter()
            .filter(|r| r.action_id == action_id)
            .collect())
    }
}

/// Open the configured audit store under `dir`
pub async fn open_sink(backend: AuditBackend, dir: &Path) -> Result<Box<dyn AuditSink>> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create audit directory: {}", dir.display()))?;

    let sink: Box<dyn AuditSink> = match backend {
        AuditBackend::Jsonl => Box::new(JsonlAuditStore::new(dir.join("transitions.jsonl"))),
        AuditBackend::Sqlite => Box::new(SqliteAuditStore::open(dir.join("transitions.db"))?),
    };
    Ok(sink)
}

/// JSONL-backed audit store
pub struct JsonlAuditStore {
    path: PathBuf,
}

impl JsonlAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditStore {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append_all(&self, records: &[TransitionRecord]) -> Result<()> {
        let lines = records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to serialize transition record")?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open audit file: {}", path.display()))?;

            file.lock_exclusive()
                .context("Failed to acquire file lock on audit file")?;

            for line in &lines {
                writeln!(file, "{}", line).context("Failed to write transition record")?;
            }
            file.flush().context("Failed to flush audit file")?;

            // Lock is released when file is dropped
            Ok(())
        })
        .await
        .context("Audit writer task failed")?
    }

    async fn load(&self) -> Result<Vec<TransitionRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open audit file: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let record: TransitionRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse transition record: {}", line))?;
            records.push(record);
        }

        Ok(records)
    }
}

/// SQLite-backed audit store
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

/// Raw row as stored in the `transitions` table
type TransitionRow = (i64, String, String, String, String, String);

impl SqliteAuditStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open audit database: {}", path.display()))?;
        Self::init(conn)
    }

    /// In-memory database, used by tests and dry runs
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                seq INTEGER NOT NULL,
                action_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                actor TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transitions_action ON transitions(action_id);
            "#,
        )
        .context("Failed to create audit schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn query(conn: &Connection, action_id: Option<ActionId>) -> Result<Vec<TransitionRecord>> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<TransitionRow> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        };

        let rows: Vec<TransitionRow> = match action_id {
            Some(id) => {
                let mut stmt = conn.prepare(
                    "SELECT seq, action_id, from_state, to_state, actor, timestamp
                     FROM transitions WHERE action_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![id.to_string()], map_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT seq, action_id, from_state, to_state, actor, timestamp
                     FROM transitions ORDER BY id",
                )?;
                let rows = stmt.query_map([], map_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            }
        };

        rows.into_iter().map(parse_row).collect()
    }
}

fn parse_row(row: TransitionRow) -> Result<TransitionRecord> {
    let (seq, action_id, from_state, to_state, actor, timestamp) = row;
    Ok(TransitionRecord {
        seq: seq as u64,
        action_id: action_id
            .parse::<ActionId>()
            .with_context(|| format!("Invalid action id in audit database: {}", action_id))?,
        from_state: from_state
            .parse::<ActionState>()
            .map_err(anyhow::Error::msg)?,
        to_state: to_state.parse::<ActionState>().map_err(anyhow::Error::msg)?,
        actor,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .with_context(|| format!("Invalid timestamp in audit database: {}", timestamp))?
            .with_timezone(&Utc),
    })
}

fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl AuditSink for SqliteAuditStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn append_all(&self, records: &[TransitionRecord]) -> Result<()> {
        let conn = self.conn.clone();
        let records = records.to_vec();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = lock_conn(&conn);
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO transitions (seq, action_id, from_state, to_state, actor, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;

                for record in &records {
                    stmt.execute(params![
                        record.seq as i64,
                        record.action_id.to_string(),
                        record.from_state.as_str(),
                        record.to_state.as_str(),
                        &record.actor,
                        record.timestamp.to_rfc3339(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .context("Audit writer task failed")?
    }

    async fn load(&self) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::query(&lock_conn(&conn), None))
            .await
            .context("Audit reader task failed")?
    }

    async fn records_for(&self, action_id: ActionId) -> Result<Vec<TransitionRecord>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || Self::query(&lock_conn(&conn), Some(action_id)))
            .await
            .context("Audit reader task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn sample_log() -> (AuditLog, ActionId, ActionId) {
        let log = AuditLog::new();
        let first = ActionId::derive("P_J2_J3", at(0), 1);
        let second = ActionId::derive("P_J3_J4", at(0), 2);

        log.append(first, ActionState::Normal, ActionState::Proposed, "actuator", at(1));
        log.append(second, ActionState::Normal, ActionState::Proposed, "actuator", at(2));
        log.append(first, ActionState::Proposed, ActionState::Approved, "op-7", at(3));

        (log, first, second)
    }

    #[test]
    fn test_audit_log_sequences() {
        let (log, first, _) = sample_log();

        let records = log.records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(log.for_action(first).len(), 2);
    }

    #[test]
    fn test_audit_log_clones_share_storage() {
        let log = AuditLog::new();
        let handle = log.clone();
        handle.append(
            ActionId::derive("P1", at(0), 1),
            ActionState::Normal,
            ActionState::Proposed,
            "actuator",
            at(0),
        );
        assert_eq!(log.len(), 1);
        assert!(!log.is_empty());
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("sqlite".parse::<AuditBackend>().unwrap(), AuditBackend::Sqlite);
        assert!("csv".parse::<AuditBackend>().is_err());
        assert_eq!(AuditBackend::default().to_string(), "jsonl");
    }

    #[tokio::test]
    async fn test_jsonl_append_and_load() {
        let temp = TempDir::new().unwrap();
        let store = JsonlAuditStore::new(temp.path().join("transitions.jsonl"));
        let (log, first, _) = sample_log();

        assert!(store.load().await.unwrap().is_empty());

        store.append_all(&log.records()).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, log.records());

        let only_first = store.records_for(first).await.unwrap();
        assert_eq!(only_first.len(), 2);
        assert_eq!(only_first[1].actor, "op-7");
    }

    #[tokio::test]
    async fn test_sqlite_append_and_load() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let (log, _, second) = sample_log();

        store.append_all(&log.records()).await.unwrap();
        assert_eq!(store.load().await.unwrap(), log.records());

        let only_second = store.records_for(second).await.unwrap();
        assert_eq!(only_second.len(), 1);
        assert_eq!(only_second[0].to_state, ActionState::Proposed);
    }

    #[tokio::test]
    async fn test_open_sink_creates_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join("audit");

        let sink = open_sink(AuditBackend::Sqlite, &dir).await.unwrap();
        assert_eq!(sink.name(), "sqlite");
        assert!(dir.join("transitions.db").exists());
    }
}
