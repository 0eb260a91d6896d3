//! SQLite query index over the audit log.
//!
//! The index is a derived read model: [`AuditIndex::sync`] copies entries it
//! has not seen yet out of the JSON Lines file, and queries run against the
//! database. The log file is never rewritten.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use super::{read_entries, AuditEntry, AuditError, AuditLevel};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS audit_entries (
    seq INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    source TEXT NOT NULL,
    action TEXT NOT NULL,
    detail TEXT NOT NULL,
    outcome TEXT,
    hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_entries_level ON audit_entries(level);
CREATE INDEX IF NOT EXISTS idx_audit_entries_action ON audit_entries(action);
";

/// Row shape returned by index queries.
type IndexRow = (i64, String, String, String, String, String, Option<String>, String);

/// An audit entry as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEntry {
    /// Sequence number.
    pub seq: u64,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Severity.
    pub level: AuditLevel,
    /// Writing component.
    pub source: String,
    /// Action name.
    pub action: String,
    /// Detail text.
    pub detail: String,
    /// Outcome, if recorded.
    pub outcome: Option<String>,
    /// Chain hash.
    pub hash: String,
}

impl IndexedEntry {
    fn from_row(row: IndexRow) -> Self {
        let (seq, timestamp, level, source, action, detail, outcome, hash) = row;
        Self {
            seq: u64::try_from(seq).unwrap_or(0),
            timestamp,
            level: AuditLevel::parse(&level).unwrap_or(AuditLevel::Info),
            source,
            action,
            detail,
            outcome,
            hash,
        }
    }
}

/// Query index backed by a SQLite database.
#[derive(Debug, Clone)]
pub struct AuditIndex {
    db: SqlitePool,
}

impl AuditIndex {
    /// Open (or create) the index database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Index`] if the database cannot be opened or the
    /// schema cannot be applied.
    pub async fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// Open a private in-memory index.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Index`] if SQLite cannot be initialised.
    pub async fn in_memory() -> Result<Self, AuditError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, AuditError> {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&db).await?;
        Ok(Self { db })
    }

    /// Highest sequence number present in the index (0 when empty).
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Index`] on query failure.
    pub async fn high_water(&self) -> Result<u64, AuditError> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(seq) FROM audit_entries")
            .fetch_one(&self.db)
            .await?;
        Ok(max.and_then(|m| u64::try_from(m).ok()).unwrap_or(0))
    }

    /// Copy entries newer than the index high-water mark out of the log file.
    ///
    /// Returns the number of rows added.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Malformed`] if the log cannot be parsed, or
    /// [`AuditError::Index`] on insert failure.
    pub async fn sync(&self, log_path: &Path) -> Result<u64, AuditError> {
        let high_water = self.high_water().await?;
        let fresh: Vec<AuditEntry> = read_entries(log_path)?
            .into_iter()
            .filter(|e| e.seq > high_water)
            .collect();

        let mut tx = self.db.begin().await?;
        let mut added: u64 = 0;
        for entry in &fresh {
            let seq = i64::try_from(entry.seq).unwrap_or(i64::MAX);
            let result = sqlx::query(
                "INSERT OR IGNORE INTO audit_entries \
                 (seq, timestamp, level, source, action, detail, outcome, hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(seq)
            .bind(&entry.timestamp)
            .bind(entry.level.as_str())
            .bind(&entry.source)
            .bind(&entry.action)
            .bind(&entry.detail)
            .bind(entry.outcome.as_deref())
            .bind(&entry.hash)
            .execute(&mut *tx)
            .await?;
            added = added.saturating_add(result.rows_affected());
        }
        tx.commit().await?;

        debug!(added, high_water, "audit index synced");
        Ok(added)
    }

    /// Entries whose action, detail, source, or outcome contains `text`
    /// (case-insensitive), newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Index`] on query failure.
    pub async fn search(&self, text: &str, limit: u32) -> Result<Vec<IndexedEntry>, AuditError> {
        let rows: Vec<IndexRow> = sqlx::query_as(
            "SELECT seq, timestamp, level, source, action, detail, outcome, hash \
             FROM audit_entries \
             WHERE instr(lower(action), lower(?1)) > 0 \
                OR instr(lower(detail), lower(?1)) > 0 \
                OR instr(lower(source), lower(?1)) > 0 \
                OR instr(lower(coalesce(outcome, '')), lower(?1)) > 0 \
             ORDER BY seq DESC LIMIT ?2",
        )
        .bind(text)
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(IndexedEntry::from_row).collect())
    }

    /// Entries at `level`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Index`] on query failure.
    pub async fn by_level(
        &self,
        level: AuditLevel,
        limit: u32,
    ) -> Result<Vec<IndexedEntry>, AuditError> {
        let rows: Vec<IndexRow> = sqlx::query_as(
            "SELECT seq, timestamp, level, source, action, detail, outcome, hash \
             FROM audit_entries WHERE level = ?1 ORDER BY seq DESC LIMIT ?2",
        )
        .bind(level.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(IndexedEntry::from_row).collect())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.db.close().await;
    }
}
