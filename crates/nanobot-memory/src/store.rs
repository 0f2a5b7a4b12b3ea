//! Canonical entry table plus lexical index behind one write-serialized
//! connection.
//!
//! The FTS index is an external-content FTS5 table kept consistent with the
//! canonical table by triggers, so any transactional write or prune updates
//! both or neither. Dedupe is a UNIQUE constraint over
//! `(scope_key, kind, normalized_text)`; upserts take an immediate
//! transaction so the dedupe key is linearizable across processes sharing
//! the database file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ErrorCode, ToSql, TransactionBehavior};
use serde::Serialize;

use crate::entry::{normalize_for_dedupe, MemoryEntry, MemoryKind, MemorySource, NewMemoryEntry};
use crate::error::{MemoryError, MemoryResult};

pub const MEMORY_SCHEMA_VERSION: &str = "1";
pub const META_SCHEMA_VERSION_KEY: &str = "schema_version";

/// Busy-retry backoff schedule in milliseconds.
const BUSY_RETRY_BACKOFF_MS: [u64; 3] = [50, 125, 250];
const BUSY_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_QUERY_TOKENS: usize = 32;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS memory_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    scope_key TEXT NOT NULL,
    text TEXT NOT NULL,
    normalized_text TEXT NOT NULL,
    channel TEXT NOT NULL,
    chat_id TEXT,
    sender_id TEXT,
    importance REAL NOT NULL,
    confidence REAL NOT NULL,
    created_at_unix_ms INTEGER NOT NULL,
    updated_at_unix_ms INTEGER NOT NULL,
    last_seen_at_unix_ms INTEGER NOT NULL,
    hit_count INTEGER NOT NULL DEFAULT 1,
    source TEXT NOT NULL,
    expires_at_unix_ms INTEGER NOT NULL,
    UNIQUE(scope_key, kind, normalized_text)
);
CREATE INDEX IF NOT EXISTS idx_memory_entries_scope_kind
    ON memory_entries(scope_key, kind);
CREATE INDEX IF NOT EXISTS idx_memory_entries_expires
    ON memory_entries(expires_at_unix_ms);
CREATE INDEX IF NOT EXISTS idx_memory_entries_last_seen
    ON memory_entries(last_seen_at_unix_ms);

CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
    text,
    content=memory_entries,
    content_rowid=id,
    tokenize='porter unicode61'
);

CREATE TRIGGER IF NOT EXISTS memory_entries_ai AFTER INSERT ON memory_entries BEGIN
    INSERT INTO memory_fts(rowid, text) VALUES (new.id, new.text);
END;
CREATE TRIGGER IF NOT EXISTS memory_entries_ad AFTER DELETE ON memory_entries BEGIN
    INSERT INTO memory_fts(memory_fts, rowid, text) VALUES ('delete', old.id, old.text);
END;
CREATE TRIGGER IF NOT EXISTS memory_entries_au AFTER UPDATE ON memory_entries BEGIN
    INSERT INTO memory_fts(memory_fts, rowid, text) VALUES ('delete', old.id, old.text);
    INSERT INTO memory_fts(rowid, text) VALUES (new.id, new.text);
END;

CREATE TABLE IF NOT EXISTS memory_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ENTRY_COLUMNS: &str = "memory_entries.id, memory_entries.kind, memory_entries.scope_key, \
     memory_entries.text, memory_entries.channel, memory_entries.chat_id, \
     memory_entries.sender_id, memory_entries.importance, memory_entries.confidence, \
     memory_entries.created_at_unix_ms, memory_entries.updated_at_unix_ms, \
     memory_entries.last_seen_at_unix_ms, memory_entries.hit_count, memory_entries.source, \
     memory_entries.expires_at_unix_ms";

impl ToSql for MemoryKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MemoryKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        MemoryKind::parse(raw).map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

impl ToSql for MemorySource {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for MemorySource {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        MemorySource::parse(raw).map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// Result of one upsert, for telemetry discrimination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted { id: i64 },
    Merged { id: i64 },
}

impl UpsertOutcome {
    pub fn id(self) -> i64 {
        match self {
            UpsertOutcome::Inserted { id } | UpsertOutcome::Merged { id } => id,
        }
    }

    pub fn is_insert(self) -> bool {
        matches!(self, UpsertOutcome::Inserted { .. })
    }
}

/// One lexical search over the index. Empty `scope_keys`/`kinds` slices mean
/// "no filter on that dimension" and are reserved for the operator surface;
/// recall always passes explicit scope keys.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub scope_keys: &'a [String],
    pub kinds: &'a [MemoryKind],
    pub query_text: &'a str,
    pub limit: usize,
}

/// An entry plus its raw (backend-native, higher-is-better) lexical score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub entry: MemoryEntry,
    pub fts_score: f64,
}

/// Row counters surfaced by `memory status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total_rows: u64,
    pub rows_by_kind: BTreeMap<String, u64>,
}

/// Storage backend contract. `sqlite_fts` is the only implementation; the
/// search contract already returns `(entry, score)` pairs so a hybrid
/// backend can slot in without changing callers.
pub trait Store: Send + Sync {
    fn upsert(&self, entry: &NewMemoryEntry, now_unix_ms: u64) -> MemoryResult<UpsertOutcome>;
    fn search(&self, request: &SearchRequest<'_>) -> MemoryResult<Vec<SearchHit>>;
    fn prune_expired(&self, now_unix_ms: u64) -> MemoryResult<usize>;
    fn prune_last_seen_before(&self, cutoff_unix_ms: u64, dry_run: bool) -> MemoryResult<usize>;
    fn reindex(&self) -> MemoryResult<()>;
    fn consistency_probe(&self) -> MemoryResult<()>;
    fn stats(&self) -> MemoryResult<StoreStats>;
    fn get_meta(&self, key: &str) -> MemoryResult<Option<String>>;
    fn set_meta(&self, key: &str, value: &str) -> MemoryResult<()>;
}

/// SQLite-backed canonical store with an FTS5 lexical index.
pub struct SqliteFtsStore {
    connection: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteFtsStore {
    /// Opens (creating if needed) the store at `db_path`.
    pub fn open(db_path: &Path) -> MemoryResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    MemoryError::StoreUnavailable(format!(
                        "failed to create store directory {}: {error}",
                        parent.display()
                    ))
                })?;
            }
        }
        let connection = Connection::open(db_path)
            .map_err(|error| classify_sqlite_error("open store", &error))?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|error| classify_sqlite_error("set busy timeout", &error))?;
        connection
            .execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            )
            .map_err(|error| classify_sqlite_error("apply pragmas", &error))?;
        connection
            .execute_batch(SCHEMA_SQL)
            .map_err(|error| classify_sqlite_error("initialize schema", &error))?;
        connection
            .execute(
                "INSERT OR IGNORE INTO memory_meta (key, value) VALUES (?1, ?2)",
                rusqlite::params![META_SCHEMA_VERSION_KEY, MEMORY_SCHEMA_VERSION],
            )
            .map_err(|error| classify_sqlite_error("write schema version", &error))?;

        Ok(Self {
            connection: Mutex::new(connection),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    fn with_connection<T>(
        &self,
        context: &str,
        operation: impl Fn(&mut Connection) -> rusqlite::Result<T>,
    ) -> MemoryResult<T> {
        let mut guard = match self.connection.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut busy_attempt = 0usize;
        let mut other_retried = false;
        loop {
            match operation(&mut guard) {
                Ok(value) => return Ok(value),
                Err(error)
                    if is_busy_error(&error) && busy_attempt < BUSY_RETRY_BACKOFF_MS.len() =>
                {
                    let delay_ms = BUSY_RETRY_BACKOFF_MS[busy_attempt];
                    busy_attempt += 1;
                    tracing::debug!(
                        context,
                        attempt = busy_attempt,
                        delay_ms,
                        "memory store busy, retrying"
                    );
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
                Err(error) if !is_busy_error(&error) && !other_retried => {
                    other_retried = true;
                    tracing::debug!(
                        context,
                        error = %error,
                        "memory store operation failed, retrying once"
                    );
                    std::thread::sleep(Duration::from_millis(BUSY_RETRY_BACKOFF_MS[0]));
                }
                Err(error) => return Err(classify_sqlite_error(context, &error)),
            }
        }
    }
}

impl Store for SqliteFtsStore {
    fn upsert(&self, entry: &NewMemoryEntry, now_unix_ms: u64) -> MemoryResult<UpsertOutcome> {
        let normalized_text = normalize_for_dedupe(&entry.text);
        if normalized_text.is_empty() {
            return Err(MemoryError::Internal(
                "refusing to upsert entry with empty normalized text".to_string(),
            ));
        }
        self.with_connection("upsert entry", move |connection| {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = transaction
                .query_row(
                    "SELECT id FROM memory_entries \
                     WHERE scope_key = ?1 AND kind = ?2 AND normalized_text = ?3",
                    rusqlite::params![entry.scope_key, entry.kind, normalized_text],
                    |row| row.get::<_, i64>(0),
                )
                .map(Some)
                .or_else(|error| match error {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let outcome = match existing {
                Some(id) => {
                    transaction.execute(
                        "UPDATE memory_entries SET \
                             last_seen_at_unix_ms = ?1, \
                             updated_at_unix_ms = ?1, \
                             hit_count = hit_count + 1, \
                             importance = MAX(importance, ?2) \
                         WHERE id = ?3",
                        rusqlite::params![now_unix_ms, entry.importance, id],
                    )?;
                    UpsertOutcome::Merged { id }
                }
                None => {
                    transaction.execute(
                        "INSERT INTO memory_entries (\
                             kind, scope_key, text, normalized_text, channel, chat_id, \
                             sender_id, importance, confidence, created_at_unix_ms, \
                             updated_at_unix_ms, last_seen_at_unix_ms, hit_count, source, \
                             expires_at_unix_ms) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?10, 1, ?11, ?12)",
                        rusqlite::params![
                            entry.kind,
                            entry.scope_key,
                            entry.text,
                            normalized_text,
                            entry.channel,
                            entry.chat_id,
                            entry.sender_id,
                            entry.importance,
                            entry.confidence,
                            now_unix_ms,
                            entry.source,
                            entry.expires_at_unix_ms,
                        ],
                    )?;
                    UpsertOutcome::Inserted {
                        id: transaction.last_insert_rowid(),
                    }
                }
            };
            transaction.commit()?;
            Ok(outcome)
        })
    }

    fn search(&self, request: &SearchRequest<'_>) -> MemoryResult<Vec<SearchHit>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let Some(match_expression) = build_match_expression(request.query_text) else {
            return Ok(Vec::new());
        };

        self.with_connection("search entries", move |connection| {
            let mut sql = format!(
                "SELECT {ENTRY_COLUMNS}, -bm25(memory_fts) AS fts_score \
                 FROM memory_fts \
                 JOIN memory_entries ON memory_entries.id = memory_fts.rowid \
                 WHERE memory_fts MATCH ?"
            );
            let mut params: Vec<&dyn ToSql> = vec![&match_expression];

            if !request.scope_keys.is_empty() {
                sql.push_str(" AND memory_entries.scope_key IN (");
                push_placeholders(&mut sql, request.scope_keys.len());
                sql.push(')');
                for scope_key in request.scope_keys {
                    params.push(scope_key);
                }
            }
            if !request.kinds.is_empty() {
                sql.push_str(" AND memory_entries.kind IN (");
                push_placeholders(&mut sql, request.kinds.len());
                sql.push(')');
                for kind in request.kinds {
                    params.push(kind);
                }
            }
            let limit = request.limit as i64;
            sql.push_str(" ORDER BY fts_score DESC, memory_entries.id ASC LIMIT ?");
            params.push(&limit);

            let mut statement = connection.prepare(&sql)?;
            let rows = statement.query_map(params.as_slice(), |row| {
                let entry = entry_from_row(row)?;
                let fts_score: f64 = row.get(15)?;
                Ok(SearchHit { entry, fts_score })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    fn prune_expired(&self, now_unix_ms: u64) -> MemoryResult<usize> {
        self.with_connection("prune expired entries", move |connection| {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pruned = transaction.execute(
                "DELETE FROM memory_entries WHERE expires_at_unix_ms <= ?1",
                rusqlite::params![now_unix_ms],
            )?;
            transaction.commit()?;
            Ok(pruned)
        })
    }

    fn prune_last_seen_before(&self, cutoff_unix_ms: u64, dry_run: bool) -> MemoryResult<usize> {
        self.with_connection("prune stale entries", move |connection| {
            if dry_run {
                return connection.query_row(
                    "SELECT COUNT(*) FROM memory_entries WHERE last_seen_at_unix_ms < ?1",
                    rusqlite::params![cutoff_unix_ms],
                    |row| row.get::<_, i64>(0).map(|count| count.max(0) as usize),
                );
            }
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let pruned = transaction.execute(
                "DELETE FROM memory_entries WHERE last_seen_at_unix_ms < ?1",
                rusqlite::params![cutoff_unix_ms],
            )?;
            transaction.commit()?;
            Ok(pruned)
        })
    }

    fn reindex(&self) -> MemoryResult<()> {
        self.with_connection("rebuild fts index", |connection| {
            connection
                .execute("INSERT INTO memory_fts(memory_fts) VALUES('rebuild')", [])
                .map(|_| ())
        })
    }

    fn consistency_probe(&self) -> MemoryResult<()> {
        let probed = self.with_connection("probe fts consistency", |connection| {
            connection
                .execute(
                    "INSERT INTO memory_fts(memory_fts, rank) VALUES('integrity-check', 1)",
                    [],
                )
                .map(|_| ())
        });
        match probed {
            Ok(()) => Ok(()),
            Err(MemoryError::Internal(message)) => Err(MemoryError::Corrupt(message)),
            Err(other) => Err(other),
        }
    }

    fn stats(&self) -> MemoryResult<StoreStats> {
        self.with_connection("collect store stats", |connection| {
            let mut statement = connection
                .prepare("SELECT kind, COUNT(*) FROM memory_entries GROUP BY kind")?;
            let rows = statement.query_map([], |row| {
                let kind: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((kind, count.max(0) as u64))
            })?;
            let mut stats = StoreStats::default();
            for row in rows {
                let (kind, count) = row?;
                stats.total_rows += count;
                stats.rows_by_kind.insert(kind, count);
            }
            Ok(stats)
        })
    }

    fn get_meta(&self, key: &str) -> MemoryResult<Option<String>> {
        self.with_connection("read meta marker", move |connection| {
            connection
                .query_row(
                    "SELECT value FROM memory_meta WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get::<_, String>(0),
                )
                .map(Some)
                .or_else(|error| match error {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
        })
    }

    fn set_meta(&self, key: &str, value: &str) -> MemoryResult<()> {
        self.with_connection("write meta marker", move |connection| {
            connection
                .execute(
                    "INSERT INTO memory_meta (key, value) VALUES (?1, ?2) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )
                .map(|_| ())
        })
    }
}

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryEntry> {
    Ok(MemoryEntry {
        id: row.get(0)?,
        kind: row.get(1)?,
        scope_key: row.get(2)?,
        text: row.get(3)?,
        channel: row.get(4)?,
        chat_id: row.get(5)?,
        sender_id: row.get(6)?,
        importance: row.get(7)?,
        confidence: row.get(8)?,
        created_at_unix_ms: row.get(9)?,
        updated_at_unix_ms: row.get(10)?,
        last_seen_at_unix_ms: row.get(11)?,
        hit_count: row.get(12)?,
        source: row.get(13)?,
        expires_at_unix_ms: row.get(14)?,
    })
}

fn push_placeholders(sql: &mut String, count: usize) {
    for index in 0..count {
        if index > 0 {
            sql.push_str(", ");
        }
        sql.push('?');
    }
}

/// Builds a MATCH expression from free text: tokens are reduced to
/// alphanumerics, quoted, and OR-joined so FTS5 query operators in user
/// text cannot reach the parser. Returns None when nothing searchable
/// remains.
fn build_match_expression(query_text: &str) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    let mut terms = Vec::new();
    for raw_token in query_text.split_whitespace() {
        let token = raw_token
            .chars()
            .filter(|character| character.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if token.is_empty() {
            continue;
        }
        if seen.insert(token.clone()) {
            terms.push(format!("\"{token}\""));
        }
        if terms.len() >= MAX_QUERY_TOKENS {
            break;
        }
    }
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn is_busy_error(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::DatabaseBusy || inner.code == ErrorCode::DatabaseLocked
    )
}

fn classify_sqlite_error(context: &str, error: &rusqlite::Error) -> MemoryError {
    if is_busy_error(error) {
        return MemoryError::StoreBusy(format!("{context}: {error}"));
    }
    if let rusqlite::Error::SqliteFailure(inner, message) = error {
        let rendered = message
            .clone()
            .unwrap_or_else(|| inner.to_string());
        match inner.code {
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                return MemoryError::Corrupt(format!("{context}: {rendered}"));
            }
            ErrorCode::CannotOpen | ErrorCode::ReadOnly | ErrorCode::PermissionDenied => {
                return MemoryError::StoreUnavailable(format!("{context}: {rendered}"));
            }
            _ => {}
        }
        if rendered.contains("malformed") {
            return MemoryError::Corrupt(format!("{context}: {rendered}"));
        }
    }
    MemoryError::Internal(format!("{context}: {error}"))
}
