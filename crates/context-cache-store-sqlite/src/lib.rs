#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

//! SQLite persistence for the context store and the conversation store.
//!
//! Each store owns one connection behind a mutex and runs every public
//! operation as a single transaction. The `try_*` methods return typed
//! [`CacheError`]s; the [`ContextStore`] and [`ConversationStore`] trait
//! impls log failures and fall back to the empty outcome.
//!
//! [`ContextStore`]: context_cache_core::ContextStore
//! [`ConversationStore`]: context_cache_core::ConversationStore

use std::path::Path;

use context_cache_core::{format_timestamp, parse_timestamp, CacheError, DEFAULT_TAG};
use rusqlite::{params, Connection};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

mod context_store;
mod conversation_store;

pub use context_store::SqliteContextStore;
pub use conversation_store::SqliteConversationStore;

/// Maps rusqlite failures into [`CacheError::Storage`] with a description of
/// the step that failed.
trait StorageContext<T> {
    fn context(self, step: &str) -> Result<T, CacheError>;

    fn with_context<F>(self, step: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> String;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn context(self, step: &str) -> Result<T, CacheError> {
        self.map_err(|err| CacheError::Storage(format!("{step}: {err}")))
    }

    fn with_context<F>(self, step: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|err| CacheError::Storage(format!("{}: {err}", step())))
    }
}

fn open_connection(path: &Path) -> Result<Connection, CacheError> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn apply_schema(conn: &Connection, version: i64, schema: &str) -> Result<(), CacheError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("failed to ensure schema_migrations exists")?;

    conn.execute_batch(schema)
        .with_context(|| format!("failed to apply schema version {version}"))?;

    let now = format_timestamp(context_cache_core::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to register schema migration {version}"))?;

    Ok(())
}

fn database_size_bytes(conn: &Connection) -> Result<u64, CacheError> {
    let page_count: i64 = conn
        .query_row("PRAGMA page_count", [], |row| row.get(0))
        .context("failed to read page_count")?;
    let page_size: i64 = conn
        .query_row("PRAGMA page_size", [], |row| row.get(0))
        .context("failed to read page_size")?;

    Ok(u64::try_from(page_count.saturating_mul(page_size)).unwrap_or(0))
}

#[cfg(test)]
fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, CacheError> {
    use rusqlite::OptionalExtension;

    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

/// Formatted cutoff for an age-based sweep, or `None` when `max_age` reaches
/// past the earliest representable timestamp and nothing can be expired.
fn expiry_cutoff(now: OffsetDateTime, max_age: Duration) -> Result<Option<String>, CacheError> {
    now.checked_sub(max_age).map(format_timestamp).transpose()
}

fn tag_or_default(tag: Option<&str>) -> &str {
    tag.map(str::trim)
        .filter(|tag| !tag.is_empty())
        .unwrap_or(DEFAULT_TAG)
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_to_bool(value: i64) -> bool {
    value != 0
}

fn count_to_sql(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn sql_to_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, CacheError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context("failed to decode row")?);
    }
    Ok(values)
}

fn conversion_failure(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_timestamp_column(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_timestamp(raw).map_err(|err| conversion_failure(column, err.to_string()))
}

fn parse_json_column(column: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw)
        .map_err(|err| conversion_failure(column, format!("invalid JSON: {err}")))
}

fn to_json_text(value: &Value) -> Result<String, CacheError> {
    serde_json::to_string(value)
        .map_err(|err| CacheError::Serialization(format!("failed to serialize JSON: {err}")))
}
