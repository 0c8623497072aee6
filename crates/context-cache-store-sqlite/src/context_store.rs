use std::collections::BTreeMap;
use std::path::Path;

use context_cache_core::{
    canonical_json_string, content_hash, ensure_non_empty, fingerprint, format_timestamp,
    now_utc, CacheError, ContextId, ContextLimits, ContextRecord, ContextStats, ContextStore,
    ContextSummary, RecentContext, ScoredContext,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::{
    apply_schema, collect_rows, count_to_sql, database_size_bytes, expiry_cutoff,
    parse_json_column, parse_timestamp_column, sql_to_count, tag_or_default, to_json_text,
    StorageContext,
};

const CONTEXT_SCHEMA_VERSION: i64 = 1;
const SUMMARY_RECENT_LIMIT: usize = 10;

const SCHEMA_CONTEXT_V1: &str = r"
CREATE TABLE IF NOT EXISTS contexts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner TEXT NOT NULL,
  tag TEXT NOT NULL,
  content_json TEXT NOT NULL,
  content_hash TEXT NOT NULL UNIQUE,
  metadata_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL,
  last_seen_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_contexts_seen
  ON contexts(last_seen_at, id);
CREATE INDEX IF NOT EXISTS idx_contexts_owner_seen
  ON contexts(owner, last_seen_at, id);

CREATE VIRTUAL TABLE IF NOT EXISTS contexts_fts USING fts5(
  content_json,
  tag,
  content = 'contexts',
  content_rowid = 'id'
);

CREATE TRIGGER IF NOT EXISTS trg_contexts_fts_insert
AFTER INSERT ON contexts
BEGIN
  INSERT INTO contexts_fts(rowid, content_json, tag)
  VALUES (new.id, new.content_json, new.tag);
END;

CREATE TRIGGER IF NOT EXISTS trg_contexts_fts_delete
AFTER DELETE ON contexts
BEGIN
  INSERT INTO contexts_fts(contexts_fts, rowid, content_json, tag)
  VALUES ('delete', old.id, old.content_json, old.tag);
END;

CREATE TRIGGER IF NOT EXISTS trg_contexts_fts_update
AFTER UPDATE OF content_json, tag ON contexts
BEGIN
  INSERT INTO contexts_fts(contexts_fts, rowid, content_json, tag)
  VALUES ('delete', old.id, old.content_json, old.tag);
  INSERT INTO contexts_fts(rowid, content_json, tag)
  VALUES (new.id, new.content_json, new.tag);
END;
";

const SEARCH_SQL: &str = "
SELECT c.id, c.content_json, c.tag, c.metadata_json, c.created_at,
       bm25(contexts_fts) AS relevance
FROM contexts_fts
JOIN contexts c ON c.id = contexts_fts.rowid
WHERE contexts_fts MATCH ?1
  AND c.owner = ?2
  AND (?3 IS NULL OR c.tag = ?3)
ORDER BY relevance ASC, c.id DESC
LIMIT ?4";

/// Deduplicated, full-text searchable snapshots bounded per owner and
/// globally.
pub struct SqliteContextStore {
    conn: Mutex<Connection>,
    limits: ContextLimits,
}

impl SqliteContextStore {
    /// Opens (or creates) the database, applies the schema and sweeps rows
    /// older than the configured age.
    pub fn open(path: &Path, limits: ContextLimits) -> Result<Self, CacheError> {
        limits.validate()?;
        let conn = crate::open_connection(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            limits,
        };
        store.migrate()?;

        let deleted = store.try_sweep_expired_at(now_utc())?;
        if deleted > 0 {
            tracing::info!(deleted, "startup sweep removed expired contexts");
        }
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        apply_schema(&conn, CONTEXT_SCHEMA_VERSION, SCHEMA_CONTEXT_V1)
    }

    #[must_use]
    pub fn limits(&self) -> &ContextLimits {
        &self.limits
    }

    pub fn try_store(&self, owner: &str, content: &Value, tag: &str) -> Result<ContextId, CacheError> {
        self.try_store_at(owner, content, tag, now_utc())
    }

    /// Stores `content` for `owner`, or bumps `last_seen_at` on the existing
    /// row with the same canonical content. Hashes are unique across the
    /// store, so a duplicate keeps the id and owner of the first writer.
    /// An empty `tag` falls back to
    /// [`DEFAULT_TAG`](context_cache_core::DEFAULT_TAG).
    pub fn try_store_at(
        &self,
        owner: &str,
        content: &Value,
        tag: &str,
        now: OffsetDateTime,
    ) -> Result<ContextId, CacheError> {
        ensure_non_empty("owner", owner)?;
        ensure_content(content)?;
        let tag = tag_or_default(Some(tag));

        let hash = content_hash(content)?;
        let content_json = canonical_json_string(content)?;
        let metadata_json = to_json_text(&derive_metadata(content))?;
        let now_text = format_timestamp(now)?;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start context transaction")?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM contexts WHERE content_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up context by hash")?;

        if let Some(id) = existing {
            tx.execute(
                "UPDATE contexts SET last_seen_at = ?1 WHERE id = ?2",
                params![now_text, id],
            )
            .context("failed to refresh duplicate context")?;
            tx.commit().context("failed to commit context refresh")?;
            tracing::debug!(owner, id, "context already stored");
            return Ok(ContextId(id));
        }

        let evicted_global = evict_oldest(
            &tx,
            "SELECT COUNT(*) FROM contexts",
            "DELETE FROM contexts WHERE id IN (
                 SELECT id FROM contexts ORDER BY last_seen_at ASC, id ASC LIMIT ?1
             )",
            None,
            self.limits.max_total_contexts,
        )?;
        let evicted_owner = evict_oldest(
            &tx,
            "SELECT COUNT(*) FROM contexts WHERE owner = ?1",
            "DELETE FROM contexts WHERE id IN (
                 SELECT id FROM contexts WHERE owner = ?2
                 ORDER BY last_seen_at ASC, id ASC LIMIT ?1
             )",
            Some(owner),
            self.limits.max_contexts_per_owner,
        )?;
        if evicted_global + evicted_owner > 0 {
            tracing::debug!(
                owner,
                evicted_global,
                evicted_owner,
                "evicted contexts to make room"
            );
        }

        tx.execute(
            "INSERT INTO contexts(owner, tag, content_json, content_hash, metadata_json, created_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![owner, tag, content_json, hash, metadata_json, now_text],
        )
        .context("failed to insert context")?;
        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit context insert")?;

        Ok(ContextId(id))
    }

    pub fn try_retrieve(
        &self,
        owner: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ScoredContext>, CacheError> {
        self.try_retrieve_at(owner, query, limit, now_utc())
    }

    /// Ranked full-text search over `owner`'s rows. Returned rows count as
    /// seen at `now`.
    pub fn try_retrieve_at(
        &self,
        owner: &str,
        query: &str,
        limit: usize,
        now: OffsetDateTime,
    ) -> Result<Vec<ScoredContext>, CacheError> {
        ensure_non_empty("owner", owner)?;
        let Some(match_expr) = fts_match_expression(query) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now_text = format_timestamp(now)?;
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start retrieval transaction")?;

        let results = run_search(&tx, &match_expr, owner, None, limit)?;
        for result in &results {
            tx.execute(
                "UPDATE contexts SET last_seen_at = ?1 WHERE id = ?2",
                params![now_text, result.id.0],
            )
            .context("failed to bump last_seen_at")?;
        }
        tx.commit().context("failed to commit retrieval")?;

        Ok(results)
    }

    /// Same ranking as retrieval, optionally narrowed to one tag. Does not
    /// touch `last_seen_at`.
    pub fn try_search(
        &self,
        owner: &str,
        term: &str,
        tag: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ScoredContext>, CacheError> {
        ensure_non_empty("owner", owner)?;
        let Some(match_expr) = fts_match_expression(term) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start search transaction")?;
        let results = run_search(&tx, &match_expr, owner, tag, limit)?;
        tx.commit().context("failed to commit search")?;
        Ok(results)
    }

    pub fn try_get(&self, id: ContextId) -> Result<Option<ContextRecord>, CacheError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, owner, tag, content_json, content_hash, metadata_json, created_at, last_seen_at
             FROM contexts WHERE id = ?1",
            params![id.0],
            parse_context_row,
        )
        .optional()
        .context("failed to load context")
    }

    pub fn try_summary(&self, owner: &str) -> Result<ContextSummary, CacheError> {
        ensure_non_empty("owner", owner)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start summary transaction")?;

        let by_tag = tags_histogram(&tx, Some(owner))?;
        let total = by_tag.values().sum();

        let recent = {
            let mut stmt = tx
                .prepare(
                    "SELECT tag, last_seen_at, metadata_json FROM contexts
                     WHERE owner = ?1
                     ORDER BY last_seen_at DESC, id DESC
                     LIMIT ?2",
                )
                .context("failed to prepare recent contexts query")?;
            let rows = stmt
                .query_map(params![owner, count_to_sql(SUMMARY_RECENT_LIMIT)], |row| {
                    let tag: String = row.get(0)?;
                    let seen_raw: String = row.get(1)?;
                    let metadata_raw: String = row.get(2)?;
                    let metadata = parse_json_column(2, &metadata_raw)?;
                    Ok(RecentContext {
                        tag,
                        timestamp: parse_timestamp_column(1, &seen_raw)?,
                        is_summarized: metadata
                            .get("is_summarized")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    })
                })
                .context("failed to query recent contexts")?;
            collect_rows(rows)?
        };
        tx.commit().context("failed to commit summary")?;

        Ok(ContextSummary {
            total,
            by_tag,
            recent,
        })
    }

    /// Deletes every row for `owner` and returns how many went away.
    pub fn try_clear(&self, owner: &str) -> Result<usize, CacheError> {
        ensure_non_empty("owner", owner)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start clear transaction")?;
        let deleted = tx
            .execute("DELETE FROM contexts WHERE owner = ?1", params![owner])
            .context("failed to clear contexts")?;
        tx.commit().context("failed to commit clear")?;
        tracing::debug!(owner, deleted, "cleared contexts");
        Ok(deleted)
    }

    pub fn try_stats(&self) -> Result<ContextStats, CacheError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start stats transaction")?;
        let by_tag = tags_histogram(&tx, None)?;
        let database_size_bytes = database_size_bytes(&tx)?;
        tx.commit().context("failed to commit stats")?;

        Ok(ContextStats {
            total_contexts: by_tag.values().sum(),
            by_tag,
            database_size_bytes,
            limits: self.limits,
        })
    }

    pub fn try_sweep_expired(&self) -> Result<usize, CacheError> {
        self.try_sweep_expired_at(now_utc())
    }

    /// Deletes rows whose `last_seen_at` is older than the configured age.
    pub fn try_sweep_expired_at(&self, now: OffsetDateTime) -> Result<usize, CacheError> {
        let Some(cutoff) = expiry_cutoff(now, self.limits.max_age())? else {
            return Ok(0);
        };
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start sweep transaction")?;
        let deleted = tx
            .execute(
                "DELETE FROM contexts WHERE last_seen_at < ?1",
                params![cutoff],
            )
            .context("failed to sweep expired contexts")?;
        tx.commit().context("failed to commit sweep")?;

        if deleted > 0 {
            tracing::debug!(deleted, "swept expired contexts");
        }
        Ok(deleted)
    }

    #[cfg(test)]
    fn connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

impl ContextStore for SqliteContextStore {
    fn store(&self, owner: &str, content: &Value, tag: &str) -> Option<ContextId> {
        match self.try_store(owner, content, tag) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(owner, error = %err, "failed to store context");
                None
            }
        }
    }

    fn retrieve(&self, owner: &str, query: &str, limit: usize) -> Vec<ScoredContext> {
        self.try_retrieve(owner, query, limit).unwrap_or_else(|err| {
            tracing::warn!(owner, error = %err, "failed to retrieve contexts");
            Vec::new()
        })
    }

    fn summary(&self, owner: &str) -> ContextSummary {
        self.try_summary(owner).unwrap_or_else(|err| {
            tracing::warn!(owner, error = %err, "failed to summarize contexts");
            ContextSummary::default()
        })
    }

    fn clear(&self, owner: &str) -> bool {
        match self.try_clear(owner) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(owner, error = %err, "failed to clear contexts");
                false
            }
        }
    }

    fn stats(&self) -> Option<ContextStats> {
        match self.try_stats() {
            Ok(stats) => Some(stats),
            Err(err) => {
                tracing::warn!(error = %err, "failed to collect context stats");
                None
            }
        }
    }

    fn sweep_expired(&self) -> usize {
        self.try_sweep_expired().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to sweep contexts");
            0
        })
    }
}

fn ensure_content(content: &Value) -> Result<(), CacheError> {
    let empty = match content {
        Value::Null => true,
        Value::String(raw) => raw.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    };
    if empty {
        return Err(CacheError::Validation(
            "content MUST be a non-empty JSON value".to_string(),
        ));
    }
    Ok(())
}

fn derive_metadata(content: &Value) -> Value {
    let is_summarized = content.get("workspace_summary").is_some();
    json!({
        "is_summarized": is_summarized,
        "summary_type": if is_summarized { "environment_summary" } else { "full_context" },
        "fingerprint": fingerprint(content),
    })
}

/// Reduces free text to quoted alphanumeric tokens joined with `OR`.
///
/// Returns `None` when nothing searchable is left.
fn fts_match_expression(query: &str) -> Option<String> {
    let tokens = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>();

    if tokens.is_empty() {
        return None;
    }
    Some(tokens.join(" OR "))
}

// bm25() is negative, more negative is more relevant.
fn relevance_to_score(bm25: f64) -> f64 {
    let relevance = (-bm25).max(0.0);
    relevance / (1.0 + relevance)
}

fn run_search(
    tx: &Transaction<'_>,
    match_expr: &str,
    owner: &str,
    tag: Option<&str>,
    limit: usize,
) -> Result<Vec<ScoredContext>, CacheError> {
    let mut stmt = tx
        .prepare(SEARCH_SQL)
        .context("failed to prepare context search")?;
    let rows = stmt
        .query_map(
            params![match_expr, owner, tag, count_to_sql(limit)],
            |row| {
                let content_raw: String = row.get(1)?;
                let metadata_raw: String = row.get(3)?;
                let created_raw: String = row.get(4)?;
                let bm25: f64 = row.get(5)?;
                Ok(ScoredContext {
                    id: ContextId(row.get(0)?),
                    content: parse_json_column(1, &content_raw)?,
                    tag: row.get(2)?,
                    metadata: parse_json_column(3, &metadata_raw)?,
                    score: relevance_to_score(bm25),
                    timestamp: parse_timestamp_column(4, &created_raw)?,
                })
            },
        )
        .context("failed to run context search")?;
    collect_rows(rows)
}

fn tags_histogram(
    tx: &Transaction<'_>,
    owner: Option<&str>,
) -> Result<BTreeMap<String, usize>, CacheError> {
    let mut stmt = tx
        .prepare(
            "SELECT tag, COUNT(*) FROM contexts
             WHERE (?1 IS NULL OR owner = ?1)
             GROUP BY tag",
        )
        .context("failed to prepare tag histogram")?;
    let rows = stmt
        .query_map(params![owner], |row| {
            Ok((row.get::<_, String>(0)?, sql_to_count(row.get(1)?)))
        })
        .context("failed to query tag histogram")?;
    Ok(collect_rows(rows)?.into_iter().collect())
}

/// Deletes the oldest rows so that one more insert stays within `cap`.
fn evict_oldest(
    tx: &Transaction<'_>,
    count_sql: &str,
    delete_sql: &str,
    owner: Option<&str>,
    cap: usize,
) -> Result<usize, CacheError> {
    let count: i64 = match owner {
        Some(owner) => tx.query_row(count_sql, params![owner], |row| row.get(0)),
        None => tx.query_row(count_sql, [], |row| row.get(0)),
    }
    .context("failed to count contexts")?;

    let excess = (sql_to_count(count) + 1).saturating_sub(cap);
    if excess == 0 {
        return Ok(0);
    }

    let deleted = match owner {
        Some(owner) => tx.execute(delete_sql, params![count_to_sql(excess), owner]),
        None => tx.execute(delete_sql, params![count_to_sql(excess)]),
    };
    deleted.context("failed to evict contexts")
}

fn parse_context_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextRecord> {
    let content_raw: String = row.get(3)?;
    let metadata_raw: String = row.get(5)?;
    let created_raw: String = row.get(6)?;
    let seen_raw: String = row.get(7)?;

    Ok(ContextRecord {
        id: ContextId(row.get(0)?),
        owner: row.get(1)?,
        tag: row.get(2)?,
        content: parse_json_column(3, &content_raw)?,
        content_hash: row.get(4)?,
        metadata: parse_json_column(5, &metadata_raw)?,
        created_at: parse_timestamp_column(6, &created_raw)?,
        last_seen_at: parse_timestamp_column(7, &seen_raw)?,
    })
}
