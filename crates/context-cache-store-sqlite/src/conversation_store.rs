use std::path::Path;

use context_cache_core::{
    ensure_non_empty, format_timestamp, now_utc, render_conversation_context, CacheError,
    ConversationId, ConversationLimits, ConversationRecord, ConversationStats, ConversationStore,
    MessageRecord, Role, DEFAULT_CONVERSATION_TITLE,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    apply_schema, bool_to_sql, collect_rows, conversion_failure, count_to_sql,
    database_size_bytes, expiry_cutoff, parse_json_column, parse_timestamp_column, sql_to_bool,
    sql_to_count, tag_or_default, to_json_text, StorageContext,
};

const CONVERSATION_SCHEMA_VERSION: i64 = 2;

const SCHEMA_CONVERSATION_V2: &str = r"
CREATE TABLE IF NOT EXISTS conversations (
  conversation_id TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  title TEXT NOT NULL,
  created_at TEXT NOT NULL,
  last_updated_at TEXT NOT NULL,
  message_count INTEGER NOT NULL DEFAULT 0 CHECK (message_count >= 0),
  active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_conversations_owner_active
  ON conversations(owner, active, last_updated_at);
CREATE INDEX IF NOT EXISTS idx_conversations_updated
  ON conversations(last_updated_at);

CREATE TABLE IF NOT EXISTS messages (
  message_id INTEGER PRIMARY KEY AUTOINCREMENT,
  conversation_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
  content TEXT NOT NULL,
  metadata_json TEXT,
  tag TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (conversation_id) REFERENCES conversations(conversation_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_order
  ON messages(conversation_id, created_at, message_id);
";

const CONVERSATION_COLUMNS: &str =
    "conversation_id, owner, title, created_at, last_updated_at, message_count, active";

/// Bounded multi-turn history. Owners keep at most a fixed number of active
/// conversations; older ones are deactivated and lose their messages.
pub struct SqliteConversationStore {
    conn: Mutex<Connection>,
    limits: ConversationLimits,
}

impl SqliteConversationStore {
    /// Opens (or creates) the database, applies the schema and sweeps
    /// conversations idle longer than the configured age.
    pub fn open(path: &Path, limits: ConversationLimits) -> Result<Self, CacheError> {
        limits.validate()?;
        let conn = crate::open_connection(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            limits,
        };
        store.migrate()?;

        let deleted = store.try_sweep_expired_at(now_utc())?;
        if deleted > 0 {
            tracing::info!(deleted, "startup sweep removed expired conversations");
        }
        Ok(store)
    }

    pub fn migrate(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        apply_schema(&conn, CONVERSATION_SCHEMA_VERSION, SCHEMA_CONVERSATION_V2)
    }

    #[must_use]
    pub fn limits(&self) -> &ConversationLimits {
        &self.limits
    }

    pub fn try_start(&self, owner: &str, title: Option<&str>) -> Result<ConversationId, CacheError> {
        self.try_start_at(owner, title, now_utc())
    }

    /// Creates an active conversation, then deactivates the owner's oldest
    /// active conversations beyond the cap.
    pub fn try_start_at(
        &self,
        owner: &str,
        title: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<ConversationId, CacheError> {
        ensure_non_empty("owner", owner)?;
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(DEFAULT_CONVERSATION_TITLE);
        let id = ConversationId::new();
        let now_text = format_timestamp(now)?;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start conversation transaction")?;

        tx.execute(
            "INSERT INTO conversations(conversation_id, owner, title, created_at, last_updated_at, message_count, active)
             VALUES (?1, ?2, ?3, ?4, ?4, 0, 1)",
            params![id.to_string(), owner, title, now_text],
        )
        .context("failed to insert conversation")?;

        let evicted = evict_over_cap(&tx, owner, self.limits.max_conversations_per_owner)?;
        tx.commit().context("failed to commit conversation start")?;

        if !evicted.is_empty() {
            tracing::debug!(
                owner,
                evicted = evicted.len(),
                "deactivated conversations over owner cap"
            );
        }
        Ok(id)
    }

    pub fn try_add_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        metadata: Option<&Value>,
        tag: Option<&str>,
    ) -> Result<i64, CacheError> {
        self.try_add_message_at(conversation_id, role, content, metadata, tag, now_utc())
    }

    /// Appends a message to an active conversation and returns its id.
    ///
    /// Past the per-conversation cap the oldest messages are trimmed so that
    /// `message_count` always equals the number of stored messages.
    pub fn try_add_message_at(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        metadata: Option<&Value>,
        tag: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<i64, CacheError> {
        ensure_non_empty("content", content)?;
        let tag = tag_or_default(tag);
        let metadata_json = metadata.map(to_json_text).transpose()?;
        let now_text = format_timestamp(now)?;
        let id_text = conversation_id.to_string();

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start message transaction")?;

        let active: Option<i64> = tx
            .query_row(
                "SELECT active FROM conversations WHERE conversation_id = ?1",
                params![id_text],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up conversation")?;
        match active {
            None => {
                return Err(CacheError::Validation(format!(
                    "conversation {conversation_id} does not exist"
                )))
            }
            Some(flag) if !sql_to_bool(flag) => {
                return Err(CacheError::Validation(format!(
                    "conversation {conversation_id} is no longer active"
                )))
            }
            Some(_) => {}
        }

        tx.execute(
            "INSERT INTO messages(conversation_id, role, content, metadata_json, tag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id_text, role.as_str(), content, metadata_json, tag, now_text],
        )
        .context("failed to insert message")?;
        let message_id = tx.last_insert_rowid();

        let trimmed = tx
            .execute(
                "DELETE FROM messages WHERE message_id IN (
                     SELECT message_id FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, message_id DESC
                     LIMIT -1 OFFSET ?2
                 )",
                params![id_text, count_to_sql(self.limits.max_messages_per_conversation)],
            )
            .context("failed to trim old messages")?;

        tx.execute(
            "UPDATE conversations
             SET message_count = (SELECT COUNT(*) FROM messages WHERE conversation_id = ?1),
                 last_updated_at = ?2
             WHERE conversation_id = ?1",
            params![id_text, now_text],
        )
        .context("failed to update conversation counters")?;
        tx.commit().context("failed to commit message")?;

        if trimmed > 0 {
            tracing::debug!(conversation_id = %conversation_id, trimmed, "trimmed old messages");
        }
        Ok(message_id)
    }

    /// The most recent `limit` messages, oldest first.
    pub fn try_history(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, CacheError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT message_id, conversation_id, role, content, metadata_json, tag, created_at
                 FROM (
                     SELECT * FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, message_id DESC
                     LIMIT ?2
                 )
                 ORDER BY created_at ASC, message_id ASC",
            )
            .context("failed to prepare history query")?;
        let rows = stmt
            .query_map(
                params![conversation_id.to_string(), count_to_sql(limit)],
                parse_message_row,
            )
            .context("failed to query history")?;
        collect_rows(rows)
    }

    pub fn try_format_as_context(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<String, CacheError> {
        let messages = self.try_history(conversation_id, limit)?;
        Ok(render_conversation_context(&messages))
    }

    /// Most recently updated active conversation for `owner`.
    pub fn try_active_conversation(&self, owner: &str) -> Result<Option<ConversationId>, CacheError> {
        ensure_non_empty("owner", owner)?;
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT conversation_id FROM conversations
                 WHERE owner = ?1 AND active = 1
                 ORDER BY last_updated_at DESC, created_at DESC, rowid DESC
                 LIMIT 1",
                params![owner],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up active conversation")?;

        raw.map(|raw| raw.parse()).transpose()
    }

    pub fn try_get(&self, conversation_id: ConversationId) -> Result<Option<ConversationRecord>, CacheError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = ?1"),
            params![conversation_id.to_string()],
            parse_conversation_row,
        )
        .optional()
        .context("failed to load conversation")
    }

    /// Conversations for `owner`, most recently updated first.
    pub fn try_list(
        &self,
        owner: &str,
        include_inactive: bool,
    ) -> Result<Vec<ConversationRecord>, CacheError> {
        ensure_non_empty("owner", owner)?;
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE owner = ?1 AND (?2 = 1 OR active = 1)
                 ORDER BY last_updated_at DESC, created_at DESC, rowid DESC"
            ))
            .context("failed to prepare conversation list")?;
        let rows = stmt
            .query_map(
                params![owner, bool_to_sql(include_inactive)],
                parse_conversation_row,
            )
            .context("failed to list conversations")?;
        collect_rows(rows)
    }

    /// Deletes the messages of a conversation but keeps the record and title.
    /// Returns `false` when the conversation does not exist.
    pub fn try_clear(&self, conversation_id: ConversationId) -> Result<bool, CacheError> {
        self.try_clear_at(conversation_id, now_utc())
    }

    pub fn try_clear_at(
        &self,
        conversation_id: ConversationId,
        now: OffsetDateTime,
    ) -> Result<bool, CacheError> {
        let now_text = format_timestamp(now)?;
        let id_text = conversation_id.to_string();

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start clear transaction")?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id_text],
        )
        .context("failed to delete conversation messages")?;
        let updated = tx
            .execute(
                "UPDATE conversations SET message_count = 0, last_updated_at = ?2
                 WHERE conversation_id = ?1",
                params![id_text, now_text],
            )
            .context("failed to reset conversation")?;
        tx.commit().context("failed to commit clear")?;

        Ok(updated > 0)
    }

    /// Removes a conversation and its messages. Returns `false` when there was
    /// nothing to delete.
    pub fn try_delete(&self, conversation_id: ConversationId) -> Result<bool, CacheError> {
        let id_text = conversation_id.to_string();
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start delete transaction")?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id_text],
        )
        .context("failed to delete conversation messages")?;
        let deleted = tx
            .execute(
                "DELETE FROM conversations WHERE conversation_id = ?1",
                params![id_text],
            )
            .context("failed to delete conversation")?;
        tx.commit().context("failed to commit delete")?;

        Ok(deleted > 0)
    }

    pub fn try_stats(&self) -> Result<ConversationStats, CacheError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start stats transaction")?;

        let (active, inactive, owners): (i64, i64, i64) = tx
            .query_row(
                "SELECT COALESCE(SUM(active), 0),
                        COALESCE(SUM(1 - active), 0),
                        COUNT(DISTINCT owner)
                 FROM conversations",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("failed to count conversations")?;
        let messages: i64 = tx
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .context("failed to count messages")?;
        let database_size_bytes = database_size_bytes(&tx)?;
        tx.commit().context("failed to commit stats")?;

        Ok(ConversationStats {
            active_conversations: sql_to_count(active),
            inactive_conversations: sql_to_count(inactive),
            total_messages: sql_to_count(messages),
            unique_owners: sql_to_count(owners),
            database_size_bytes,
            limits: self.limits,
        })
    }

    pub fn try_sweep_expired(&self) -> Result<usize, CacheError> {
        self.try_sweep_expired_at(now_utc())
    }

    /// Hard-deletes conversations, active or not, idle past the configured
    /// age, along with their messages.
    pub fn try_sweep_expired_at(&self, now: OffsetDateTime) -> Result<usize, CacheError> {
        let Some(cutoff) = expiry_cutoff(now, self.limits.max_age())? else {
            return Ok(0);
        };
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start sweep transaction")?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id IN (
                 SELECT conversation_id FROM conversations WHERE last_updated_at < ?1
             )",
            params![cutoff],
        )
        .context("failed to sweep expired messages")?;
        let deleted = tx
            .execute(
                "DELETE FROM conversations WHERE last_updated_at < ?1",
                params![cutoff],
            )
            .context("failed to sweep expired conversations")?;
        tx.commit().context("failed to commit sweep")?;

        if deleted > 0 {
            tracing::debug!(deleted, "swept expired conversations");
        }
        Ok(deleted)
    }

    #[cfg(test)]
    fn connection(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

impl ConversationStore for SqliteConversationStore {
    fn start(&self, owner: &str, title: Option<&str>) -> Option<ConversationId> {
        match self.try_start(owner, title) {
            Ok(id) => Some(id),
            Err(err) => {
                tracing::warn!(owner, error = %err, "failed to start conversation");
                None
            }
        }
    }

    fn add_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        metadata: Option<&Value>,
        tag: Option<&str>,
    ) -> bool {
        match self.try_add_message(conversation_id, role, content, metadata, tag) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %err,
                    "failed to add message"
                );
                false
            }
        }
    }

    fn history(&self, conversation_id: ConversationId, limit: usize) -> Vec<MessageRecord> {
        self.try_history(conversation_id, limit).unwrap_or_else(|err| {
            tracing::warn!(conversation_id = %conversation_id, error = %err, "failed to load history");
            Vec::new()
        })
    }

    fn active_conversation(&self, owner: &str) -> Option<ConversationId> {
        self.try_active_conversation(owner).unwrap_or_else(|err| {
            tracing::warn!(owner, error = %err, "failed to look up active conversation");
            None
        })
    }

    fn clear(&self, conversation_id: ConversationId) -> bool {
        self.try_clear(conversation_id).unwrap_or_else(|err| {
            tracing::warn!(conversation_id = %conversation_id, error = %err, "failed to clear conversation");
            false
        })
    }

    fn delete(&self, conversation_id: ConversationId) -> bool {
        self.try_delete(conversation_id).unwrap_or_else(|err| {
            tracing::warn!(conversation_id = %conversation_id, error = %err, "failed to delete conversation");
            false
        })
    }

    fn format_as_context(&self, conversation_id: ConversationId, limit: usize) -> String {
        self.try_format_as_context(conversation_id, limit)
            .unwrap_or_else(|err| {
                tracing::warn!(conversation_id = %conversation_id, error = %err, "failed to format history");
                String::new()
            })
    }

    fn sweep_expired(&self) -> usize {
        self.try_sweep_expired().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to sweep conversations");
            0
        })
    }
}

/// Deactivates the owner's oldest active conversations beyond `cap` and drops
/// their messages. Returns the evicted ids.
fn evict_over_cap(
    tx: &Transaction<'_>,
    owner: &str,
    cap: usize,
) -> Result<Vec<String>, CacheError> {
    let evicted = {
        let mut stmt = tx
            .prepare(
                "SELECT conversation_id FROM conversations
                 WHERE owner = ?1 AND active = 1
                 ORDER BY last_updated_at DESC, created_at DESC, rowid DESC
                 LIMIT -1 OFFSET ?2",
            )
            .context("failed to prepare eviction query")?;
        let rows = stmt
            .query_map(params![owner, count_to_sql(cap)], |row| row.get::<_, String>(0))
            .context("failed to select conversations to evict")?;
        collect_rows(rows)?
    };

    for id in &evicted {
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![id],
        )
        .context("failed to drop evicted messages")?;
        tx.execute(
            "UPDATE conversations SET active = 0, message_count = 0 WHERE conversation_id = ?1",
            params![id],
        )
        .context("failed to deactivate conversation")?;
    }

    Ok(evicted)
}

fn parse_conversation_id(column: usize, raw: &str) -> rusqlite::Result<ConversationId> {
    Ulid::from_string(raw)
        .map(ConversationId)
        .map_err(|_| conversion_failure(column, format!("invalid ULID: {raw}")))
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRecord> {
    let id_raw: String = row.get(0)?;
    let created_raw: String = row.get(3)?;
    let updated_raw: String = row.get(4)?;
    let message_count: i64 = row.get(5)?;
    let active: i64 = row.get(6)?;

    Ok(ConversationRecord {
        id: parse_conversation_id(0, &id_raw)?,
        owner: row.get(1)?,
        title: row.get(2)?,
        created_at: parse_timestamp_column(3, &created_raw)?,
        last_updated_at: parse_timestamp_column(4, &updated_raw)?,
        message_count: sql_to_count(message_count),
        active: sql_to_bool(active),
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let conversation_raw: String = row.get(1)?;
    let role_raw: String = row.get(2)?;
    let metadata_raw: Option<String> = row.get(4)?;
    let created_raw: String = row.get(6)?;

    let role = Role::parse(&role_raw)
        .ok_or_else(|| conversion_failure(2, format!("invalid role: {role_raw}")))?;
    let metadata = metadata_raw
        .as_deref()
        .map(|raw| parse_json_column(4, raw))
        .transpose()?;

    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: parse_conversation_id(1, &conversation_raw)?,
        role,
        content: row.get(3)?,
        metadata,
        tag: row.get(5)?,
        timestamp: parse_timestamp_column(6, &created_raw)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use context_cache_core::{parse_timestamp, CONVERSATION_HISTORY_HEADER};
    use serde_json::json;
    use std::sync::Arc;
    use time::Duration;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store(limits: ConversationLimits) -> SqliteConversationStore {
        must(SqliteConversationStore::open(Path::new(":memory:"), limits))
    }

    fn base_time() -> OffsetDateTime {
        now_utc() - Duration::hours(2)
    }

    fn message_rows(store: &SqliteConversationStore, id: ConversationId) -> usize {
        let conn = store.connection();
        let count: i64 = must(conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        ));
        sql_to_count(count)
    }

    fn load(store: &SqliteConversationStore, id: ConversationId) -> ConversationRecord {
        match must(store.try_get(id)) {
            Some(record) => record,
            None => panic!("conversation {id} missing"),
        }
    }

    #[test]
    fn start_uses_default_title_and_is_active() {
        let store = fixture_store(ConversationLimits::default());
        let id = must(store.try_start_at("alice", None, base_time()));
        let record = load(&store, id);
        assert_eq!(record.title, DEFAULT_CONVERSATION_TITLE);
        assert!(record.active);
        assert_eq!(record.message_count, 0);
        assert_eq!(record.created_at, record.last_updated_at);

        let titled = must(store.try_start_at("alice", Some("Plots"), base_time()));
        assert_eq!(load(&store, titled).title, "Plots");
    }

    #[test]
    fn eleventh_conversation_evicts_the_oldest() {
        let store = fixture_store(ConversationLimits::default());
        let start = base_time();

        let mut ids = Vec::new();
        for index in 0..10 {
            let at = start + Duration::minutes(index);
            let id = must(store.try_start_at("alice", None, at));
            must(store.try_add_message_at(id, Role::User, "hello", None, None, at));
            ids.push(id);
        }
        let other = must(store.try_start_at("bob", None, start));

        let newest = must(store.try_start_at("alice", None, start + Duration::minutes(30)));

        let active = must(store.try_list("alice", false));
        assert_eq!(active.len(), 10);
        assert!(active.iter().any(|record| record.id == newest));

        let evicted = load(&store, ids[0]);
        assert!(!evicted.active);
        assert_eq!(evicted.message_count, 0);
        assert_eq!(message_rows(&store, ids[0]), 0);
        assert_eq!(message_rows(&store, ids[1]), 1);
        assert!(load(&store, other).active);
        assert_eq!(must(store.try_list("alice", true)).len(), 11);
    }

    #[test]
    fn eviction_follows_last_update_not_creation() {
        let store = fixture_store(ConversationLimits {
            max_conversations_per_owner: 2,
            ..ConversationLimits::default()
        });
        let start = base_time();
        let first = must(store.try_start_at("alice", None, start));
        let second = must(store.try_start_at("alice", None, start + Duration::minutes(1)));
        must(store.try_add_message_at(first, Role::User, "still here", None, None, start + Duration::minutes(2)));

        must(store.try_start_at("alice", None, start + Duration::minutes(3)));
        assert!(load(&store, first).active);
        assert!(!load(&store, second).active);
    }

    #[test]
    fn add_message_updates_count_and_timestamp() {
        let store = fixture_store(ConversationLimits::default());
        let start = base_time();
        let id = must(store.try_start_at("alice", None, start));
        let later = start + Duration::minutes(3);
        let metadata = json!({"workspace": ["df"]});
        must(store.try_add_message_at(id, Role::User, "how to plot", Some(&metadata), Some("plots"), later));

        let record = load(&store, id);
        assert_eq!(record.message_count, 1);
        assert_eq!(record.last_updated_at, later);

        let history = must(store.try_history(id, 10));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].metadata, Some(metadata));
        assert_eq!(history[0].tag, "plots");
        assert_eq!(history[0].role, Role::User);
    }

    #[test]
    fn add_message_rejects_missing_and_evicted_conversations() {
        let store = fixture_store(ConversationLimits {
            max_conversations_per_owner: 1,
            ..ConversationLimits::default()
        });
        let start = base_time();
        let old = must(store.try_start_at("alice", None, start));
        must(store.try_start_at("alice", None, start + Duration::minutes(1)));

        let err = store.try_add_message(old, Role::User, "hi", None, None);
        assert!(matches!(err, Err(CacheError::Validation(_))));
        assert_eq!(message_rows(&store, old), 0);

        let missing = ConversationId::new();
        let trait_store: &dyn ConversationStore = &store;
        assert!(!trait_store.add_message(missing, Role::User, "hi", None, None));
        assert!(!trait_store.add_message(old, Role::Assistant, "hi", None, None));
    }

    #[test]
    fn empty_message_content_is_rejected() {
        let store = fixture_store(ConversationLimits::default());
        let id = must(store.try_start("alice", None));
        assert!(matches!(
            store.try_add_message(id, Role::User, "  ", None, None),
            Err(CacheError::Validation(_))
        ));
        assert_eq!(load(&store, id).message_count, 0);
    }

    #[test]
    fn history_is_oldest_first_within_the_recent_window() {
        let store = fixture_store(ConversationLimits::default());
        let start = base_time();
        let id = must(store.try_start_at("alice", None, start));
        for index in 0..6 {
            let role = if index % 2 == 0 { Role::User } else { Role::Assistant };
            must(store.try_add_message_at(
                id,
                role,
                &format!("turn {index}"),
                None,
                None,
                start + Duration::seconds(index),
            ));
        }

        let window = must(store.try_history(id, 3));
        let contents = window.iter().map(|message| message.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["turn 3", "turn 4", "turn 5"]);
        assert!(must(store.try_history(id, 0)).is_empty());
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let store = fixture_store(ConversationLimits::default());
        let at = base_time();
        let id = must(store.try_start_at("alice", None, at));
        for index in 0..3 {
            must(store.try_add_message_at(id, Role::User, &format!("same {index}"), None, None, at));
        }
        let history = must(store.try_history(id, 10));
        let contents = history.iter().map(|message| message.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["same 0", "same 1", "same 2"]);
    }

    #[test]
    fn message_cap_trims_oldest_and_keeps_count_in_sync() {
        let store = fixture_store(ConversationLimits {
            max_messages_per_conversation: 4,
            ..ConversationLimits::default()
        });
        let start = base_time();
        let id = must(store.try_start_at("alice", None, start));
        for index in 0..7 {
            must(store.try_add_message_at(
                id,
                Role::User,
                &format!("turn {index}"),
                None,
                None,
                start + Duration::seconds(index),
            ));
        }

        assert_eq!(message_rows(&store, id), 4);
        assert_eq!(load(&store, id).message_count, 4);
        let history = must(store.try_history(id, 10));
        assert_eq!(history[0].content, "turn 3");
    }

    #[test]
    fn clear_zeroes_messages_and_keeps_title() {
        let store = fixture_store(ConversationLimits::default());
        let id = must(store.try_start_at("alice", Some("Modeling"), base_time()));
        must(store.try_add_message(id, Role::User, "fit a model", None, None));
        must(store.try_add_message(id, Role::Assistant, "use lm()", None, None));

        assert!(must(store.try_clear(id)));
        let record = load(&store, id);
        assert_eq!(record.message_count, 0);
        assert_eq!(record.title, "Modeling");
        assert!(record.active);
        assert_eq!(message_rows(&store, id), 0);

        assert!(!must(store.try_clear(ConversationId::new())));
    }

    #[test]
    fn delete_removes_record_and_messages() {
        let store = fixture_store(ConversationLimits::default());
        let id = must(store.try_start("alice", None));
        must(store.try_add_message(id, Role::User, "hello", None, None));

        assert!(must(store.try_delete(id)));
        assert!(must(store.try_get(id)).is_none());
        assert_eq!(message_rows(&store, id), 0);
        assert!(!must(store.try_delete(id)));
    }

    #[test]
    fn active_conversation_is_most_recently_updated() {
        let store = fixture_store(ConversationLimits::default());
        let start = base_time();
        assert!(must(store.try_active_conversation("alice")).is_none());

        let first = must(store.try_start_at("alice", None, start));
        let second = must(store.try_start_at("alice", None, start + Duration::minutes(1)));
        assert_eq!(must(store.try_active_conversation("alice")), Some(second));

        must(store.try_add_message_at(first, Role::User, "back again", None, None, start + Duration::minutes(2)));
        assert_eq!(must(store.try_active_conversation("alice")), Some(first));
    }

    #[test]
    fn format_as_context_renders_header_and_turns() {
        let store = fixture_store(ConversationLimits::default());
        let start = base_time();
        let id = must(store.try_start_at("alice", None, start));
        assert_eq!(must(store.try_format_as_context(id, 5)), "");

        must(store.try_add_message_at(id, Role::User, "how to plot", None, None, start));
        must(store.try_add_message_at(
            id,
            Role::Assistant,
            "use ggplot",
            Some(&json!({"code": "ggplot(df)"})),
            None,
            start + Duration::seconds(1),
        ));

        let rendered = must(store.try_format_as_context(id, 5));
        assert!(rendered.contains(CONVERSATION_HISTORY_HEADER));
        assert!(rendered.contains("User (Message 1):\nhow to plot\n"));
        assert!(rendered.contains("Assistant (Message 2):\nuse ggplot\n"));
        assert!(rendered.contains("Context: {"));
    }

    #[test]
    fn unbounded_age_opens_and_sweeps_nothing() {
        let store = fixture_store(ConversationLimits {
            max_conversation_age_days: u32::MAX,
            ..ConversationLimits::default()
        });
        let old = must(parse_timestamp("2001-01-01T00:00:00Z"));
        let id = must(store.try_start_at("alice", None, old));

        assert_eq!(must(store.try_sweep_expired_at(now_utc())), 0);
        assert!(must(store.try_get(id)).is_some());
        assert_eq!(store.sweep_expired(), 0);
    }

    #[test]
    fn sweep_removes_idle_conversations_and_their_messages() {
        let store = fixture_store(ConversationLimits::default());
        let now = base_time();
        let max_age = store.limits().max_age();

        let idle_at = now - max_age - Duration::minutes(1);
        let idle = must(store.try_start_at("alice", None, idle_at));
        must(store.try_add_message_at(idle, Role::User, "old", None, None, idle_at));
        let recent_at = now - max_age + Duration::minutes(1);
        let recent = must(store.try_start_at("alice", None, recent_at));

        assert_eq!(must(store.try_sweep_expired_at(now)), 1);
        assert!(must(store.try_get(idle)).is_none());
        assert_eq!(message_rows(&store, idle), 0);
        assert!(must(store.try_get(recent)).is_some());
    }

    #[test]
    fn stats_count_active_inactive_and_messages() {
        let store = fixture_store(ConversationLimits {
            max_conversations_per_owner: 1,
            ..ConversationLimits::default()
        });
        let start = base_time();
        must(store.try_start_at("alice", None, start));
        let kept = must(store.try_start_at("alice", None, start + Duration::minutes(1)));
        must(store.try_start_at("bob", None, start));
        must(store.try_add_message(kept, Role::User, "hi", None, None));

        let stats = must(store.try_stats());
        assert_eq!(stats.active_conversations, 2);
        assert_eq!(stats.inactive_conversations, 1);
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.unique_owners, 2);
        assert!(stats.database_size_bytes > 0);
    }

    #[test]
    fn trait_surface_maps_failures_to_empty_outcomes() {
        let store = fixture_store(ConversationLimits::default());
        let store: &dyn ConversationStore = &store;
        assert!(store.start("", None).is_none());
        assert!(store.active_conversation("").is_none());

        let Some(id) = store.start("alice", None) else {
            panic!("start failed");
        };
        assert!(store.add_message(id, Role::User, "hello", None, None));
        assert_eq!(store.history(id, 10).len(), 1);
        assert!(store.format_as_context(id, 10).contains("User (Message 1):"));
        assert!(store.clear(id));
        assert!(store.delete(id));
        assert!(!store.delete(id));
        assert_eq!(store.format_as_context(id, 10), "");
    }

    #[test]
    fn concurrent_starts_respect_owner_cap() {
        let path = std::env::temp_dir().join(format!("context-cache-conv-{}.sqlite3", Ulid::new()));
        let limits = ConversationLimits {
            max_conversations_per_owner: 3,
            ..ConversationLimits::default()
        };
        let store = Arc::new(must(SqliteConversationStore::open(&path, limits)));

        let handles = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if let Some(id) = store.start("alice", None) {
                            let _ = store.add_message(id, Role::User, "hi", None, None);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.join().is_ok());
        }

        assert_eq!(must(store.try_list("alice", false)).len(), 3);
        assert_eq!(must(store.try_list("alice", true)).len(), 40);
        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn timestamps_survive_storage_round_trip() {
        let store = fixture_store(ConversationLimits::default());
        let at = must(parse_timestamp("2030-05-01T08:09:10.123456789Z"));
        let id = must(store.try_start_at("alice", None, at));
        assert_eq!(load(&store, id).created_at, at);
    }
}
