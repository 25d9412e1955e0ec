//! Conversation log repository.
//!
//! Each mutation is a single statement, so callers never observe a partially
//! applied change.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;
use tracing::debug;

use colloquy_core::error::ColloquyError;
use colloquy_core::types::{ConversationRecord, ConversationStats, NewConversation};

use crate::db::Database;

const SELECT_COLUMNS: &str =
    "SELECT id, user_query, ai_response, created_at, query_type, image_path FROM history";

/// Seconds in the window counted as "recent" by [`ConversationStore::stats`].
const RECENT_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;

/// Append-only log of conversation turns.
#[derive(Clone, Debug)]
pub struct ConversationStore {
    db: Arc<Database>,
}

impl ConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Ensure the schema exists. Idempotent.
    pub fn initialize(&self) -> Result<(), ColloquyError> {
        self.db.migrate()
    }

    /// Insert a turn and return its id. The timestamp is assigned here.
    pub fn append(&self, turn: &NewConversation) -> Result<i64, ColloquyError> {
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history (user_query, ai_response, query_type, image_path)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    turn.user_query,
                    turn.ai_response,
                    turn.kind.as_str(),
                    turn.image_ref,
                ],
            )
            .map_err(|e| ColloquyError::StorageWrite(format!("Failed to append turn: {}", e)))?;
            Ok(conn.last_insert_rowid())
        })?;
        debug!(id, kind = %turn.kind, "Conversation turn stored");
        Ok(id)
    }

    /// Newest-first records, all of them when `limit` is `None`.
    pub fn list_recent(&self, limit: Option<u64>) -> Result<Vec<ConversationRecord>, ColloquyError> {
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map(|l| l.min(i64::MAX as u64) as i64).unwrap_or(-1);
        self.query(
            &format!("{} ORDER BY id DESC LIMIT ?1", SELECT_COLUMNS),
            rusqlite::params![limit],
        )
    }

    /// Fetch a single record.
    pub fn get(&self, id: i64) -> Result<Option<ConversationRecord>, ColloquyError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_record(row)),
                )
                .optional()
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;
            row.transpose()
        })
    }

    /// Case-insensitive substring match against query or response, newest
    /// first. Wildcard characters in `term` match literally.
    pub fn search(&self, term: &str) -> Result<Vec<ConversationRecord>, ColloquyError> {
        let pattern = format!("%{}%", escape_like(term));
        self.query(
            &format!(
                "{} WHERE user_query LIKE ?1 ESCAPE '\\' OR ai_response LIKE ?1 ESCAPE '\\'
                 ORDER BY id DESC",
                SELECT_COLUMNS
            ),
            rusqlite::params![pattern],
        )
    }

    /// Remove one record. Returns the number of rows removed (0 or 1).
    pub fn delete_one(&self, id: i64) -> Result<usize, ColloquyError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM history WHERE id = ?1", rusqlite::params![id])
                .map_err(|e| ColloquyError::StorageWrite(format!("Failed to delete turn: {}", e)))
        })
    }

    /// Remove every record. Returns the number of rows removed.
    pub fn clear_all(&self) -> Result<usize, ColloquyError> {
        let removed = self.db.with_conn(|conn| {
            conn.execute("DELETE FROM history", [])
                .map_err(|e| ColloquyError::StorageWrite(format!("Failed to clear history: {}", e)))
        })?;
        debug!(removed, "Conversation history cleared");
        Ok(removed)
    }

    /// Aggregate counts, recomputed on every call.
    pub fn stats(&self) -> Result<ConversationStats, ColloquyError> {
        self.db.with_conn(|conn| {
            let total: i64 = conn
                .query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;

            let mut stmt = conn
                .prepare("SELECT query_type, COUNT(*) FROM history GROUP BY query_type")
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;
            let mut by_kind = BTreeMap::new();
            for row in rows {
                let (kind, count) = row.map_err(|e| ColloquyError::Storage(e.to_string()))?;
                by_kind.insert(kind, count as u64);
            }

            let cutoff = Utc::now().timestamp() - RECENT_WINDOW_SECS;
            let recent: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM history WHERE created_at >= ?1",
                    rusqlite::params![cutoff],
                    |row| row.get(0),
                )
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;

            Ok(ConversationStats {
                total: total as u64,
                by_kind,
                recent: recent as u64,
            })
        })
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ConversationRecord>, ColloquyError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params, |row| Ok(row_to_record(row)))
                .map_err(|e| ColloquyError::Storage(e.to_string()))?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(|e| ColloquyError::Storage(e.to_string()))??);
            }
            Ok(records)
        })
    }
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<ConversationRecord, ColloquyError> {
    let get_err = |e: rusqlite::Error| ColloquyError::Storage(e.to_string());
    let created_at: i64 = row.get(3).map_err(get_err)?;
    let kind: String = row.get(4).map_err(get_err)?;

    Ok(ConversationRecord {
        id: row.get(0).map_err(get_err)?,
        user_query: row.get(1).map_err(get_err)?,
        ai_response: row.get(2).map_err(get_err)?,
        created_at: Utc
            .timestamp_opt(created_at, 0)
            .single()
            .ok_or_else(|| ColloquyError::Storage(format!("Invalid timestamp: {}", created_at)))?,
        kind: kind.parse()?,
        image_ref: row.get(5).map_err(get_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::types::QueryKind;

    fn make_store() -> ConversationStore {
        ConversationStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[test]
    fn test_append_then_list_recent_returns_it() {
        let store = make_store();
        let first = store.append(&NewConversation::text("one", "1")).unwrap();
        let second = store.append(&NewConversation::text("hi", "hello")).unwrap();
        assert!(second > first);

        let latest = store.list_recent(Some(1)).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, second);
        assert_eq!(latest[0].user_query, "hi");
        assert_eq!(latest[0].ai_response, "hello");
        assert_eq!(latest[0].kind, QueryKind::Text);
        assert!((Utc::now() - latest[0].created_at).num_seconds() < 5);
    }

    #[test]
    fn test_ids_not_reused_after_delete() {
        let store = make_store();
        let a = store.append(&NewConversation::text("a", "a")).unwrap();
        store.delete_one(a).unwrap();
        let b = store.append(&NewConversation::text("b", "b")).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_list_and_stats_example() {
        let store = make_store();
        let a = store.append(&NewConversation::text("hi", "hello")).unwrap();
        let b = store
            .append(&NewConversation::image("cat?", "a feline", "/tmp/cat.png"))
            .unwrap();

        let all = store.list_recent(None).unwrap();
        let ids: Vec<i64> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b, a]);
        assert_eq!(all[0].image_ref.as_deref(), Some("/tmp/cat.png"));
        assert_eq!(all[0].kind, QueryKind::Image);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_kind.get("text"), Some(&1));
        assert_eq!(stats.by_kind.get("image"), Some(&1));
        assert_eq!(stats.recent, 2);
    }

    #[test]
    fn test_empty_store() {
        let store = make_store();
        assert!(store.list_recent(None).unwrap().is_empty());
        assert!(store.search("anything").unwrap().is_empty());
        assert_eq!(store.stats().unwrap(), ConversationStats::default());
    }

    #[test]
    fn test_search_is_case_insensitive_over_both_columns() {
        let store = make_store();
        let a = store.append(&NewConversation::text("Tell me about Rust", "ok")).unwrap();
        let b = store.append(&NewConversation::text("weather?", "RUSTY skies")).unwrap();
        store.append(&NewConversation::text("unrelated", "nothing")).unwrap();

        let hits: Vec<i64> = store.search("rust").unwrap().iter().map(|r| r.id).collect();
        assert_eq!(hits, vec![b, a]);
        assert!(store.search("zebra").unwrap().is_empty());
    }

    #[test]
    fn test_search_treats_wildcards_literally() {
        let store = make_store();
        let pct = store.append(&NewConversation::text("100% sure", "yes")).unwrap();
        store.append(&NewConversation::text("100 sure", "no")).unwrap();
        store.append(&NewConversation::text("a_b", "underscore")).unwrap();

        let hits = store.search("0%").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, pct);

        let hits = store.search("_").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_query, "a_b");
    }

    #[test]
    fn test_delete_and_clear_are_idempotent() {
        let store = make_store();
        let id = store.append(&NewConversation::text("q", "a")).unwrap();
        assert_eq!(store.delete_one(id).unwrap(), 1);
        assert_eq!(store.delete_one(id).unwrap(), 0);
        assert!(store.get(id).unwrap().is_none());

        store.append(&NewConversation::text("q", "a")).unwrap();
        assert_eq!(store.clear_all().unwrap(), 1);
        assert_eq!(store.clear_all().unwrap(), 0);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 0);
        assert!(stats.by_kind.is_empty());
    }

    #[test]
    fn test_initialize_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = ConversationStore::new(Arc::new(Database::new(&path).unwrap()));
            store.append(&NewConversation::text("kept", "yes")).unwrap();
        }
        let store = ConversationStore::new(Arc::new(Database::new(&path).unwrap()));
        store.initialize().unwrap();
        assert_eq!(store.list_recent(None).unwrap().len(), 1);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a%b_c\\d"), "a\\%b\\_c\\\\d");
        assert_eq!(escape_like("plain"), "plain");
    }
}
