use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, types::Type, Connection};
use serde_json::Map;

use cbus_protocol::{EngramMessage, EngramMeta, Role};

use super::{EngramStore, IngestOutcome, StorageError, DEFAULT_KEEP_LAST};

/// SQLite-backed engram store.
///
/// Uses a `Mutex<Connection>` for thread-safe interior mutability; the
/// single lock also serializes the store-vs-append decision in
/// [`ingest`](EngramStore::ingest). The schema is created/migrated on
/// `open()`.
pub struct SqliteEngramStore {
    conn: Mutex<Connection>,
}

impl SqliteEngramStore {
    /// Open (or create) a sqlite database at the given path.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Lock)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS engrams (
                engram_id  TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                meta_json  TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS messages (
                id         TEXT PRIMARY KEY,
                engram_id  TEXT NOT NULL,
                role       TEXT NOT NULL,
                text       TEXT NOT NULL,
                timestamp  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_engram_id
                ON messages (engram_id);
            ",
        )?;
        Ok(())
    }
}

fn insert_message(
    conn: &Connection,
    engram_id: &str,
    msg: &EngramMessage,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR REPLACE INTO messages (id, engram_id, role, text, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            msg.id,
            engram_id,
            msg.role.as_str(),
            msg.text,
            msg.timestamp,
        ],
    )?;
    Ok(())
}

fn upsert_meta(conn: &Connection, meta: &EngramMeta) -> Result<(), StorageError> {
    let meta_json = serde_json::to_string(&meta.meta)?;
    conn.execute(
        "INSERT INTO engrams (engram_id, created_at, meta_json)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(engram_id) DO UPDATE SET
            created_at = excluded.created_at,
            meta_json = excluded.meta_json",
        params![meta.engram_id, meta.created_at, meta_json],
    )?;
    Ok(())
}

fn engram_exists(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let mut stmt = conn.prepare("SELECT 1 FROM engrams WHERE engram_id = ?1 LIMIT 1")?;
    let mut rows = stmt.query_map(params![id], |row| row.get::<_, i32>(0))?;
    Ok(rows.next().is_some())
}

fn parse_meta_json(raw: String) -> Result<Map<String, serde_json::Value>, rusqlite::Error> {
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))
}

impl EngramStore for SqliteEngramStore {
    fn init(&self) -> Result<(), StorageError> {
        self.migrate()
    }

    fn store(
        &self,
        id: &str,
        meta: &EngramMeta,
        messages: &[EngramMessage],
    ) -> Result<(), StorageError> {
        let conn = self.lock()?;
        upsert_meta(&conn, meta)?;
        for msg in messages {
            insert_message(&conn, id, msg)?;
        }
        Ok(())
    }

    fn append(&self, id: &str, message: &EngramMessage) -> Result<(), StorageError> {
        let conn = self.lock()?;
        insert_message(&conn, id, message)
    }

    fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        engram_exists(&conn, id)
    }

    fn ingest(&self, message: &EngramMessage) -> Result<IngestOutcome, StorageError> {
        let conn = self.lock()?;
        let outcome = if engram_exists(&conn, &message.engram_id)? {
            IngestOutcome::Appended
        } else {
            let meta = EngramMeta {
                engram_id: message.engram_id.clone(),
                created_at: Utc::now().to_rfc3339(),
                meta: Map::new(),
            };
            upsert_meta(&conn, &meta)?;
            IngestOutcome::Created
        };
        insert_message(&conn, &message.engram_id, message)?;
        Ok(outcome)
    }

    fn load(&self, id: Option<&str>) -> Result<Vec<EngramMessage>, StorageError> {
        let Some(id) = id else {
            return Ok(Vec::new());
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, engram_id, role, text, timestamp
             FROM messages
             WHERE engram_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(EngramMessage {
                id: row.get(0)?,
                engram_id: row.get(1)?,
                role: Role::from_label(&row.get::<_, String>(2)?),
                text: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list(&self) -> Result<Vec<EngramMeta>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT engram_id, created_at, meta_json
             FROM engrams
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let meta = parse_meta_json(row.get(2)?)?;
            Ok(EngramMeta {
                engram_id: row.get(0)?,
                created_at: row.get(1)?,
                meta,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM engrams WHERE engram_id = ?1", params![id])?;
        conn.execute("DELETE FROM messages WHERE engram_id = ?1", params![id])?;
        Ok(())
    }

    fn prune(&self, id: &str, keep_last: Option<usize>) -> Result<usize, StorageError> {
        let keep = keep_last.unwrap_or(DEFAULT_KEEP_LAST);
        let conn = self.lock()?;
        let count: usize = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE engram_id = ?1",
            params![id],
            |row| row.get::<_, i64>(0).map(|n| n as usize),
        )?;
        if count <= keep {
            return Ok(0);
        }
        let excess = count - keep;
        conn.execute(
            "DELETE FROM messages
             WHERE rowid IN (
                SELECT rowid FROM messages
                WHERE engram_id = ?1
                ORDER BY rowid ASC
                LIMIT ?2
             )",
            params![id, excess as i64],
        )?;
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::message_id;

    fn make_store() -> SqliteEngramStore {
        SqliteEngramStore::open_memory().unwrap()
    }

    fn msg(engram_id: &str, role: Role, text: &str) -> EngramMessage {
        EngramMessage {
            id: message_id(),
            engram_id: engram_id.into(),
            role,
            text: text.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn init_is_idempotent() {
        let store = make_store();
        store.init().unwrap();
        store.init().unwrap();
    }

    #[test]
    fn ingest_creates_then_appends() {
        let store = make_store();
        let first = store.ingest(&msg("c1", Role::User, "hello")).unwrap();
        assert_eq!(first, IngestOutcome::Created);
        let second = store.ingest(&msg("c1", Role::User, "again")).unwrap();
        assert_eq!(second, IngestOutcome::Appended);

        let metas = store.list().unwrap();
        assert_eq!(metas.len(), 1, "repeat ingest must not duplicate metadata");
        assert_eq!(store.load(Some("c1")).unwrap().len(), 2);
    }

    #[test]
    fn load_unknown_or_absent_id_is_empty() {
        let store = make_store();
        assert!(store.load(Some("nope")).unwrap().is_empty());
        assert!(store.load(None).unwrap().is_empty());
    }

    #[test]
    fn load_preserves_insertion_order() {
        let store = make_store();
        for text in ["a", "b", "c"] {
            store.ingest(&msg("c1", Role::User, text)).unwrap();
        }
        let texts: Vec<String> = store
            .load(Some("c1"))
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["a", "b", "c"]);
    }

    #[test]
    fn store_overwrites_meta_and_inserts_messages() {
        let store = make_store();
        let mut meta_map = Map::new();
        meta_map.insert("title".into(), serde_json::json!("first"));
        let meta = EngramMeta {
            engram_id: "c1".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            meta: meta_map,
        };
        let messages = vec![msg("c1", Role::User, "one"), msg("c1", Role::Tool, "two")];
        store.store("c1", &meta, &messages).unwrap();

        assert!(store.exists("c1").unwrap());
        let loaded = store.load(Some("c1")).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].role, Role::Tool);

        let metas = store.list().unwrap();
        assert_eq!(metas[0].meta.get("title"), Some(&serde_json::json!("first")));
    }

    #[test]
    fn delete_removes_meta_and_messages() {
        let store = make_store();
        store.ingest(&msg("c1", Role::User, "hello")).unwrap();
        store.delete("c1").unwrap();
        assert!(!store.exists("c1").unwrap());
        assert!(store.load(Some("c1")).unwrap().is_empty());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_most_recent_by_insertion_order() {
        let store = make_store();
        for i in 0..7 {
            store
                .ingest(&msg("c1", Role::User, &format!("m{i}")))
                .unwrap();
        }
        let removed = store.prune("c1", Some(3)).unwrap();
        assert_eq!(removed, 4);
        let texts: Vec<String> = store
            .load(Some("c1"))
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, ["m4", "m5", "m6"]);
    }

    #[test]
    fn prune_under_limit_removes_nothing() {
        let store = make_store();
        store.ingest(&msg("c1", Role::User, "only")).unwrap();
        assert_eq!(store.prune("c1", Some(3)).unwrap(), 0);
        assert_eq!(store.prune("unknown", Some(3)).unwrap(), 0);
        assert_eq!(store.load(Some("c1")).unwrap().len(), 1);
    }

    #[test]
    fn prune_defaults_to_fifty() {
        let store = make_store();
        for i in 0..55 {
            store
                .ingest(&msg("c1", Role::User, &format!("m{i}")))
                .unwrap();
        }
        assert_eq!(store.prune("c1", None).unwrap(), 5);
        assert_eq!(store.load(Some("c1")).unwrap().len(), 50);
    }

    #[test]
    fn messages_are_scoped_to_their_engram() {
        let store = make_store();
        store.ingest(&msg("c1", Role::User, "one")).unwrap();
        store.ingest(&msg("c2", Role::User, "two")).unwrap();
        store.delete("c1").unwrap();
        assert_eq!(store.load(Some("c2")).unwrap().len(), 1);
    }
}
