//! Ticket-scoped key/value context shared between flows and pipeline nodes.
//!
//! Writes are last-write-wins per key.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::PipelineError;
use crate::sqlite::{open, open_in_memory, parse_json};

fn db_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Database(e.to_string())
}

pub trait ContextStore: Send + Sync {
    fn get(&self, ticket_id: &str, key: &str) -> Result<Option<Value>, PipelineError>;

    /// Write one value; `written_by` names the node or flow for diagnosis.
    fn put(&self, ticket_id: &str, key: &str, value: &Value, written_by: &str)
        -> Result<(), PipelineError>;

    /// Every value of a ticket.
    fn all(&self, ticket_id: &str) -> Result<BTreeMap<String, Value>, PipelineError>;

    /// Look up several keys; absent keys are omitted.
    fn get_many(
        &self,
        ticket_id: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Value>, PipelineError> {
        let mut values = BTreeMap::new();
        for key in keys {
            if let Some(value) = self.get(ticket_id, key)? {
                values.insert(key.clone(), value);
            }
        }
        Ok(values)
    }
}

pub struct SqliteContextStore {
    conn: Mutex<Connection>,
}

impl SqliteContextStore {
    pub fn new(path: &Path) -> Result<Self, PipelineError> {
        let conn = open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, PipelineError> {
        let conn = open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), PipelineError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ticket_context (
                ticket_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                written_by TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (ticket_id, key)
            );
            "#,
        )
        .map_err(db_err)
    }
}

impl ContextStore for SqliteContextStore {
    fn get(&self, ticket_id: &str, key: &str) -> Result<Option<Value>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM ticket_context WHERE ticket_id = ? AND key = ?",
            params![ticket_id, key],
            |row| {
                let value: String = row.get(0)?;
                parse_json(0, &value)
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn put(
        &self,
        ticket_id: &str,
        key: &str,
        value: &Value,
        written_by: &str,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock().unwrap();
        let json = serde_json::to_string(value).map_err(db_err)?;
        conn.execute(
            "INSERT INTO ticket_context (ticket_id, key, value, written_by, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (ticket_id, key) DO UPDATE SET value = excluded.value, \
             written_by = excluded.written_by, updated_at = excluded.updated_at",
            params![ticket_id, key, json, written_by, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn all(&self, ticket_id: &str) -> Result<BTreeMap<String, Value>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, value FROM ticket_context WHERE ticket_id = ?")
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![ticket_id], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((key, parse_json(1, &value)?))
            })
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_write_wins() {
        let store = SqliteContextStore::in_memory().unwrap();
        store.put("t-1", "hosts", &json!(["10.0.0.1"]), "allocate").unwrap();
        store
            .put("t-1", "hosts", &json!(["10.0.0.2", "10.0.0.3"]), "reallocate")
            .unwrap();

        assert_eq!(
            store.get("t-1", "hosts").unwrap(),
            Some(json!(["10.0.0.2", "10.0.0.3"]))
        );
    }

    #[test]
    fn test_scoped_per_ticket() {
        let store = SqliteContextStore::in_memory().unwrap();
        store.put("t-1", "hosts", &json!(["a"]), "n").unwrap();

        assert!(store.get("t-2", "hosts").unwrap().is_none());
        assert!(store.all("t-2").unwrap().is_empty());
        assert_eq!(store.all("t-1").unwrap().len(), 1);
    }

    #[test]
    fn test_get_many_skips_absent() {
        let store = SqliteContextStore::in_memory().unwrap();
        store.put("t-1", "a", &json!(1), "n").unwrap();

        let values = store
            .get_many("t-1", &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["a"], json!(1));
    }
}
