//! SQLite-backed audit trail.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use super::{AuditError, AuditFilter, AuditRecord, AuditStore};
use crate::sqlite::{open, open_in_memory, parse_json, parse_timestamp, placeholders};

const AUDIT_COLUMNS: &str = "id, timestamp, event_type, ticket_id, flow_id, cluster_id, user_id, data";

fn db_err(e: impl std::fmt::Display) -> AuditError {
    AuditError::Database(e.to_string())
}

/// Fixed-width UTC timestamps, so text comparison orders them correctly.
fn stamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn new(path: &Path) -> Result<Self, AuditError> {
        let conn = open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                ticket_id TEXT,
                flow_id TEXT,
                cluster_id TEXT,
                user_id TEXT,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_events_timestamp ON audit_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_events_ticket ON audit_events(ticket_id);
            CREATE INDEX IF NOT EXISTS idx_audit_events_cluster ON audit_events(cluster_id);
            "#,
        )
        .map_err(db_err)
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<AuditRecord> {
        let timestamp: String = row.get(1)?;
        let data: String = row.get(7)?;

        Ok(AuditRecord {
            id: row.get(0)?,
            timestamp: parse_timestamp(&timestamp),
            event_type: row.get(2)?,
            ticket_id: row.get(3)?,
            flow_id: row.get(4)?,
            cluster_id: row.get(5)?,
            user_id: row.get(6)?,
            data: parse_json(7, &data)?,
        })
    }

    fn insert_on(conn: &Connection, record: &AuditRecord) -> Result<i64, AuditError> {
        let data = serde_json::to_string(&record.data)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO audit_events (timestamp, event_type, ticket_id, flow_id, cluster_id, user_id, data) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                stamp(&record.timestamp),
                record.event_type,
                record.ticket_id,
                record.flow_id,
                record.cluster_id,
                record.user_id,
                data,
            ],
        )
        .map_err(db_err)?;

        Ok(conn.last_insert_rowid())
    }

    fn where_clause(filter: &AuditFilter) -> (String, Vec<Value>) {
        let mut conditions = Vec::new();
        let mut values = Vec::new();

        let columns = [
            ("ticket_id", &filter.ticket_id),
            ("flow_id", &filter.flow_id),
            ("cluster_id", &filter.cluster_id),
            ("user_id", &filter.user_id),
        ];
        for (column, value) in columns {
            if let Some(value) = value {
                conditions.push(format!("{} = ?", column));
                values.push(Value::Text(value.clone()));
            }
        }

        if !filter.event_types.is_empty() {
            conditions.push(format!(
                "event_type IN ({})",
                placeholders(filter.event_types.len())
            ));
            values.extend(filter.event_types.iter().cloned().map(Value::Text));
        }

        if let Some(since) = &filter.since {
            conditions.push("timestamp >= ?".to_string());
            values.push(Value::Text(stamp(since)));
        }

        if let Some(until) = &filter.until {
            conditions.push("timestamp < ?".to_string());
            values.push(Value::Text(stamp(until)));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        (clause, values)
    }
}

impl AuditStore for SqliteAuditStore {
    fn insert(&self, record: &AuditRecord) -> Result<i64, AuditError> {
        let conn = self.conn.lock().unwrap();
        Self::insert_on(&conn, record)
    }

    fn insert_batch(&self, records: &[AuditRecord]) -> Result<usize, AuditError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;
        for record in records {
            Self::insert_on(&tx, record)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(records.len())
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.conn.lock().unwrap();

        let (clause, mut values) = Self::where_clause(filter);
        values.push(Value::Integer(filter.limit));
        values.push(Value::Integer(filter.offset));

        // Row ids follow emit order even when timestamps collide
        let order = if filter.newest_first { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {} FROM audit_events {} ORDER BY id {} LIMIT ? OFFSET ?",
            AUDIT_COLUMNS, clause, order
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let records = stmt
            .query_map(params_from_iter(values), Self::row_to_record)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }

    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError> {
        let conn = self.conn.lock().unwrap();

        let (clause, values) = Self::where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM audit_events {}", clause);
        conn.query_row(&sql, params_from_iter(values), |row| row.get(0))
            .map_err(db_err)
    }

    fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM audit_events WHERE timestamp < ?",
            params![stamp(&cutoff)],
        )
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use chrono::Duration;

    fn create_test_store() -> SqliteAuditStore {
        SqliteAuditStore::in_memory().unwrap()
    }

    fn todo_resolved(ticket_id: &str, user: &str) -> AuditRecord {
        AuditRecord::from_event(
            Utc::now(),
            AuditEvent::TodoResolved {
                ticket_id: ticket_id.to_string(),
                flow_id: format!("{}-pause", ticket_id),
                todo_id: format!("todo-{}", ticket_id),
                resolved_by: user.to_string(),
                action: "approve".to_string(),
            },
        )
    }

    fn mutex_conflict(ticket_id: &str, cluster_id: &str) -> AuditRecord {
        AuditRecord::from_event(
            Utc::now(),
            AuditEvent::MutexConflict {
                ticket_id: ticket_id.to_string(),
                node_id: "n-1".to_string(),
                cluster_id: cluster_id.to_string(),
                held_by: "t-0".to_string(),
                policy: "automatic".to_string(),
                attempt: 1,
            },
        )
    }

    fn service_started_at(timestamp: DateTime<Utc>) -> AuditRecord {
        AuditRecord::from_event(
            timestamp,
            AuditEvent::ServiceStarted {
                version: "0.1.0".to_string(),
                config_hash: "abc123".to_string(),
            },
        )
    }

    #[test]
    fn test_insert_and_query() {
        let store = create_test_store();
        let id = store.insert(&todo_resolved("t-1", "alice")).unwrap();
        assert!(id > 0);

        let results = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
        assert_eq!(results[0].flow_id.as_deref(), Some("t-1-pause"));
        assert!(matches!(
            results[0].data,
            AuditEvent::TodoResolved { ref resolved_by, .. } if resolved_by == "alice"
        ));
    }

    #[test]
    fn test_query_filters() {
        let store = create_test_store();
        store
            .insert_batch(&[
                service_started_at(Utc::now()),
                todo_resolved("t-1", "alice"),
                todo_resolved("t-2", "alice"),
                todo_resolved("t-3", "bob"),
                mutex_conflict("t-3", "cluster-a"),
            ])
            .unwrap();

        let by_ticket = store.query(&AuditFilter::new().with_ticket_id("t-3")).unwrap();
        assert_eq!(by_ticket.len(), 2);

        let by_user = store.query(&AuditFilter::new().with_user_id("alice")).unwrap();
        assert_eq!(by_user.len(), 2);

        let by_cluster = store
            .query(&AuditFilter::new().with_cluster_id("cluster-a"))
            .unwrap();
        assert_eq!(by_cluster.len(), 1);
        assert_eq!(by_cluster[0].event_type, "mutex_conflict");

        let by_flow = store.query(&AuditFilter::new().with_flow_id("t-2-pause")).unwrap();
        assert_eq!(by_flow.len(), 1);

        let any_of = AuditFilter::new()
            .with_event_type("mutex_conflict")
            .with_event_type("service_started");
        assert_eq!(store.count(&any_of).unwrap(), 2);
    }

    #[test]
    fn test_time_window() {
        let store = create_test_store();
        let now = Utc::now();
        store.insert(&service_started_at(now - Duration::hours(3))).unwrap();
        store.insert(&service_started_at(now - Duration::hours(2))).unwrap();
        store.insert(&service_started_at(now)).unwrap();

        let since = AuditFilter::new().with_since(now - Duration::hours(2));
        assert_eq!(store.count(&since).unwrap(), 2);

        let window = since.with_until(now - Duration::hours(1));
        assert_eq!(store.count(&window).unwrap(), 1);
    }

    #[test]
    fn test_ordering() {
        let store = create_test_store();
        store.insert(&todo_resolved("t-1", "alice")).unwrap();
        store.insert(&mutex_conflict("t-1", "cluster-a")).unwrap();

        let history = store.query(&AuditFilter::ticket_history("t-1")).unwrap();
        assert_eq!(history[0].event_type, "todo_resolved");
        assert_eq!(history[1].event_type, "mutex_conflict");

        let latest = store
            .query(&AuditFilter::new().newest_first().with_limit(1))
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].event_type, "mutex_conflict");
    }

    #[test]
    fn test_pagination_and_count() {
        let store = create_test_store();
        let records: Vec<_> = (0..5)
            .map(|i| todo_resolved(&format!("t-{}", i), "alice"))
            .collect();
        assert_eq!(store.insert_batch(&records).unwrap(), 5);

        let page = store
            .query(&AuditFilter::new().with_limit(2).with_offset(4))
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].ticket_id.as_deref(), Some("t-4"));
        assert_eq!(store.count(&AuditFilter::new().with_limit(1)).unwrap(), 5);
    }

    #[test]
    fn test_prune_before() {
        let store = create_test_store();
        let now = Utc::now();
        store.insert(&service_started_at(now - Duration::days(40))).unwrap();
        store.insert(&service_started_at(now - Duration::days(31))).unwrap();
        store.insert(&service_started_at(now)).unwrap();

        let removed = store.prune_before(now - Duration::days(30)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count(&AuditFilter::new()).unwrap(), 1);
    }

    #[test]
    fn test_file_based_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("dbflow.db");

        {
            let store = SqliteAuditStore::new(&db_path).unwrap();
            store.insert(&todo_resolved("t-1", "alice")).unwrap();
        }

        let reopened = SqliteAuditStore::new(&db_path).unwrap();
        assert_eq!(reopened.count(&AuditFilter::ticket_history("t-1")).unwrap(), 1);
    }
}
