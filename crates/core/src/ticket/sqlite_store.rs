//! SQLite-backed ticket store implementation.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{
    CreateTicketRequest, Flow, FlowPatch, FlowType, Ticket, TicketError, TicketFilter,
    TicketStatus, TicketStore,
};
use crate::sqlite::{open, open_in_memory, parse_enum, parse_json, parse_timestamp, placeholders};

const TICKET_COLUMNS: &str =
    "id, ticket_type, tenant_id, created_by, status, retry_policy, details, created_at, updated_at";

const FLOW_COLUMNS: &str = "id, ticket_id, flow_index, flow_type, alias, status, flow_obj_id, details, message, retry_count, created_at, updated_at";

fn db_err(e: impl std::fmt::Display) -> TicketError {
    TicketError::Database(e.to_string())
}

/// SQLite-backed ticket store.
pub struct SqliteTicketStore {
    conn: Mutex<Connection>,
}

impl SqliteTicketStore {
    /// Create a new SQLite ticket store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, TicketError> {
        let conn = open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite ticket store (useful for testing).
    pub fn in_memory() -> Result<Self, TicketError> {
        let conn = open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), TicketError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tickets (
                id TEXT PRIMARY KEY,
                ticket_type TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                created_by TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_policy TEXT NOT NULL DEFAULT 'manual',
                details TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
            CREATE INDEX IF NOT EXISTS idx_tickets_tenant ON tickets(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_tickets_created_at ON tickets(created_at);

            CREATE TABLE IF NOT EXISTS flows (
                id TEXT PRIMARY KEY,
                ticket_id TEXT NOT NULL REFERENCES tickets(id),
                flow_index INTEGER NOT NULL,
                flow_type TEXT NOT NULL,
                alias TEXT NOT NULL,
                status TEXT NOT NULL,
                flow_obj_id TEXT,
                details TEXT NOT NULL,
                message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (ticket_id, flow_index)
            );

            CREATE INDEX IF NOT EXISTS idx_flows_type_status ON flows(flow_type, status);
            "#,
        )
        .map_err(db_err)
    }

    fn build_where_clause(filter: &TicketFilter) -> (String, Vec<String>) {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(status.as_str().to_string());
        }

        if let Some(ref ticket_type) = filter.ticket_type {
            conditions.push("ticket_type = ?");
            params.push(ticket_type.clone());
        }

        if let Some(ref tenant_id) = filter.tenant_id {
            conditions.push("tenant_id = ?");
            params.push(tenant_id.clone());
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_ticket(row: &rusqlite::Row) -> rusqlite::Result<Ticket> {
        let status: String = row.get(4)?;
        let retry_policy: String = row.get(5)?;
        let details: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        let updated_at: String = row.get(8)?;

        Ok(Ticket {
            id: row.get(0)?,
            ticket_type: row.get(1)?,
            tenant_id: row.get(2)?,
            created_by: row.get(3)?,
            status: parse_enum(4, &status)?,
            retry_policy: parse_enum(5, &retry_policy)?,
            details: parse_json(6, &details)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn row_to_flow(row: &rusqlite::Row) -> rusqlite::Result<Flow> {
        let flow_type: String = row.get(3)?;
        let status: String = row.get(5)?;
        let details: String = row.get(7)?;
        let created_at: String = row.get(10)?;
        let updated_at: String = row.get(11)?;

        Ok(Flow {
            id: row.get(0)?,
            ticket_id: row.get(1)?,
            flow_index: row.get(2)?,
            flow_type: parse_enum(3, &flow_type)?,
            alias: row.get(4)?,
            status: parse_enum(5, &status)?,
            flow_obj_id: row.get(6)?,
            details: parse_json(7, &details)?,
            message: row.get(8)?,
            retry_count: row.get(9)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn fetch_ticket(conn: &Connection, id: &str) -> Result<Option<Ticket>, TicketError> {
        conn.query_row(
            &format!("SELECT {} FROM tickets WHERE id = ?", TICKET_COLUMNS),
            params![id],
            Self::row_to_ticket,
        )
        .optional()
        .map_err(db_err)
    }

    fn fetch_flow(conn: &Connection, id: &str) -> Result<Option<Flow>, TicketError> {
        conn.query_row(
            &format!("SELECT {} FROM flows WHERE id = ?", FLOW_COLUMNS),
            params![id],
            Self::row_to_flow,
        )
        .optional()
        .map_err(db_err)
    }
}

impl TicketStore for SqliteTicketStore {
    fn create(&self, request: CreateTicketRequest) -> Result<Ticket, TicketError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let details_json = serde_json::to_string(&request.details).map_err(db_err)?;

        tx.execute(
            &format!(
                "INSERT INTO tickets ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                TICKET_COLUMNS
            ),
            params![
                id,
                request.ticket_type,
                request.tenant_id,
                request.created_by,
                TicketStatus::Pending.as_str(),
                request.retry_policy.as_str(),
                details_json,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        for (index, flow) in request.flows.iter().enumerate() {
            let flow_details = serde_json::to_string(&flow.details).map_err(db_err)?;
            tx.execute(
                &format!(
                    "INSERT INTO flows ({}) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, NULL, 0, ?, ?)",
                    FLOW_COLUMNS
                ),
                params![
                    uuid::Uuid::new_v4().to_string(),
                    id,
                    index as u32,
                    flow.flow_type.as_str(),
                    flow.alias,
                    TicketStatus::Pending.as_str(),
                    flow_details,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;

        Ok(Ticket {
            id,
            ticket_type: request.ticket_type,
            tenant_id: request.tenant_id,
            created_by: request.created_by,
            status: TicketStatus::Pending,
            retry_policy: request.retry_policy,
            details: request.details,
            created_at: now,
            updated_at: now,
        })
    }

    fn get(&self, id: &str) -> Result<Option<Ticket>, TicketError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch_ticket(&conn, id)
    }

    fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, TicketError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, mut params) = Self::build_where_clause(filter);
        params.push(filter.limit.to_string());
        params.push(filter.offset.to_string());

        let sql = format!(
            "SELECT {} FROM tickets {} ORDER BY created_at DESC, id ASC LIMIT CAST(? AS INTEGER) OFFSET CAST(? AS INTEGER)",
            TICKET_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), Self::row_to_ticket)
            .map_err(db_err)?;

        let mut tickets = Vec::new();
        for row_result in rows {
            tickets.push(row_result.map_err(db_err)?);
        }

        Ok(tickets)
    }

    fn count(&self, filter: &TicketFilter) -> Result<i64, TicketError> {
        let conn = self.conn.lock().unwrap();

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM tickets {}", where_clause);

        conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
            .map_err(db_err)
    }

    fn transition(
        &self,
        id: &str,
        from: &[TicketStatus],
        to: TicketStatus,
    ) -> Result<Option<Ticket>, TicketError> {
        let conn = self.conn.lock().unwrap();

        let now = Utc::now().to_rfc3339();
        let sql = format!(
            "UPDATE tickets SET status = ?, updated_at = ? WHERE id = ? AND status IN ({})",
            placeholders(from.len())
        );

        let mut values = vec![to.as_str().to_string(), now, id.to_string()];
        values.extend(from.iter().map(|s| s.as_str().to_string()));

        let changed = conn
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(db_err)?;

        match Self::fetch_ticket(&conn, id)? {
            Some(ticket) if changed > 0 => Ok(Some(ticket)),
            Some(_) => Ok(None),
            None => Err(TicketError::NotFound(id.to_string())),
        }
    }

    fn list_flows(&self, ticket_id: &str) -> Result<Vec<Flow>, TicketError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM flows WHERE ticket_id = ? ORDER BY flow_index ASC",
                FLOW_COLUMNS
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![ticket_id], Self::row_to_flow)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn get_flow(&self, flow_id: &str) -> Result<Option<Flow>, TicketError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch_flow(&conn, flow_id)
    }

    fn transition_flow(
        &self,
        flow_id: &str,
        from: &[TicketStatus],
        to: TicketStatus,
        patch: FlowPatch,
    ) -> Result<Option<Flow>, TicketError> {
        let conn = self.conn.lock().unwrap();

        let mut sets = vec!["status = ?", "updated_at = ?"];
        let mut values: Vec<Option<String>> =
            vec![Some(to.as_str().to_string()), Some(Utc::now().to_rfc3339())];

        if let Some(obj_id) = patch.flow_obj_id {
            sets.push("flow_obj_id = ?");
            values.push(obj_id);
        }
        if let Some(message) = patch.message {
            sets.push("message = ?");
            values.push(message);
        }
        if let Some(retry_count) = patch.retry_count {
            sets.push("retry_count = CAST(? AS INTEGER)");
            values.push(Some(retry_count.to_string()));
        }
        if let Some(details) = patch.details {
            sets.push("details = ?");
            values.push(Some(serde_json::to_string(&details).map_err(db_err)?));
        }

        let sql = format!(
            "UPDATE flows SET {} WHERE id = ? AND status IN ({})",
            sets.join(", "),
            placeholders(from.len())
        );
        values.push(Some(flow_id.to_string()));
        values.extend(from.iter().map(|s| Some(s.as_str().to_string())));

        let changed = conn
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(db_err)?;

        match Self::fetch_flow(&conn, flow_id)? {
            Some(flow) if changed > 0 => Ok(Some(flow)),
            Some(_) => Ok(None),
            None => Err(TicketError::NotFound(flow_id.to_string())),
        }
    }

    fn find_flows(
        &self,
        flow_type: FlowType,
        status: TicketStatus,
    ) -> Result<Vec<Flow>, TicketError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM flows WHERE flow_type = ? AND status = ? ORDER BY created_at ASC",
                FLOW_COLUMNS
            ))
            .map_err(db_err)?;

        let rows = stmt
            .query_map(
                params![flow_type.as_str(), status.as_str()],
                Self::row_to_flow,
            )
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }
}
