//! Persistence for pipeline runs and their nodes.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use super::{NodeStatus, Outputs, PipelineError, PipelineNode, PipelineRun};
use crate::sqlite::{
    open, open_in_memory, parse_enum, parse_json, parse_optional_timestamp, parse_timestamp,
    placeholders,
};

/// Field changes applied by a node update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub status: Option<NodeStatus>,
    pub version: Option<u32>,
    pub paused: Option<bool>,
    pub waiting_mutex: Option<bool>,
    pub mutex_retries: Option<u32>,
    pub poll_state: Option<Option<Value>>,
    pub outputs: Option<Outputs>,
    pub error: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

impl NodeUpdate {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Guard for a compare-and-set node update.
#[derive(Debug, Clone)]
pub struct NodeExpect {
    pub statuses: Vec<NodeStatus>,
    pub version: Option<u32>,
}

impl NodeExpect {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            statuses: vec![status],
            version: None,
        }
    }

    pub fn any() -> Self {
        Self {
            statuses: NodeStatus::ALL.to_vec(),
            version: None,
        }
    }

    pub fn at_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }
}

pub trait NodeStore: Send + Sync {
    /// Persist a run and all of its nodes atomically.
    fn create_run(&self, run: &PipelineRun, nodes: &[PipelineNode]) -> Result<(), PipelineError>;

    fn get_run(&self, id: &str) -> Result<Option<PipelineRun>, PipelineError>;

    /// Runs that have not been cancelled.
    fn active_runs(&self) -> Result<Vec<PipelineRun>, PipelineError>;

    /// Mark a run cancelled. Returns false if it already was.
    fn cancel_run(&self, id: &str) -> Result<bool, PipelineError>;

    fn get_node(&self, id: &str) -> Result<Option<PipelineNode>, PipelineError>;

    fn list_nodes(&self, pipeline_id: &str) -> Result<Vec<PipelineNode>, PipelineError>;

    /// Leaf nodes in `status` across all pipelines.
    fn leaves_with_status(&self, status: NodeStatus) -> Result<Vec<PipelineNode>, PipelineError>;

    /// Apply `update` if the node matches `expect`. `Ok(None)` when the guard fails.
    fn update_node(
        &self,
        id: &str,
        expect: &NodeExpect,
        update: NodeUpdate,
    ) -> Result<Option<PipelineNode>, PipelineError>;
}

fn db_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Database(e.to_string())
}

const NODE_COLUMNS: &str = "id, pipeline_id, parent_id, position, name, kind, activity, params, reads, writes, parallel_mode, status, version, paused, waiting_mutex, mutex_retries, poll_state, outputs, error, started_at, finished_at, updated_at";

const RUN_COLUMNS: &str =
    "id, ticket_id, flow_id, name, root_node_id, retry_policy, cancelled, created_at";

pub struct SqliteNodeStore {
    conn: Mutex<Connection>,
}

impl SqliteNodeStore {
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
            CREATE TABLE IF NOT EXISTS pipelines (
                id TEXT PRIMARY KEY,
                ticket_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                name TEXT NOT NULL,
                root_node_id TEXT NOT NULL,
                retry_policy TEXT NOT NULL,
                cancelled INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pipelines_ticket ON pipelines(ticket_id);

            CREATE TABLE IF NOT EXISTS pipeline_nodes (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL REFERENCES pipelines(id),
                parent_id TEXT,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                activity TEXT,
                params TEXT NOT NULL,
                reads TEXT NOT NULL,
                writes TEXT NOT NULL,
                parallel_mode TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0,
                paused INTEGER NOT NULL DEFAULT 0,
                waiting_mutex INTEGER NOT NULL DEFAULT 0,
                mutex_retries INTEGER NOT NULL DEFAULT 0,
                poll_state TEXT,
                outputs TEXT NOT NULL,
                error TEXT,
                started_at TEXT,
                finished_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_pipeline_nodes_pipeline ON pipeline_nodes(pipeline_id);
            CREATE INDEX IF NOT EXISTS idx_pipeline_nodes_status ON pipeline_nodes(status);
            "#,
        )
        .map_err(db_err)
    }

    fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<PipelineRun> {
        let retry_policy: String = row.get(5)?;
        let created_at: String = row.get(7)?;
        Ok(PipelineRun {
            id: row.get(0)?,
            ticket_id: row.get(1)?,
            flow_id: row.get(2)?,
            name: row.get(3)?,
            root_node_id: row.get(4)?,
            retry_policy: parse_enum(5, &retry_policy)?,
            cancelled: row.get(6)?,
            created_at: parse_timestamp(&created_at),
        })
    }

    fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<PipelineNode> {
        let kind: String = row.get(5)?;
        let params: String = row.get(7)?;
        let reads: String = row.get(8)?;
        let writes: String = row.get(9)?;
        let parallel_mode: String = row.get(10)?;
        let status: String = row.get(11)?;
        let poll_state: Option<String> = row.get(16)?;
        let outputs: String = row.get(17)?;
        let updated_at: String = row.get(21)?;

        Ok(PipelineNode {
            id: row.get(0)?,
            pipeline_id: row.get(1)?,
            parent_id: row.get(2)?,
            position: row.get(3)?,
            name: row.get(4)?,
            kind: parse_enum(5, &kind)?,
            activity: row.get(6)?,
            params: parse_json(7, &params)?,
            reads: parse_json(8, &reads)?,
            writes: parse_json(9, &writes)?,
            parallel_mode: parse_enum(10, &parallel_mode)?,
            status: parse_enum(11, &status)?,
            version: row.get(12)?,
            paused: row.get(13)?,
            waiting_mutex: row.get(14)?,
            mutex_retries: row.get(15)?,
            poll_state: poll_state.map(|p| parse_json(16, &p)).transpose()?,
            outputs: parse_json(17, &outputs)?,
            error: row.get(18)?,
            started_at: parse_optional_timestamp(row.get(19)?),
            finished_at: parse_optional_timestamp(row.get(20)?),
            updated_at: parse_timestamp(&updated_at),
        })
    }

    fn fetch_node(conn: &Connection, id: &str) -> Result<Option<PipelineNode>, PipelineError> {
        conn.query_row(
            &format!("SELECT {} FROM pipeline_nodes WHERE id = ?", NODE_COLUMNS),
            params![id],
            Self::row_to_node,
        )
        .optional()
        .map_err(db_err)
    }

    fn insert_node(tx: &rusqlite::Transaction, node: &PipelineNode) -> Result<(), PipelineError> {
        tx.execute(
            &format!(
                "INSERT INTO pipeline_nodes ({}) VALUES ({})",
                NODE_COLUMNS,
                placeholders(22)
            ),
            params![
                node.id,
                node.pipeline_id,
                node.parent_id,
                node.position,
                node.name,
                node.kind.as_str(),
                node.activity,
                to_json(&node.params)?,
                to_json(&node.reads)?,
                to_json(&node.writes)?,
                node.parallel_mode.as_str(),
                node.status.as_str(),
                node.version,
                node.paused,
                node.waiting_mutex,
                node.mutex_retries,
                node.poll_state.as_ref().map(to_json).transpose()?,
                to_json(&node.outputs)?,
                node.error,
                node.started_at.map(|t| t.to_rfc3339()),
                node.finished_at.map(|t| t.to_rfc3339()),
                node.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string(value).map_err(db_err)
}

impl NodeStore for SqliteNodeStore {
    fn create_run(&self, run: &PipelineRun, nodes: &[PipelineNode]) -> Result<(), PipelineError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute(
            &format!("INSERT INTO pipelines ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)", RUN_COLUMNS),
            params![
                run.id,
                run.ticket_id,
                run.flow_id,
                run.name,
                run.root_node_id,
                run.retry_policy.as_str(),
                run.cancelled,
                run.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        for node in nodes {
            Self::insert_node(&tx, node)?;
        }

        tx.commit().map_err(db_err)
    }

    fn get_run(&self, id: &str) -> Result<Option<PipelineRun>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM pipelines WHERE id = ?", RUN_COLUMNS),
            params![id],
            Self::row_to_run,
        )
        .optional()
        .map_err(db_err)
    }

    fn active_runs(&self) -> Result<Vec<PipelineRun>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM pipelines WHERE cancelled = 0 ORDER BY created_at ASC",
                RUN_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], Self::row_to_run).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn cancel_run(&self, id: &str) -> Result<bool, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE pipelines SET cancelled = 1 WHERE id = ? AND cancelled = 0",
                params![id],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    fn get_node(&self, id: &str) -> Result<Option<PipelineNode>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch_node(&conn, id)
    }

    fn list_nodes(&self, pipeline_id: &str) -> Result<Vec<PipelineNode>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM pipeline_nodes WHERE pipeline_id = ? ORDER BY rowid ASC",
                NODE_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![pipeline_id], Self::row_to_node)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn leaves_with_status(&self, status: NodeStatus) -> Result<Vec<PipelineNode>, PipelineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM pipeline_nodes WHERE status = ? AND kind = 'activity' ORDER BY rowid ASC",
                NODE_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.as_str()], Self::row_to_node)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn update_node(
        &self,
        id: &str,
        expect: &NodeExpect,
        update: NodeUpdate,
    ) -> Result<Option<PipelineNode>, PipelineError> {
        let conn = self.conn.lock().unwrap();

        let mut sets: Vec<&str> = vec!["updated_at = ?"];
        let mut values: Vec<rusqlite::types::Value> =
            vec![Utc::now().to_rfc3339().into()];

        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(status.as_str().to_string().into());
        }
        if let Some(version) = update.version {
            sets.push("version = ?");
            values.push(i64::from(version).into());
        }
        if let Some(paused) = update.paused {
            sets.push("paused = ?");
            values.push(paused.into());
        }
        if let Some(waiting) = update.waiting_mutex {
            sets.push("waiting_mutex = ?");
            values.push(waiting.into());
        }
        if let Some(retries) = update.mutex_retries {
            sets.push("mutex_retries = ?");
            values.push(i64::from(retries).into());
        }
        if let Some(poll_state) = update.poll_state {
            sets.push("poll_state = ?");
            values.push(poll_state.as_ref().map(to_json).transpose()?.into());
        }
        if let Some(outputs) = update.outputs {
            sets.push("outputs = ?");
            values.push(to_json(&outputs)?.into());
        }
        if let Some(error) = update.error {
            sets.push("error = ?");
            values.push(error.into());
        }
        if let Some(started_at) = update.started_at {
            sets.push("started_at = ?");
            values.push(started_at.map(|t| t.to_rfc3339()).into());
        }
        if let Some(finished_at) = update.finished_at {
            sets.push("finished_at = ?");
            values.push(finished_at.map(|t| t.to_rfc3339()).into());
        }

        let mut sql = format!(
            "UPDATE pipeline_nodes SET {} WHERE id = ? AND status IN ({})",
            sets.join(", "),
            placeholders(expect.statuses.len())
        );
        values.push(id.to_string().into());
        values.extend(
            expect
                .statuses
                .iter()
                .map(|s| rusqlite::types::Value::from(s.as_str().to_string())),
        );
        if let Some(version) = expect.version {
            sql.push_str(" AND version = ?");
            values.push(i64::from(version).into());
        }

        let changed = conn
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(db_err)?;

        match Self::fetch_node(&conn, id)? {
            Some(node) if changed > 0 => Ok(Some(node)),
            Some(_) => Ok(None),
            None => Err(PipelineError::NodeNotFound(id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{flatten, ActivityStep, PipelineBuilder, TicketContext};
    use crate::ticket::RetryPolicy;
    use serde_json::json;

    fn seed(store: &SqliteNodeStore) -> (PipelineRun, Vec<PipelineNode>) {
        let pipeline = PipelineBuilder::new(TicketContext::new("t-1", json!({})))
            .add_step(
                ActivityStep::new("install", "remote_job", json!({"cluster_id": "c-1"}))
                    .writes(["installed"]),
            )
            .add_parallel_activities(vec![
                ActivityStep::new("a", "noop", json!({})),
                ActivityStep::new("b", "noop", json!({})).paused(),
            ])
            .build()
            .unwrap();

        let nodes = flatten("p-1", &pipeline.root);
        let run = PipelineRun {
            id: "p-1".to_string(),
            ticket_id: "t-1".to_string(),
            flow_id: "f-1".to_string(),
            name: pipeline.name.clone(),
            root_node_id: nodes[0].id.clone(),
            retry_policy: RetryPolicy::Automatic,
            cancelled: false,
            created_at: Utc::now(),
        };
        store.create_run(&run, &nodes).unwrap();
        (run, nodes)
    }

    #[test]
    fn test_create_and_load_run() {
        let store = SqliteNodeStore::in_memory().unwrap();
        let (run, nodes) = seed(&store);

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded, run);

        let loaded_nodes = store.list_nodes(&run.id).unwrap();
        assert_eq!(loaded_nodes.len(), nodes.len());
        assert_eq!(loaded_nodes[0].id, nodes[0].id);
        let install = loaded_nodes.iter().find(|n| n.name == "install").unwrap();
        assert_eq!(install.params["cluster_id"], "c-1");
        assert_eq!(install.writes, vec!["installed".to_string()]);
        assert!(loaded_nodes.iter().find(|n| n.name == "b").unwrap().paused);
    }

    #[test]
    fn test_update_node_compare_and_set() {
        let store = SqliteNodeStore::in_memory().unwrap();
        let (_, nodes) = seed(&store);
        let install = nodes.iter().find(|n| n.name == "install").unwrap();

        let running = store
            .update_node(
                &install.id,
                &NodeExpect::status(NodeStatus::Ready).at_version(0),
                NodeUpdate {
                    status: Some(NodeStatus::Running),
                    started_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(running.status, NodeStatus::Running);
        assert!(running.started_at.is_some());

        // Stale version loses
        let stale = store
            .update_node(
                &install.id,
                &NodeExpect::status(NodeStatus::Running).at_version(3),
                NodeUpdate::status(NodeStatus::Succeeded),
            )
            .unwrap();
        assert!(stale.is_none());

        let mut outputs = Outputs::new();
        outputs.insert("installed".to_string(), json!(true));
        let done = store
            .update_node(
                &install.id,
                &NodeExpect::status(NodeStatus::Running).at_version(0),
                NodeUpdate {
                    status: Some(NodeStatus::Succeeded),
                    outputs: Some(outputs),
                    poll_state: Some(None),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(done.outputs["installed"], json!(true));
        assert!(done.poll_state.is_none());
    }

    #[test]
    fn test_update_missing_node() {
        let store = SqliteNodeStore::in_memory().unwrap();
        let result = store.update_node("nope", &NodeExpect::any(), NodeUpdate::default());
        assert!(matches!(result, Err(PipelineError::NodeNotFound(_))));
    }

    #[test]
    fn test_leaves_with_status_and_cancel() {
        let store = SqliteNodeStore::in_memory().unwrap();
        let (run, _) = seed(&store);

        assert_eq!(store.leaves_with_status(NodeStatus::Ready).unwrap().len(), 3);
        assert_eq!(store.active_runs().unwrap().len(), 1);

        assert!(store.cancel_run(&run.id).unwrap());
        assert!(!store.cancel_run(&run.id).unwrap());
        assert!(store.active_runs().unwrap().is_empty());
        assert!(store.get_run(&run.id).unwrap().unwrap().cancelled);
    }
}
