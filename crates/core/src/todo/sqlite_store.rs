//! SQLite-backed todo store.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::{NewTodo, Todo, TodoAction, TodoError, TodoFilter, TodoStatus, TodoStore};
use crate::sqlite::{
    open, open_in_memory, parse_enum, parse_json, parse_optional_timestamp, parse_timestamp,
};

const TODO_COLUMNS: &str = "id, ticket_id, flow_id, todo_type, operators, status, context, resolved_by, action, params, created_at, resolved_at";

fn db_err(e: impl std::fmt::Display) -> TodoError {
    TodoError::Database(e.to_string())
}

pub struct SqliteTodoStore {
    conn: Mutex<Connection>,
}

impl SqliteTodoStore {
    pub fn new(path: &Path) -> Result<Self, TodoError> {
        let conn = open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, TodoError> {
        let conn = open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), TodoError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS todos (
                id TEXT PRIMARY KEY,
                ticket_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                todo_type TEXT NOT NULL,
                operators TEXT NOT NULL,
                status TEXT NOT NULL,
                context TEXT NOT NULL,
                resolved_by TEXT,
                action TEXT,
                params TEXT,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_todos_ticket ON todos(ticket_id);
            CREATE INDEX IF NOT EXISTS idx_todos_status ON todos(status);
            "#,
        )
        .map_err(db_err)
    }

    fn row_to_todo(row: &rusqlite::Row) -> rusqlite::Result<Todo> {
        let todo_type: String = row.get(3)?;
        let operators: String = row.get(4)?;
        let status: String = row.get(5)?;
        let context: String = row.get(6)?;
        let action: Option<String> = row.get(8)?;
        let params: Option<String> = row.get(9)?;
        let created_at: String = row.get(10)?;

        Ok(Todo {
            id: row.get(0)?,
            ticket_id: row.get(1)?,
            flow_id: row.get(2)?,
            todo_type: parse_enum(3, &todo_type)?,
            operators: parse_json(4, &operators)?,
            status: parse_enum(5, &status)?,
            context: parse_json(6, &context)?,
            resolved_by: row.get(7)?,
            action: action.map(|a| parse_enum(8, &a)).transpose()?,
            params: params.map(|p| parse_json(9, &p)).transpose()?,
            created_at: parse_timestamp(&created_at),
            resolved_at: parse_optional_timestamp(row.get(11)?),
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Todo>, TodoError> {
        conn.query_row(
            &format!("SELECT {} FROM todos WHERE id = ?", TODO_COLUMNS),
            params![id],
            Self::row_to_todo,
        )
        .optional()
        .map_err(db_err)
    }
}

impl TodoStore for SqliteTodoStore {
    fn create(&self, todo: NewTodo) -> Result<Todo, TodoError> {
        let conn = self.conn.lock().unwrap();

        let created = Todo {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id: todo.ticket_id,
            flow_id: todo.flow_id,
            todo_type: todo.todo_type,
            operators: todo.operators,
            status: TodoStatus::Todo,
            context: todo.context,
            resolved_by: None,
            action: None,
            params: None,
            created_at: Utc::now(),
            resolved_at: None,
        };

        conn.execute(
            &format!(
                "INSERT INTO todos ({}) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?, NULL)",
                TODO_COLUMNS
            ),
            params![
                created.id,
                created.ticket_id,
                created.flow_id,
                created.todo_type.as_str(),
                serde_json::to_string(&created.operators).map_err(db_err)?,
                created.status.as_str(),
                serde_json::to_string(&created.context).map_err(db_err)?,
                created.created_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        Ok(created)
    }

    fn get(&self, id: &str) -> Result<Option<Todo>, TodoError> {
        let conn = self.conn.lock().unwrap();
        Self::fetch(&conn, id)
    }

    fn list(&self, filter: &TodoFilter) -> Result<Vec<Todo>, TodoError> {
        let conn = self.conn.lock().unwrap();

        let mut conditions = Vec::new();
        let mut values = Vec::new();

        if let Some(ref ticket_id) = filter.ticket_id {
            conditions.push("ticket_id = ?");
            values.push(ticket_id.clone());
        }
        if let Some(status) = filter.status {
            conditions.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(ref operator) = filter.operator {
            conditions.push("EXISTS (SELECT 1 FROM json_each(todos.operators) WHERE value = ?)");
            values.push(operator.clone());
        }
        values.push(filter.limit.to_string());

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT {} FROM todos {} ORDER BY created_at ASC LIMIT CAST(? AS INTEGER)",
            TODO_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_todo)
            .map_err(db_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn resolve(
        &self,
        id: &str,
        username: &str,
        action: TodoAction,
        params: Option<serde_json::Value>,
    ) -> Result<Option<Todo>, TodoError> {
        let conn = self.conn.lock().unwrap();

        let params_json = params
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(db_err)?;

        let changed = conn
            .execute(
                "UPDATE todos SET status = ?, resolved_by = ?, action = ?, params = ?, resolved_at = ? \
                 WHERE id = ? AND status = ?",
                params![
                    action.resolved_status().as_str(),
                    username,
                    action.as_str(),
                    params_json,
                    Utc::now().to_rfc3339(),
                    id,
                    TodoStatus::Todo.as_str(),
                ],
            )
            .map_err(db_err)?;

        match Self::fetch(&conn, id)? {
            Some(todo) if changed > 0 => Ok(Some(todo)),
            Some(_) => Ok(None),
            None => Err(TodoError::NotFound(id.to_string())),
        }
    }

    fn terminate_open(&self, ticket_id: &str) -> Result<usize, TodoError> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE todos SET status = ?, resolved_at = ? WHERE ticket_id = ? AND status = ?",
            params![
                TodoStatus::Terminated.as_str(),
                Utc::now().to_rfc3339(),
                ticket_id,
                TodoStatus::Todo.as_str(),
            ],
        )
        .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::todo::TodoType;

    fn new_todo(ticket_id: &str, operators: &[&str]) -> NewTodo {
        NewTodo {
            ticket_id: ticket_id.to_string(),
            flow_id: format!("{}-flow", ticket_id),
            todo_type: TodoType::Approve,
            operators: operators.iter().map(|s| s.to_string()).collect(),
            context: serde_json::json!({"flow_index": 1}),
        }
    }

    #[test]
    fn test_create_and_get() {
        let store = SqliteTodoStore::in_memory().unwrap();
        let todo = store.create(new_todo("t-1", &["alice"])).unwrap();

        let fetched = store.get(&todo.id).unwrap().unwrap();
        assert_eq!(fetched.status, TodoStatus::Todo);
        assert_eq!(fetched.operators, vec!["alice".to_string()]);
        assert_eq!(fetched.context["flow_index"], 1);
        assert!(fetched.resolved_by.is_none());
    }

    #[test]
    fn test_resolve_only_once() {
        let store = SqliteTodoStore::in_memory().unwrap();
        let todo = store.create(new_todo("t-1", &["alice"])).unwrap();

        let resolved = store
            .resolve(&todo.id, "alice", TodoAction::Approve, None)
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, TodoStatus::Done);
        assert_eq!(resolved.resolved_by.as_deref(), Some("alice"));
        assert_eq!(resolved.action, Some(TodoAction::Approve));
        assert!(resolved.resolved_at.is_some());

        let again = store
            .resolve(&todo.id, "alice", TodoAction::Terminate, None)
            .unwrap();
        assert!(again.is_none());
        assert_eq!(
            store.get(&todo.id).unwrap().unwrap().status,
            TodoStatus::Done
        );
    }

    #[test]
    fn test_resolve_missing() {
        let store = SqliteTodoStore::in_memory().unwrap();
        let result = store.resolve("nope", "alice", TodoAction::Approve, None);
        assert!(matches!(result, Err(TodoError::NotFound(_))));
    }

    #[test]
    fn test_list_by_operator_and_status() {
        let store = SqliteTodoStore::in_memory().unwrap();
        store.create(new_todo("t-1", &["alice", "bob"])).unwrap();
        store.create(new_todo("t-2", &["bob"])).unwrap();
        let done = store.create(new_todo("t-3", &["alice"])).unwrap();
        store
            .resolve(&done.id, "alice", TodoAction::Approve, None)
            .unwrap();

        let alice_open = store
            .list(
                &TodoFilter::new()
                    .with_operator("alice")
                    .with_status(TodoStatus::Todo),
            )
            .unwrap();
        assert_eq!(alice_open.len(), 1);
        assert_eq!(alice_open[0].ticket_id, "t-1");

        let bob = store.list(&TodoFilter::new().with_operator("bob")).unwrap();
        assert_eq!(bob.len(), 2);
    }

    #[test]
    fn test_terminate_open() {
        let store = SqliteTodoStore::in_memory().unwrap();
        store.create(new_todo("t-1", &["alice"])).unwrap();
        store.create(new_todo("t-1", &["alice"])).unwrap();
        store.create(new_todo("t-2", &["alice"])).unwrap();

        assert_eq!(store.terminate_open("t-1").unwrap(), 2);
        let remaining = store
            .list(&TodoFilter::new().with_status(TodoStatus::Todo))
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ticket_id, "t-2");
    }
}
