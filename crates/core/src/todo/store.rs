//! Todo storage trait and errors.

use thiserror::Error;

use super::{Todo, TodoAction, TodoStatus, TodoType};

#[derive(Debug, Error)]
pub enum TodoError {
    #[error("todo not found: {0}")]
    NotFound(String),

    #[error("user {username} is not an operator of todo {todo_id}")]
    WrongOperator { todo_id: String, username: String },

    #[error("todo {todo_id} already resolved ({status})")]
    AlreadyResolved { todo_id: String, status: TodoStatus },

    #[error("action {action} cannot resolve a {todo_type} todo")]
    InvalidAction {
        action: TodoAction,
        todo_type: TodoType,
    },

    #[error("database error: {0}")]
    Database(String),
}

/// A todo to open.
#[derive(Debug, Clone)]
pub struct NewTodo {
    pub ticket_id: String,
    pub flow_id: String,
    pub todo_type: TodoType,
    pub operators: Vec<String>,
    pub context: serde_json::Value,
}

/// Filter for listing todos.
#[derive(Debug, Clone, Default)]
pub struct TodoFilter {
    pub ticket_id: Option<String>,
    pub status: Option<TodoStatus>,
    /// Only todos this user may resolve.
    pub operator: Option<String>,
    pub limit: i64,
}

impl TodoFilter {
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    pub fn with_ticket_id(mut self, ticket_id: impl Into<String>) -> Self {
        self.ticket_id = Some(ticket_id.into());
        self
    }

    pub fn with_status(mut self, status: TodoStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

/// Persistence for todos. Resolution is compare-and-set on the open status.
pub trait TodoStore: Send + Sync {
    fn create(&self, todo: NewTodo) -> Result<Todo, TodoError>;

    fn get(&self, id: &str) -> Result<Option<Todo>, TodoError>;

    /// Matching todos, oldest first.
    fn list(&self, filter: &TodoFilter) -> Result<Vec<Todo>, TodoError>;

    /// Close an open todo. Returns `Ok(None)` if it was no longer open.
    fn resolve(
        &self,
        id: &str,
        username: &str,
        action: TodoAction,
        params: Option<serde_json::Value>,
    ) -> Result<Option<Todo>, TodoError>;

    /// Terminate every open todo of a ticket; returns how many were closed.
    fn terminate_open(&self, ticket_id: &str) -> Result<usize, TodoError>;
}
