//! Human decision types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the operator is being asked to decide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TodoType {
    /// Confirm that the ticket may continue.
    Approve,
    /// Top up the resource pool, then re-apply.
    ResourceReplenish,
}

impl TodoType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoType::Approve => "approve",
            TodoType::ResourceReplenish => "resource_replenish",
        }
    }

    /// Whether `action` may resolve a todo of this type.
    pub fn accepts(&self, action: TodoAction) -> bool {
        matches!(
            (self, action),
            (_, TodoAction::Terminate)
                | (TodoType::Approve, TodoAction::Approve)
                | (TodoType::ResourceReplenish, TodoAction::ResourceReapply)
        )
    }
}

impl fmt::Display for TodoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TodoType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(TodoType::Approve),
            "resource_replenish" => Ok(TodoType::ResourceReplenish),
            other => Err(format!("unknown todo type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    /// Waiting for an operator.
    Todo,
    Done,
    Terminated,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Todo => "todo",
            TodoStatus::Done => "done",
            TodoStatus::Terminated => "terminated",
        }
    }

    pub fn is_open(&self) -> bool {
        *self == TodoStatus::Todo
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TodoStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(TodoStatus::Todo),
            "done" => Ok(TodoStatus::Done),
            "terminated" => Ok(TodoStatus::Terminated),
            other => Err(format!("unknown todo status: {}", other)),
        }
    }
}

/// Operator decision on a todo.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TodoAction {
    Approve,
    Terminate,
    ResourceReapply,
}

impl TodoAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoAction::Approve => "approve",
            TodoAction::Terminate => "terminate",
            TodoAction::ResourceReapply => "resource_reapply",
        }
    }

    /// Status the todo ends in after this action.
    pub fn resolved_status(&self) -> TodoStatus {
        match self {
            TodoAction::Terminate => TodoStatus::Terminated,
            TodoAction::Approve | TodoAction::ResourceReapply => TodoStatus::Done,
        }
    }
}

impl fmt::Display for TodoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TodoAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(TodoAction::Approve),
            "terminate" => Ok(TodoAction::Terminate),
            "resource_reapply" => Ok(TodoAction::ResourceReapply),
            other => Err(format!("unknown todo action: {}", other)),
        }
    }
}

/// A pending human decision blocking one flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Todo {
    pub id: String,
    pub ticket_id: String,
    pub flow_id: String,
    pub todo_type: TodoType,

    /// Usernames allowed to resolve this todo.
    pub operators: Vec<String>,

    pub status: TodoStatus,

    /// Resume coordinates and any details shown to the operator.
    #[serde(default)]
    pub context: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<TodoAction>,
    /// Parameters supplied with the resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Todo {
    pub fn is_operator(&self, username: &str) -> bool {
        self.operators.iter().any(|op| op == username)
    }
}
