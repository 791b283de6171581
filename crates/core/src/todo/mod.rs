//! Human decisions that block a flow until an operator resolves them.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteTodoStore;
pub use store::{NewTodo, TodoError, TodoFilter, TodoStore};
pub use types::{Todo, TodoAction, TodoStatus, TodoType};
