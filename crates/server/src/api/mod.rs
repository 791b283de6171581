pub mod audit;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod tickets;
pub mod todos;

pub use routes::create_router;
