//! HTTP surface of the dbflow ticket engine.

pub mod api;
pub mod metrics;
pub mod state;
pub mod ticket_types;
