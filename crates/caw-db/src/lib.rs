//! Database layer for the caw daemon.
//!
//! A single SQLite file holds all daemon state. This crate owns the schema,
//! the linear migration runner, id generation, the typed row models, and the
//! low-level query functions. Anything with domain rules (state machines,
//! validation, error taxonomy) lives in `caw-core`.

pub mod ids;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

/// Milliseconds since the Unix epoch. All persisted timestamps use this.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
