//! Low-level query functions, one module per table family.
//!
//! These functions do no domain validation; they execute SQL and report
//! rows-affected where callers need optimistic-locking semantics.

pub mod agents;
pub mod checkpoints;
pub mod locks;
pub mod messages;
pub mod repositories;
pub mod sessions;
pub mod tasks;
pub mod templates;
pub mod workflows;
pub mod workspaces;
