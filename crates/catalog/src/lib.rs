//! SQLite catalog for the scanning pipeline.
//!
//! Three tables back the three durable facts the pipeline produces:
//! - **artifacts**: every binary ever observed locally, keyed by name.
//!   Rows are immortal for the process lifetime; a full rescan walks this
//!   table.
//! - **rules**: every rule source that has been loaded into a ruleset,
//!   for operator bookkeeping.
//! - **results**: the append-only detection log. Rows are inserted by a
//!   single writer and never updated or deleted; the external feed renders
//!   straight from this table.
//!
//! Schema lives in embedded migrations and is applied on connect; the
//! pipeline itself only ever inserts and selects.

mod db;
pub mod error;
mod models;
mod repo;

pub use crate::db::Database;
pub use crate::models::{Artifact, Detection, RuleSource};
pub use crate::repo::Repository;
