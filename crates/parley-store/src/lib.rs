//! # parley-store
//!
//! Durable local storage for the Parley outbound delivery core, backed by
//! SQLite.
//!
//! The store holds two tables: `queue_entries`, the outbound work still
//! awaiting confirmed remote delivery, and `messages`, the user-facing mirror
//! the UI renders.  Every status transition that touches both is applied in a
//! single transaction so the two never disagree across a crash.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod queue;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
