//! Types and constants shared by every Parley crate.

pub mod constants;
pub mod types;

pub use types::{ConnectivityState, ConversationId, UserId};
