//! Authentication context consumed by the outbox.
//!
//! The outbox only reads the current identity to stamp `sender_id` on new
//! messages; it never mutates it.

use parley_shared::UserId;

/// Supplies the identity of the signed-in user.
pub trait AuthContext: Send + Sync + 'static {
    /// `None` while nobody is signed in.
    fn current_user(&self) -> Option<UserId>;
}

/// Fixed identity, for daemons and tests.
#[derive(Debug, Clone)]
pub struct StaticAuth(pub UserId);

impl StaticAuth {
    pub fn new(user: impl Into<String>) -> Self {
        Self(UserId::new(user))
    }
}

impl AuthContext for StaticAuth {
    fn current_user(&self) -> Option<UserId> {
        Some(self.0.clone())
    }
}
