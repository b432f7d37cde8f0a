use serde::{Deserialize, Serialize};

/// Identity of an authenticated user, as handed out by the auth layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target conversation of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic id for a one-to-one conversation: both participants
    /// derive the same value regardless of who opens it first.
    pub fn direct(a: &UserId, b: &UserId) -> Self {
        if a.0 <= b.0 {
            Self(format!("{}_{}", a.0, b.0))
        } else {
            Self(format!("{}_{}", b.0, a.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide reachability of the remote store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_conversation_is_symmetric() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        assert_eq!(
            ConversationId::direct(&alice, &bob),
            ConversationId::direct(&bob, &alice)
        );
        assert_eq!(ConversationId::direct(&alice, &bob).as_str(), "alice_bob");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ConversationId::new("c-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"c-1\"");
    }
}
