//! Shared handle to the local SQLite database.

use std::path::Path;
use std::sync::{Arc, Mutex};

use parley_store::{Database, StoreError};

use crate::error::{OutboxError, Result};

/// One connection, serialised behind a mutex and shared by every component.
///
/// Closures passed to [`with`](Self::with) run while the lock is held, so a
/// read-decide-write sequence inside one closure cannot interleave with
/// another component's writes.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> std::result::Result<T, StoreError>,
    {
        let mut db = self.db.lock().map_err(|_| OutboxError::LockPoisoned)?;
        f(&mut db).map_err(OutboxError::from)
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::{ConversationId, UserId};
    use parley_store::{Payload, QueueEntry};

    use super::*;

    #[test]
    fn handles_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let a = LocalStore::open_at(&dir.path().join("p.db")).unwrap();
        let b = a.clone();

        let entry = QueueEntry::new(
            ConversationId::new("c"),
            UserId::new("u"),
            Payload::text("hello"),
        );
        a.with(|db| db.enqueue_entry(&entry)).unwrap();

        let seen = b.with(|db| db.find_queue_entry(entry.id)).unwrap();
        assert_eq!(seen.map(|e| e.id), Some(entry.id));
    }

    #[test]
    fn duplicate_maps_to_outbox_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open_at(&dir.path().join("p.db")).unwrap();
        let entry = QueueEntry::new(ConversationId::new("c"), UserId::new("u"), Payload::text("x"));

        store.with(|db| db.enqueue_entry(&entry)).unwrap();
        let err = store.with(|db| db.enqueue_entry(&entry)).unwrap_err();
        assert!(matches!(err, OutboxError::DuplicateEntry(id) if id == entry.id));
    }
}
