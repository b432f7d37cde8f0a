//! v001 -- Initial schema creation.
//!
//! Creates the user-facing `messages` mirror and the durable
//! `queue_entries` table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (what the UI renders)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,  -- UUID v4, shared with the queue entry
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    payload         TEXT NOT NULL,              -- JSON-encoded Payload
    remote_ref      TEXT,                       -- uploaded blob reference (images)
    created_at      TEXT NOT NULL,              -- RFC-3339, millisecond precision
    delivery_status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at);

-- ----------------------------------------------------------------
-- Queue entries (outbound work awaiting confirmed delivery)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS queue_entries (
    id               TEXT PRIMARY KEY NOT NULL, -- UUID v4, idempotency key
    conversation_id  TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    payload          TEXT NOT NULL,             -- JSON-encoded Payload
    uploaded_ref     TEXT,                      -- set once an image upload succeeded
    created_at       TEXT NOT NULL,
    attempt_count    INTEGER NOT NULL DEFAULT 0,
    next_eligible_at TEXT NOT NULL,
    status           TEXT NOT NULL,
    cancelled        INTEGER NOT NULL DEFAULT 0, -- boolean 0/1
    last_error       TEXT,

    FOREIGN KEY (id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_queue_status_eligible
    ON queue_entries(status, next_eligible_at);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
