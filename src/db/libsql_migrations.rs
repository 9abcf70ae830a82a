//! SQLite-dialect schema for the libSQL backend.
//!
//! Every statement is idempotent; the whole batch runs on each startup.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bots (
    mxid TEXT PRIMARY KEY,
    owner_mxid TEXT NOT NULL,
    credential TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_bots_owner ON bots(owner_mxid);

-- delete_at is unix milliseconds
CREATE TABLE IF NOT EXISTS self_destructing_events (
    event_id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    delete_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS provisioning_journal (
    mxid TEXT PRIMARY KEY,
    owner_mxid TEXT NOT NULL,
    state TEXT NOT NULL,
    detail TEXT,
    updated_at TEXT NOT NULL
);

-- One row per service account: the device it logs in as and its last sync position
CREATE TABLE IF NOT EXISTS sync_state (
    account TEXT PRIMARY KEY,
    device_id TEXT,
    next_batch TEXT,
    updated_at TEXT NOT NULL
);
"#;
