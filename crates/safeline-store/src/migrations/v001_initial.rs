//! v001 -- Initial schema creation.
//!
//! Creates the document table, the commit log that orders every write, and
//! the local account table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Commit log (one row per document write, never reused)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS commit_log (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    collection   TEXT NOT NULL,
    document_id  TEXT NOT NULL,
    kind         TEXT NOT NULL,               -- added | set | deleted
    committed_at TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Documents
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id         TEXT NOT NULL,
    fields     TEXT NOT NULL,                 -- JSON object
    seq        INTEGER NOT NULL,              -- commit_log(seq) of last write

    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_documents_collection_seq
    ON documents(collection, seq);

-- ----------------------------------------------------------------
-- Accounts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS accounts (
    uid          TEXT PRIMARY KEY NOT NULL,
    email        TEXT NOT NULL UNIQUE,        -- lower-cased
    display_name TEXT,
    secret_hash  TEXT NOT NULL,               -- hex
    salt         TEXT NOT NULL,               -- hex
    created_at   TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
