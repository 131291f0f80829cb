//! v002 -- Upload task records.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS uploads (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    source_ref        TEXT NOT NULL,
    destination_key   TEXT NOT NULL,
    bytes_total       INTEGER NOT NULL,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL,              -- pending | active | completed | failed | cancelled
    address           TEXT,                       -- set once completed
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploads_status ON uploads(status);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
