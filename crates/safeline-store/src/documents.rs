//! Document CRUD on top of the commit log.
//!
//! Every write runs in one transaction that appends to `commit_log` and
//! stamps the document with the new sequence number, so readers never see a
//! document without its commit and commit order is total.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::database::Database;
use crate::error::Result;
use crate::models::{is_server_timestamp, Commit, CommitKind, Document, Fields, Query};

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row = self
            .conn()
            .query_row(
                "SELECT fields, seq FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        match row {
            Some((json, seq)) => Ok(Some(Document {
                collection: collection.to_string(),
                id: id.to_string(),
                fields: serde_json::from_str(&json)?,
                seq,
            })),
            None => Ok(None),
        }
    }

    /// Run a query. Documents are loaded in commit order and then filtered,
    /// sorted and truncated by [`Query::apply`].
    pub fn query_documents(&self, query: &Query) -> Result<Vec<Document>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, fields, seq FROM documents
             WHERE collection = ?1
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![query.collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, json, seq) = row?;
            docs.push(Document {
                collection: query.collection.clone(),
                id,
                fields: serde_json::from_str(&json)?,
                seq,
            });
        }
        Ok(query.apply(docs))
    }

    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Create a document under a fresh id.
    pub fn add_document(&mut self, collection: &str, fields: Fields) -> Result<(Document, Commit)> {
        let id = Uuid::new_v4().to_string();
        self.write_document(collection, &id, fields, CommitKind::Added)
    }

    /// Create or fully replace the document at `collection/id`.
    pub fn set_document(
        &mut self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<(Document, Commit)> {
        self.write_document(collection, id, fields, CommitKind::Set)
    }

    /// Delete a document. Returns the commit, or `None` if nothing was there.
    pub fn delete_document(&mut self, collection: &str, id: &str) -> Result<Option<Commit>> {
        let tx = self.conn_mut().transaction()?;

        let affected = tx.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        if affected == 0 {
            return Ok(None);
        }

        let commit = append_commit(&tx, collection, id, CommitKind::Deleted)?;
        tx.commit()?;
        Ok(Some(commit))
    }

    fn write_document(
        &mut self,
        collection: &str,
        id: &str,
        mut fields: Fields,
        kind: CommitKind,
    ) -> Result<(Document, Commit)> {
        resolve_server_timestamps(&mut fields);
        let json = serde_json::to_string(&fields)?;

        let tx = self.conn_mut().transaction()?;
        let commit = append_commit(&tx, collection, id, kind)?;
        tx.execute(
            "INSERT INTO documents (collection, id, fields, seq)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET fields = excluded.fields, seq = excluded.seq",
            params![collection, id, json, commit.seq],
        )?;
        tx.commit()?;

        tracing::debug!(collection, id, seq = commit.seq, kind = kind.as_str(), "document written");

        Ok((
            Document {
                collection: collection.to_string(),
                id: id.to_string(),
                fields,
                seq: commit.seq,
            },
            commit,
        ))
    }
}

fn append_commit(
    tx: &Transaction<'_>,
    collection: &str,
    id: &str,
    kind: CommitKind,
) -> Result<Commit> {
    tx.execute(
        "INSERT INTO commit_log (collection, document_id, kind, committed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![collection, id, kind.as_str(), Utc::now().to_rfc3339()],
    )?;
    Ok(Commit {
        seq: tx.last_insert_rowid(),
        collection: collection.to_string(),
        document_id: id.to_string(),
        kind,
    })
}

/// Replace every top-level server-timestamp placeholder with the commit time.
fn resolve_server_timestamps(fields: &mut Fields) {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    for value in fields.values_mut() {
        if is_server_timestamp(value) {
            *value = Value::String(now.clone());
        }
    }
}
