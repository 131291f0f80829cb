//! The document store seam consumed by the client.
//!
//! [`DocumentStore`] is the async contract (get/set/add/delete/query plus a
//! commit feed). [`SqliteDocumentStore`] implements it over a shared
//! [`Database`] and broadcasts each commit after the transaction lands,
//! still holding the database lock, so the feed carries commits in
//! sequence order and subscribers only ever re-read committed state.
//!
//! Consistency is last-write-wins per document. Documents are either owned
//! by a single identity (profiles, reports) or append-only logs (chats, SOS
//! alerts), so no client-side locking is layered on top.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use safeline_shared::Record;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{encode_record, Commit, Document, Fields, Query};

/// Capacity of the commit feed. Slow subscribers that fall further behind
/// observe `Lagged` and re-read their query.
const COMMIT_FEED_CAPACITY: usize = 256;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    async fn set_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()>;

    /// Create a document under a store-assigned id and return that id.
    async fn add_document(&self, collection: &str, fields: Fields) -> Result<String>;

    /// Returns `false` if there was nothing to delete.
    async fn delete_document(&self, collection: &str, id: &str) -> Result<bool>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Subscribe to the commit feed. Every successful write is announced
    /// exactly once, in commit order.
    fn changes(&self) -> broadcast::Receiver<Commit>;
}

/// Typed helpers over any document store.
impl<'a> dyn DocumentStore + 'a {
    pub async fn get_record<T: Record>(&self, id: &str) -> Result<Option<T>> {
        match self.get_document(T::COLLECTION, id).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    /// Append a record under a fresh id, letting the store fill its
    /// server-stamped field, and return the record as committed.
    pub async fn add_record<T: Record>(&self, record: &T) -> Result<T> {
        let fields = encode_record(record, true)?;
        let id = self.add_document(T::COLLECTION, fields).await?;
        self.get_record(&id).await?.ok_or(StoreError::NotFound)
    }

    /// Write a record at a caller-chosen id, replacing whatever was there.
    pub async fn put_record<T: Record>(&self, id: &str, record: &T) -> Result<()> {
        let fields = encode_record(record, false)?;
        self.set_document(T::COLLECTION, id, fields).await
    }

    pub async fn query_records<T: Record>(&self, query: &Query) -> Result<Vec<T>> {
        self.query(query)
            .await?
            .iter()
            .map(Document::decode)
            .collect()
    }
}

/// [`DocumentStore`] backed by the local SQLite [`Database`].
#[derive(Clone)]
pub struct SqliteDocumentStore {
    db: Arc<Mutex<Database>>,
    commits: broadcast::Sender<Commit>,
}

impl SqliteDocumentStore {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        let (commits, _) = broadcast::channel(COMMIT_FEED_CAPACITY);
        Self { db, commits }
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Mutex::new(Database::open_in_memory()?))))
    }

    /// The shared database handle, for collaborators that keep their own
    /// tables (accounts, upload records).
    pub fn database(&self) -> Arc<Mutex<Database>> {
        Arc::clone(&self.db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.db.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Call with the database guard still held, so feed order matches
    /// sequence order across concurrent writers.
    fn announce(&self, commit: Commit) {
        // No receivers is fine: nobody is watching yet.
        let _ = self.commits.send(commit);
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.lock()?.get_document(collection, id)
    }

    async fn set_document(&self, collection: &str, id: &str, fields: Fields) -> Result<()> {
        let mut db = self.lock()?;
        let (_, commit) = db.set_document(collection, id, fields)?;
        self.announce(commit);
        Ok(())
    }

    async fn add_document(&self, collection: &str, fields: Fields) -> Result<String> {
        let mut db = self.lock()?;
        let (doc, commit) = db.add_document(collection, fields)?;
        self.announce(commit);
        Ok(doc.id)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> Result<bool> {
        let mut db = self.lock()?;
        match db.delete_document(collection, id)? {
            Some(commit) => {
                self.announce(commit);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.lock()?.query_documents(query)
    }

    fn changes(&self) -> broadcast::Receiver<Commit> {
        self.commits.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use safeline_shared::{Role, SosAlert};

    use super::*;
    use crate::models::CommitKind;

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(SqliteDocumentStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_commits_are_announced_in_order() {
        let store = store();
        let mut feed = store.changes();

        let a = store
            .add_document("chats", json!({ "text": "a" }).as_object().cloned().unwrap())
            .await
            .unwrap();
        store.delete_document("chats", &a).await.unwrap();

        let first = feed.recv().await.unwrap();
        let second = feed.recv().await.unwrap();
        assert_eq!(first.kind, CommitKind::Added);
        assert_eq!(second.kind, CommitKind::Deleted);
        assert!(second.seq > first.seq);
        assert_eq!(second.document_id, a);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_announce_in_sequence_order() {
        let store = store();
        let mut feed = store.changes();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for n in 0..50 {
                        let fields = json!({ "writer": w, "n": n }).as_object().cloned().unwrap();
                        store.add_document("chats", fields).await.unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..200 {
            let commit = feed.recv().await.unwrap();
            assert!(commit.seq > last, "seq {} after {}", commit.seq, last);
            last = commit.seq;
        }
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_delete_is_not_announced() {
        let store = store();
        let mut feed = store.changes();
        assert!(!store.delete_document("chats", "missing").await.unwrap());
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_add_record_stamps_server_time() {
        let store = store();
        let placeholder = SosAlert {
            id: String::new(),
            display_name: "Anonymous".into(),
            latitude: 1.0,
            longitude: 2.0,
            timestamp: Utc::now() - chrono::Duration::days(365),
        };

        let before = Utc::now();
        let stored = store.add_record(&placeholder).await.unwrap();
        assert!(!stored.id.is_empty());
        assert!(stored.timestamp >= before - chrono::Duration::seconds(1));
        assert_eq!(stored.latitude, 1.0);

        let alerts: Vec<SosAlert> = store
            .query_records(&Query::collection(SosAlert::COLLECTION))
            .await
            .unwrap();
        assert_eq!(alerts, vec![stored]);
    }

    #[tokio::test]
    async fn test_put_record_at_id() {
        let store = store();
        let profile = safeline_shared::UserProfile {
            id: String::new(),
            uid: "u1".into(),
            username: "jane".into(),
            email: "jane@example.com".into(),
            mobile: "0600".into(),
            role: Role::User,
        };
        store.put_record("u1", &profile).await.unwrap();

        let fetched: safeline_shared::UserProfile =
            store.get_record("u1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "u1");
        assert_eq!(fetched.username, "jane");
    }
}
