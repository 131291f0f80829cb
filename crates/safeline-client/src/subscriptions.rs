//! Live query subscriptions.
//!
//! A subscription re-reads its query whenever the store commits to the
//! queried collection and hands the consumer the full ordered result set.
//! Nothing is diffed: each snapshot replaces the previous one. A snapshot is
//! only delivered when the result actually changed, so writes elsewhere in
//! the collection stay silent.
//!
//! The consumer callback lives in a slot shared with the handle. Closing
//! the slot marks it under a flag that delivery checks before and after
//! each callback, so no callback starts after `dispose` returns. A callback
//! may dispose its own handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use safeline_shared::{Record, SosAlert, Session, SubscriptionError};
use safeline_store::{Direction, Document, DocumentStore, Query, StoreError};

use crate::chat;

/// One delivery on a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent<T> {
    /// The complete current result set, in query order.
    Snapshot(Vec<T>),
    /// The stream has failed and will deliver nothing more.
    Error(SubscriptionError),
}

type Callback<T> = Box<dyn FnMut(SnapshotEvent<T>) + Send>;

struct Slot<T> {
    callback: Mutex<Option<Callback<T>>>,
    closed: AtomicBool,
}

impl<T> Slot<T> {
    fn new(callback: Callback<T>) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Callback<T>>> {
        match self.callback.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns `false` once the slot has been closed.
    fn deliver(&self, event: SnapshotEvent<T>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.lock();
        if self.closed.load(Ordering::SeqCst) {
            guard.take();
            return false;
        }
        let Some(callback) = guard.as_mut() else {
            return false;
        };
        callback(event);
        // Closed from inside the callback, or while it ran.
        if self.closed.load(Ordering::SeqCst) {
            guard.take();
            return false;
        }
        true
    }
}

trait Detach: Send + Sync {
    /// Close the slot; `true` for the call that closed it.
    fn detach(&self) -> bool;

    /// Close the slot and hand the consumer one last error event.
    fn end(&self, error: SubscriptionError) -> bool;
}

impl<T: Send> Detach for Slot<T> {
    fn detach(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        match self.callback.try_lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().take();
            }
            // A delivery is running and drops the callback when it returns.
            Err(TryLockError::WouldBlock) => {}
        }
        first
    }

    fn end(&self, error: SubscriptionError) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Waits out a delivery in progress, then calls back outside the lock.
        let callback = self.lock().take();
        if let Some(mut callback) = callback {
            callback(SnapshotEvent::Error(error));
        }
        true
    }
}

/// Owner of a live subscription. Dropping it disposes the subscription.
pub struct SubscriptionHandle {
    collection: String,
    slot: Arc<dyn Detach>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop delivery. Safe to call any number of times, including from the
    /// subscription's own callback; returns `true` only for the call that
    /// actually detached the consumer.
    pub fn dispose(&self) -> bool {
        let detached = self.slot.detach();
        self.task.abort();
        if detached {
            debug!(collection = %self.collection, "Subscription disposed");
        }
        detached
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// A detached way to end this subscription with a final error event,
    /// for whoever owns the scope the subscription belongs to.
    pub fn closer(&self) -> SubscriptionCloser {
        SubscriptionCloser {
            collection: self.collection.clone(),
            slot: Arc::downgrade(&self.slot),
            task: self.task.abort_handle(),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

/// Ends a subscription without owning its handle. Does nothing if the
/// subscription was already disposed or has failed.
pub struct SubscriptionCloser {
    collection: String,
    slot: Weak<dyn Detach>,
    task: AbortHandle,
}

impl SubscriptionCloser {
    pub fn close(self, error: SubscriptionError) -> bool {
        self.task.abort();
        let Some(slot) = self.slot.upgrade() else {
            return false;
        };
        let ended = slot.end(error);
        if ended {
            debug!(collection = %self.collection, "Subscription closed");
        }
        ended
    }
}

#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn DocumentStore>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Subscribe `callback` to `query`. The current result set is delivered
    /// straight away, then again after every commit that changes it.
    pub fn subscribe<T, F>(&self, query: Query, callback: F) -> SubscriptionHandle
    where
        T: Record,
        F: FnMut(SnapshotEvent<T>) + Send + 'static,
    {
        let slot = Arc::new(Slot::new(Box::new(callback) as Callback<T>));
        let collection = query.collection.clone();
        debug!(collection = %collection, "Subscription opened");

        // Subscribe to the feed before the first read so no commit slips
        // between the two.
        let feed = self.store.changes();
        let task = tokio::spawn(run(Arc::clone(&self.store), query, feed, Arc::clone(&slot)));

        SubscriptionHandle {
            collection,
            slot,
            task,
        }
    }

    pub fn subscribe_chat<F>(&self, thread_key: &str, callback: F) -> SubscriptionHandle
    where
        F: FnMut(SnapshotEvent<safeline_shared::ChatMessage>) + Send + 'static,
    {
        self.subscribe(chat::thread_query(thread_key), callback)
    }

    /// Responders see every report; users only their own.
    pub fn subscribe_reports<F>(&self, session: &Session, callback: F) -> SubscriptionHandle
    where
        F: FnMut(SnapshotEvent<safeline_shared::Report>) + Send + 'static,
    {
        self.subscribe(reports_query(session), callback)
    }

    pub fn subscribe_sos_alerts<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: FnMut(SnapshotEvent<SosAlert>) + Send + 'static,
    {
        let query = Query::collection(SosAlert::COLLECTION).order_by("timestamp", Direction::Descending);
        self.subscribe(query, callback)
    }
}

/// Report list visible to `session`, newest first.
pub fn reports_query(session: &Session) -> Query {
    let query = Query::collection(safeline_shared::Report::COLLECTION);
    let query = if session.is_responder() {
        query
    } else {
        query.where_eq("userId", session.uid().as_str())
    };
    query.order_by("createdAt", Direction::Descending)
}

fn subscription_error(e: StoreError) -> SubscriptionError {
    match e {
        StoreError::Decode { id, reason, .. } => SubscriptionError::Decode { id, reason },
        other => SubscriptionError::StoreUnavailable(other.to_string()),
    }
}

async fn run<T: Record>(
    store: Arc<dyn DocumentStore>,
    query: Query,
    mut feed: tokio::sync::broadcast::Receiver<safeline_store::Commit>,
    slot: Arc<Slot<T>>,
) {
    let mut last: Option<Vec<Document>> = None;

    loop {
        let docs = match store.query(&query).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(collection = %query.collection, error = %e, "Subscription query failed");
                slot.deliver(SnapshotEvent::Error(subscription_error(e)));
                return;
            }
        };

        if last.as_ref() != Some(&docs) {
            let records: Result<Vec<T>, StoreError> = docs.iter().map(Document::decode).collect();
            let delivered = match records {
                Ok(records) => slot.deliver(SnapshotEvent::Snapshot(records)),
                Err(e) => {
                    warn!(collection = %query.collection, error = %e, "Subscription decode failed");
                    slot.deliver(SnapshotEvent::Error(subscription_error(e)));
                    return;
                }
            };
            if !delivered {
                return;
            }
            last = Some(docs);
        }

        // Wait for the next commit that could affect this query.
        loop {
            match feed.recv().await {
                Ok(commit) if commit.collection == query.collection => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    debug!(collection = %query.collection, missed, "Commit feed lagged, re-reading");
                    break;
                }
                Err(RecvError::Closed) => {
                    slot.deliver(SnapshotEvent::Error(SubscriptionError::Closed));
                    return;
                }
            }
        }
    }
}
