//! Session and role resolution.
//!
//! Every authentication event starts a new generation. Resolution of the
//! role document runs in its own task and only lands if its generation is
//! still the newest when it returns; a sign-in that is superseded while its
//! lookup is outstanding is dropped on the floor.
//!
//! Resources opened on behalf of a session (live lists, an SOS countdown)
//! are bound to its generation and released by the next auth event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use safeline_shared::{Identity, Role, RoleRecord, RoleResolutionError, Session, UserId};
use safeline_store::{DocumentStore, StoreError};

use crate::config::RoleFallback;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Resolving { generation: u64 },
    AuthenticatedUser(Session),
    AuthenticatedResponder(Session),
    ResolutionFailed {
        generation: u64,
        error: RoleResolutionError,
    },
}

impl SessionState {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::AuthenticatedUser(s) | Self::AuthenticatedResponder(s) => Some(s),
            _ => None,
        }
    }
}

/// Outcome of one role document lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleResolution {
    Responder,
    User,
    Unresolved(RoleResolutionError),
}

/// Look up the role document of `uid`. Only a document tagged `responder`
/// grants the responder role; a missing document means a plain user.
pub async fn resolve_role(store: &dyn DocumentStore, uid: &UserId) -> RoleResolution {
    match store.get_record::<RoleRecord>(uid.as_str()).await {
        Ok(Some(record)) if record.marks_responder() => RoleResolution::Responder,
        Ok(_) => RoleResolution::User,
        Err(StoreError::Decode { reason, .. }) => {
            RoleResolution::Unresolved(RoleResolutionError::Malformed(reason))
        }
        Err(e) => RoleResolution::Unresolved(RoleResolutionError::Fetch(e.to_string())),
    }
}

type Release = Box<dyn FnOnce() + Send>;

/// Turns authentication events into a [`SessionState`] stream.
pub struct SessionResolver {
    store: Arc<dyn DocumentStore>,
    fallback: RoleFallback,
    generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<SessionState>>,
    bound: Mutex<Vec<Release>>,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn DocumentStore>, fallback: RoleFallback) -> Self {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            store,
            fallback,
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
            bound: Mutex::new(Vec::new()),
        }
    }

    fn lock_bound(&self) -> MutexGuard<'_, Vec<Release>> {
        match self.bound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.state.borrow().session().cloned()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Start a new generation for `identity` (`None` is a sign-out) and
    /// return its number. Resolution continues in the background.
    pub fn on_auth_event(&self, identity: Option<Identity>) -> u64 {
        let mut generation = 0;
        // Bumping inside the watch lock orders generations with commits.
        self.state.send_modify(|state| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = if identity.is_some() {
                SessionState::Resolving { generation }
            } else {
                SessionState::Unauthenticated
            };
        });
        self.release_bound(generation);

        let Some(identity) = identity else {
            info!(generation, "Session cleared");
            return generation;
        };
        debug!(generation, uid = %identity.uid.short(), "Resolving role");

        let store = Arc::clone(&self.store);
        let counter = Arc::clone(&self.generation);
        let state = Arc::clone(&self.state);
        let fallback = self.fallback;
        tokio::spawn(async move {
            let resolution = resolve_role(store.as_ref(), &identity.uid).await;
            let next = settle(identity, generation, resolution, fallback);
            let landed = state.send_if_modified(|current| {
                if counter.load(Ordering::SeqCst) != generation {
                    return false;
                }
                *current = next;
                true
            });
            if landed {
                info!(generation, "Session resolved");
            } else {
                debug!(generation, "Discarded stale role resolution");
            }
        });

        generation
    }

    /// Tie `release` to `generation`. It runs when a later auth event ends
    /// that generation, or straight away if one already has. Returns
    /// whether it was bound.
    pub fn bind(&self, generation: u64, release: impl FnOnce() + Send + 'static) -> bool {
        let mut bound = self.lock_bound();
        if self.generation() != generation {
            drop(bound);
            release();
            return false;
        }
        bound.push(Box::new(release));
        true
    }

    fn release_bound(&self, generation: u64) {
        let released = std::mem::take(&mut *self.lock_bound());
        if released.is_empty() {
            return;
        }
        debug!(generation, count = released.len(), "Releasing session resources");
        for release in released {
            release();
        }
    }

    /// Wait for the first settled state of a generation newer than `after`
    /// and return it. A sign-out counts as settled.
    pub async fn settled_after(&self, after: u64) -> SessionState {
        let mut rx = self.state.subscribe();
        let counter = Arc::clone(&self.generation);
        let result = rx
            .wait_for(|state| match state {
                SessionState::Resolving { .. } => false,
                SessionState::AuthenticatedUser(s) | SessionState::AuthenticatedResponder(s) => {
                    s.generation > after
                }
                SessionState::ResolutionFailed { generation, .. } => *generation > after,
                SessionState::Unauthenticated => counter.load(Ordering::SeqCst) > after,
            })
            .await
            .map(|state| state.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.current(),
        }
    }

    /// Drive the resolver from an authentication state channel until the
    /// channel closes. The current value is applied before this returns;
    /// later values are applied by the returned task.
    pub fn follow(self: &Arc<Self>, mut auth_state: watch::Receiver<Option<Identity>>) -> JoinHandle<()> {
        let identity = auth_state.borrow_and_update().clone();
        self.on_auth_event(identity);

        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            while auth_state.changed().await.is_ok() {
                let identity = auth_state.borrow_and_update().clone();
                resolver.on_auth_event(identity);
            }
            debug!("Auth state channel closed");
        })
    }
}

fn settle(
    identity: Identity,
    generation: u64,
    resolution: RoleResolution,
    fallback: RoleFallback,
) -> SessionState {
    let session = |role| Session {
        identity: identity.clone(),
        role,
        generation,
    };
    match resolution {
        RoleResolution::Responder => SessionState::AuthenticatedResponder(session(Role::Responder)),
        RoleResolution::User => SessionState::AuthenticatedUser(session(Role::User)),
        RoleResolution::Unresolved(error) => match fallback {
            RoleFallback::DefaultUser => {
                warn!(generation, error = %error, "Role lookup failed, continuing as user");
                SessionState::AuthenticatedUser(session(Role::User))
            }
            RoleFallback::Block => {
                warn!(generation, error = %error, "Role lookup failed");
                SessionState::ResolutionFailed { generation, error }
            }
        },
    }
}
