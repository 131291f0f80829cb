//! The client facade.
//!
//! [`SafelineClient`] wires the collaborators together and gates every
//! action on the resolved session role. Each public operation surfaces its
//! failure as a [`Notification`](crate::events::Notification) before
//! returning it.
//!
//! The session follows the auth provider's state channel. Live lists and
//! SOS countdowns opened for a session end with it: the next sign-in or
//! sign-out closes them.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use safeline_shared::constants::RESPONDER_ROLE_TAG;
use safeline_shared::{
    AuthError, ChatMessage, Identity, Record, Report, Role, RoleRecord, SafelineError, Session,
    SosAlert, SubscriptionError, UserProfile, ValidationError,
};
use safeline_store::database::default_data_dir;
use safeline_store::{
    BlobStore, Database, DocumentStore, FsBlobStore, Query, SqliteDocumentStore, StoreError,
    UploadRecord, UploadStatus,
};

use crate::auth::{AuthProvider, LocalAuth};
use crate::chat;
use crate::config::ClientConfig;
use crate::events::{Notification, Notifier};
use crate::geolocation::{Geolocator, StaticGeolocator};
use crate::reports::{ReportDraft, ReportSubmitter, SubmissionProgress};
use crate::session::{SessionResolver, SessionState};
use crate::sos::{SosAlertMachine, SosState};
use crate::subscriptions::{SnapshotEvent, SubscriptionHandle, SubscriptionManager};
use crate::upload::UploadPipeline;

/// Directory under the data dir holding uploaded blobs.
pub const BLOB_DIR: &str = "blobs";

/// The external services the client runs against.
pub struct Collaborators {
    pub db: Arc<Mutex<Database>>,
    pub store: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub auth: Arc<dyn AuthProvider>,
    pub geolocator: Arc<dyn Geolocator>,
}

#[derive(Debug, Clone, Default)]
pub struct UserRegistration {
    pub username: String,
    pub email: String,
    pub mobile: String,
    pub secret: String,
    pub confirm_secret: String,
}

#[derive(Debug, Clone, Default)]
pub struct ResponderRegistration {
    pub responder_id: String,
    pub display_name: String,
    pub secret: String,
    pub confirm_secret: String,
}

fn require_field(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}

fn require_matching(secret: &str, confirm: &str) -> Result<(), ValidationError> {
    if secret != confirm {
        return Err(ValidationError::SecretMismatch);
    }
    Ok(())
}

pub struct SafelineClient {
    config: ClientConfig,
    db: Arc<Mutex<Database>>,
    store: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    geolocator: Arc<dyn Geolocator>,
    sessions: Arc<SessionResolver>,
    follower: JoinHandle<()>,
    subscriptions: SubscriptionManager,
    uploads: Arc<UploadPipeline>,
    reports: ReportSubmitter,
    notifier: Notifier,
}

impl SafelineClient {
    /// Open the local database and blob directory under the configured data
    /// directory.
    pub async fn open(config: ClientConfig) -> Result<Self, SafelineError> {
        let data_dir: PathBuf = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        let db = Arc::new(Mutex::new(Database::open_in_dir(&data_dir)?));
        let blobs = FsBlobStore::new(data_dir.join(BLOB_DIR), config.max_blob_size).await?;
        info!(data_dir = %data_dir.display(), "Safeline client opened");

        let collaborators = Collaborators {
            store: Arc::new(SqliteDocumentStore::new(Arc::clone(&db))),
            blobs: Arc::new(blobs),
            auth: Arc::new(LocalAuth::new(Arc::clone(&db))),
            geolocator: Arc::new(StaticGeolocator::new(config.static_position)),
            db,
        };
        Ok(Self::with_collaborators(config, collaborators))
    }

    /// Must be called from within a Tokio runtime.
    pub fn with_collaborators(config: ClientConfig, c: Collaborators) -> Self {
        let uploads = Arc::new(UploadPipeline::new(
            c.blobs,
            Arc::clone(&c.db),
            config.upload_chunk_size,
            config.max_blob_size,
        ));
        let sessions = Arc::new(SessionResolver::new(Arc::clone(&c.store), config.role_fallback));
        let follower = sessions.follow(c.auth.auth_state());
        Self {
            sessions,
            follower,
            subscriptions: SubscriptionManager::new(Arc::clone(&c.store)),
            reports: ReportSubmitter::new(Arc::clone(&c.store), Arc::clone(&uploads)),
            uploads,
            db: c.db,
            store: c.store,
            auth: c.auth,
            geolocator: c.geolocator,
            notifier: Notifier::new(),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    pub fn session_state(&self) -> watch::Receiver<SessionState> {
        self.sessions.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.sessions.session()
    }

    // -----------------------------------------------------------------------
    // Accounts
    // -----------------------------------------------------------------------

    pub async fn register_user(&self, registration: UserRegistration) -> Result<Session, SafelineError> {
        let result = self.register_user_inner(registration).await;
        self.notifier.surface("Registration failed", result)
    }

    async fn register_user_inner(&self, r: UserRegistration) -> Result<Session, SafelineError> {
        require_field("username", &r.username)?;
        require_field("email", &r.email)?;
        require_field("mobile", &r.mobile)?;
        require_matching(&r.secret, &r.confirm_secret)?;

        let before = self.sessions.generation();
        let identity = self
            .auth
            .create_account(&r.email, &r.secret, Some(&r.username))
            .await?;
        let profile = UserProfile {
            id: String::new(),
            uid: identity.uid.to_string(),
            username: r.username.trim().to_string(),
            email: identity.email.clone(),
            mobile: r.mobile.trim().to_string(),
            role: Role::User,
        };
        self.store.put_record(identity.uid.as_str(), &profile).await?;
        self.establish(before, &identity).await
    }

    pub async fn register_responder(
        &self,
        registration: ResponderRegistration,
    ) -> Result<Session, SafelineError> {
        let result = self.register_responder_inner(registration).await;
        self.notifier.surface("Registration failed", result)
    }

    async fn register_responder_inner(&self, r: ResponderRegistration) -> Result<Session, SafelineError> {
        require_field("responderId", &r.responder_id)?;
        require_field("displayName", &r.display_name)?;
        require_matching(&r.secret, &r.confirm_secret)?;

        let email = self.config.responder_email(&r.responder_id);
        let before = self.sessions.generation();
        let identity = self
            .auth
            .create_account(&email, &r.secret, Some(&r.display_name))
            .await?;
        // Account creation signs in before the role document exists. Let
        // that resolution settle, then sign in again so the role resolves
        // from the document.
        self.sessions.settled_after(before).await;
        let record = RoleRecord::responder(r.responder_id.trim(), r.display_name.trim());
        self.store.put_record(identity.uid.as_str(), &record).await?;

        let before = self.sessions.generation();
        let identity = self.auth.sign_in(&email, &r.secret).await?;
        self.establish(before, &identity).await
    }

    pub async fn sign_in(&self, email: &str, secret: &str) -> Result<Session, SafelineError> {
        let result = async {
            let before = self.sessions.generation();
            let identity = self.auth.sign_in(email, secret).await?;
            self.establish(before, &identity).await
        }
        .await;
        self.notifier.surface("Sign-in failed", result)
    }

    /// Sign in with a responder id. An account without the responder role
    /// is signed straight back out.
    pub async fn sign_in_responder(&self, responder_id: &str, secret: &str) -> Result<Session, SafelineError> {
        let result = async {
            require_field("responderId", responder_id)?;
            let email = self.config.responder_email(responder_id);
            let before = self.sessions.generation();
            let identity = self.auth.sign_in(&email, secret).await?;
            let session = self.establish(before, &identity).await?;
            if !session.is_responder() {
                self.sign_out().await;
                return Err(AuthError::Forbidden {
                    required: Role::Responder,
                }
                .into());
            }
            Ok(session)
        }
        .await;
        self.notifier.surface("Sign-in failed", result)
    }

    /// Sign out and wait for the session to clear.
    pub async fn sign_out(&self) {
        let before = self.sessions.generation();
        self.auth.sign_out().await;
        self.sessions.settled_after(before).await;
    }

    /// Wait for the auth event published after generation `after` to
    /// settle, and return its session.
    async fn establish(&self, after: u64, identity: &Identity) -> Result<Session, SafelineError> {
        match self.sessions.settled_after(after).await {
            SessionState::AuthenticatedUser(session) | SessionState::AuthenticatedResponder(session)
                if session.identity.uid == identity.uid =>
            {
                Ok(session)
            }
            SessionState::ResolutionFailed { error, .. } => Err(error.into()),
            // Superseded by a newer sign-in or a sign-out.
            _ => Err(AuthError::NotSignedIn.into()),
        }
    }

    fn require(&self, role: Option<Role>) -> Result<Session, SafelineError> {
        let session = self.sessions.session().ok_or(AuthError::NotSignedIn)?;
        if let Some(required) = role {
            if session.role != required {
                return Err(AuthError::Forbidden { required }.into());
            }
        }
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Live lists
    // -----------------------------------------------------------------------

    /// Forward every event to `callback`, surfacing stream errors.
    fn surfaced<T, F>(&self, title: &'static str, mut callback: F) -> impl FnMut(SnapshotEvent<T>) + Send + 'static
    where
        T: Send + 'static,
        F: FnMut(SnapshotEvent<T>) + Send + 'static,
    {
        let notifier = self.notifier.clone();
        move |event| {
            match &event {
                SnapshotEvent::Error(SubscriptionError::SessionEnded) => {}
                SnapshotEvent::Error(e) => notifier.emit(Notification::error(title, e.to_string())),
                SnapshotEvent::Snapshot(_) => {}
            }
            callback(event);
        }
    }

    /// Close `handle` when `session` ends.
    fn bind_to_session(&self, session: &Session, handle: SubscriptionHandle) -> SubscriptionHandle {
        let closer = handle.closer();
        self.sessions.bind(session.generation, move || {
            closer.close(SubscriptionError::SessionEnded);
        });
        handle
    }

    pub fn subscribe_chat<F>(&self, thread_key: &str, callback: F) -> Result<SubscriptionHandle, SafelineError>
    where
        F: FnMut(SnapshotEvent<ChatMessage>) + Send + 'static,
    {
        let result = self.require(None).map(|session| {
            let handle = self
                .subscriptions
                .subscribe_chat(thread_key, self.surfaced("Chat unavailable", callback));
            self.bind_to_session(&session, handle)
        });
        self.notifier.surface("Chat unavailable", result)
    }

    /// Users see their own reports, responders every report.
    pub fn subscribe_reports<F>(&self, callback: F) -> Result<SubscriptionHandle, SafelineError>
    where
        F: FnMut(SnapshotEvent<Report>) + Send + 'static,
    {
        let result = self.require(None).map(|session| {
            let handle = self
                .subscriptions
                .subscribe_reports(&session, self.surfaced("Reports unavailable", callback));
            self.bind_to_session(&session, handle)
        });
        self.notifier.surface("Reports unavailable", result)
    }

    pub fn subscribe_sos_alerts<F>(&self, callback: F) -> Result<SubscriptionHandle, SafelineError>
    where
        F: FnMut(SnapshotEvent<SosAlert>) + Send + 'static,
    {
        let result = self.require(Some(Role::Responder)).map(|session| {
            let handle = self
                .subscriptions
                .subscribe_sos_alerts(self.surfaced("SOS alerts unavailable", callback));
            self.bind_to_session(&session, handle)
        });
        self.notifier.surface("SOS alerts unavailable", result)
    }

    /// Responders a user can open a chat with.
    pub async fn list_responders(&self) -> Result<Vec<RoleRecord>, SafelineError> {
        let result = async {
            self.require(None)?;
            let query = Query::collection(RoleRecord::COLLECTION).where_eq("role", RESPONDER_ROLE_TAG);
            Ok(self.store.query_records::<RoleRecord>(&query).await?)
        }
        .await;
        self.notifier.surface("Responders unavailable", result)
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    pub async fn send_chat(&self, thread_key: &str, text: &str) -> Result<ChatMessage, SafelineError> {
        let result = async {
            let session = self.require(None)?;
            chat::send_message(self.store.as_ref(), &session, thread_key, text).await
        }
        .await;
        self.notifier.surface("Message not sent", result)
    }

    /// Start an SOS countdown for the signed-in user. The returned machine
    /// owns the countdown; dropping it or ending the session cancels.
    pub fn start_sos(&self) -> Result<SosAlertMachine, SafelineError> {
        let result = self.require(Some(Role::User)).map(|session| {
            let machine = SosAlertMachine::new(
                Arc::clone(&self.store),
                Arc::clone(&self.geolocator),
                self.config.geolocation,
                self.config.sos_countdown_secs,
                session.identity.display_name.as_deref(),
            );
            self.watch_sos(machine.subscribe());
            machine.start();
            let canceller = machine.canceller();
            self.sessions.bind(session.generation, move || {
                canceller.cancel();
            });
            machine
        });
        self.notifier.surface("SOS unavailable", result)
    }

    fn watch_sos(&self, mut rx: watch::Receiver<SosState>) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let terminal = match rx.wait_for(SosState::is_terminal).await {
                Ok(state) => state.clone(),
                Err(_) => return,
            };
            match terminal {
                SosState::Completed(alert) => {
                    notifier.emit(Notification::info("SOS sent", alert.maps_url()));
                }
                SosState::Failed(e) => {
                    notifier.emit(Notification::error("SOS failed", e.to_string()));
                }
                _ => debug!("SOS ended without an alert"),
            }
        });
    }

    pub async fn submit_report(&self, draft: ReportDraft) -> Result<Report, SafelineError> {
        let result = async {
            let session = self.require(Some(Role::User))?;
            self.reports.submit(session.uid(), draft).await
        }
        .await;
        self.notifier.surface("Report not submitted", result)
    }

    pub fn submission_progress(&self) -> watch::Receiver<SubmissionProgress> {
        self.reports.progress()
    }

    /// Delete one of the signed-in user's own reports.
    pub async fn delete_report(&self, report_id: &str) -> Result<(), SafelineError> {
        let result = async {
            let session = self.require(Some(Role::User))?;
            let report: Report = self
                .store
                .get_record(report_id)
                .await?
                .ok_or(StoreError::NotFound)?;
            if report.reporter_id != session.uid().as_str() {
                return Err(AuthError::NotOwner.into());
            }
            self.store.delete_document(Report::COLLECTION, report_id).await?;
            info!(id = report_id, "Report deleted");
            Ok(())
        }
        .await;
        self.notifier.surface("Report not deleted", result)
    }

    pub fn list_uploads(&self, status: Option<UploadStatus>) -> Result<Vec<UploadRecord>, SafelineError> {
        let result = self.uploads.list(status);
        self.notifier.surface("Uploads unavailable", result)
    }

    /// Shared database handle, for embedding applications that keep their
    /// own tables alongside.
    pub fn database(&self) -> Arc<Mutex<Database>> {
        Arc::clone(&self.db)
    }
}

impl Drop for SafelineClient {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use safeline_shared::{Position, UploadError};

    use super::*;
    use crate::events::Level;
    use crate::upload::UploadSource;

    async fn client(dir: &TempDir) -> SafelineClient {
        let config = ClientConfig {
            data_dir: Some(dir.path().to_path_buf()),
            sos_countdown_secs: 0,
            static_position: Some(Position {
                latitude: 40.0,
                longitude: -74.0,
            }),
            ..ClientConfig::default()
        };
        SafelineClient::open(config).await.unwrap()
    }

    fn user(email: &str) -> UserRegistration {
        UserRegistration {
            username: "jane".into(),
            email: email.into(),
            mobile: "0600".into(),
            secret: "hunter22".into(),
            confirm_secret: "hunter22".into(),
        }
    }

    fn responder(id: &str) -> ResponderRegistration {
        ResponderRegistration {
            responder_id: id.into(),
            display_name: "Officer Dee".into(),
            secret: "badge-123".into(),
            confirm_secret: "badge-123".into(),
        }
    }

    fn draft() -> ReportDraft {
        ReportDraft {
            name: "Jane".into(),
            mobile: "0600".into(),
            description: "hit and run".into(),
            licence_image: Some(UploadSource::memory("licence.jpg", &b"plate"[..])),
            insurance_image: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_sign_in_roles() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir).await;

        let session = client.register_user(user("jane@example.com")).await.unwrap();
        assert_eq!(session.role, Role::User);
        let profile: UserProfile = client
            .store
            .get_record(session.uid().as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(profile.mobile, "0600");

        let session = client.register_responder(responder("R-17")).await.unwrap();
        assert!(session.is_responder());

        client.sign_out().await;
        assert_eq!(client.session(), None);

        let session = client.sign_in_responder("R-17", "badge-123").await.unwrap();
        assert!(session.is_responder());
        let session = client.sign_in("jane@example.com", "hunter22").await.unwrap();
        assert_eq!(session.role, Role::User);
    }

    #[tokio::test]
    async fn test_user_cannot_sign_in_as_responder() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir).await;
        let cfg_email = client.config().responder_email("R-9");
        client.register_user(user(&cfg_email)).await.unwrap();
        client.sign_out().await;

        assert_eq!(
            client.sign_in_responder("R-9", "hunter22").await,
            Err(AuthError::Forbidden {
                required: Role::Responder
            }
            .into())
        );
        assert_eq!(client.session(), None);
    }

    #[tokio::test]
    async fn test_registration_validation_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir).await;
        let mut notes = client.notifications();

        let mut reg = user("jane@example.com");
        reg.confirm_secret = "different".into();
        assert_eq!(
            client.register_user(reg).await,
            Err(ValidationError::SecretMismatch.into())
        );
        let note = notes.try_recv().unwrap();
        assert_eq!(note.level, Level::Error);
        assert_eq!(note.title, "Registration failed");
    }

    #[tokio::test]
    async fn test_actions_are_role_gated() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir).await;

        assert_eq!(
            client.send_chat("0600", "hello").await,
            Err(AuthError::NotSignedIn.into())
        );

        client.register_responder(responder("R-1")).await.unwrap();
        assert!(matches!(
            client.submit_report(draft()).await,
            Err(SafelineError::Auth(AuthError::Forbidden { required: Role::User }))
        ));
        assert!(client.start_sos().is_err());
        assert!(client.subscribe_sos_alerts(|_| {}).is_ok());

        client.register_user(user("jane@example.com")).await.unwrap();
        assert!(matches!(
            client.subscribe_sos_alerts(|_| {}),
            Err(SafelineError::Auth(AuthError::Forbidden { required: Role::Responder }))
        ));
    }

    /// Two clients over one store, each with its own sign-in.
    async fn desk_and_phone(dir: &TempDir) -> (SafelineClient, SafelineClient) {
        let db = Arc::new(Mutex::new(Database::open_in_dir(dir.path()).unwrap()));
        let store: Arc<dyn DocumentStore> = Arc::new(SqliteDocumentStore::new(Arc::clone(&db)));
        let blobs: Arc<dyn BlobStore> = Arc::new(
            FsBlobStore::new(dir.path().join(BLOB_DIR), ClientConfig::default().max_blob_size)
                .await
                .unwrap(),
        );
        let config = ClientConfig {
            data_dir: Some(dir.path().to_path_buf()),
            sos_countdown_secs: 0,
            static_position: Some(Position {
                latitude: 40.0,
                longitude: -74.0,
            }),
            ..ClientConfig::default()
        };
        let open = |config: ClientConfig| {
            SafelineClient::with_collaborators(
                config.clone(),
                Collaborators {
                    db: Arc::clone(&db),
                    store: Arc::clone(&store),
                    blobs: Arc::clone(&blobs),
                    auth: Arc::new(LocalAuth::new(Arc::clone(&db))),
                    geolocator: Arc::new(StaticGeolocator::new(config.static_position)),
                },
            )
        };
        (open(config.clone()), open(config))
    }

    #[tokio::test]
    async fn test_sos_alert_reaches_responders() {
        let dir = TempDir::new().unwrap();
        let (desk, phone) = desk_and_phone(&dir).await;
        let mut notes = phone.notifications();

        desk.register_responder(responder("R-1")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _alerts = desk
            .subscribe_sos_alerts(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        assert_eq!(rx.recv().await, Some(SnapshotEvent::Snapshot(vec![])));

        phone.register_user(user("jane@example.com")).await.unwrap();
        let sos = phone.start_sos().unwrap();
        let SosState::Completed(alert) = sos.wait_terminal().await else {
            panic!("SOS did not complete: {:?}", sos.state());
        };
        assert_eq!(alert.display_name, "jane");

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SnapshotEvent::Snapshot(vec![alert.clone()]));

        let note = tokio::time::timeout(Duration::from_secs(5), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.title, "SOS sent");
        assert_eq!(note.body, alert.maps_url());
    }

    #[tokio::test]
    async fn test_sign_out_ends_session_streams() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir).await;
        let mut notes = client.notifications();

        client.register_responder(responder("R-1")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _alerts = client
            .subscribe_sos_alerts(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        assert_eq!(rx.recv().await, Some(SnapshotEvent::Snapshot(vec![])));

        client.sign_out().await;
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SnapshotEvent::Error(SubscriptionError::SessionEnded)));

        // A user signing in on the same client must not see responder traffic.
        client.register_user(user("jane@example.com")).await.unwrap();
        let sos = client.start_sos().unwrap();
        assert!(matches!(sos.wait_terminal().await, SosState::Completed(_)));
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, None);

        // Ending the stream is not an error worth surfacing.
        let note = tokio::time::timeout(Duration::from_secs(5), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.title, "SOS sent");
    }

    #[tokio::test]
    async fn test_sign_out_cancels_sos_countdown() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            data_dir: Some(dir.path().to_path_buf()),
            sos_countdown_secs: 30,
            ..ClientConfig::default()
        };
        let client = SafelineClient::open(config).await.unwrap();
        client.register_user(user("jane@example.com")).await.unwrap();

        let sos = client.start_sos().unwrap();
        assert!(matches!(sos.state(), SosState::CountingDown(_)));
        client.sign_out().await;

        let state = tokio::time::timeout(Duration::from_secs(5), sos.wait_terminal())
            .await
            .unwrap();
        assert_eq!(state, SosState::Cancelled);
        let alerts: Vec<SosAlert> = client
            .store
            .query_records(&Query::collection(SosAlert::COLLECTION))
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_report_lifecycle() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir).await;

        client.register_user(user("other@example.com")).await.unwrap();
        let theirs = client.submit_report(draft()).await.unwrap();

        client.register_user(user("jane@example.com")).await.unwrap();
        let mine = client.submit_report(draft()).await.unwrap();
        assert!(mine.licence_image.as_deref().is_some_and(|a| a.starts_with("file://")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _reports = client
            .subscribe_reports(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        assert_eq!(rx.recv().await, Some(SnapshotEvent::Snapshot(vec![mine.clone()])));

        assert_eq!(
            client.delete_report(&theirs.id).await,
            Err(AuthError::NotOwner.into())
        );
        client.delete_report(&mine.id).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SnapshotEvent::Snapshot(vec![]));

        let completed = client.list_uploads(Some(UploadStatus::Completed)).unwrap();
        assert_eq!(completed.len(), 2);
    }

    #[tokio::test]
    async fn test_oversize_image_aborts_report() {
        let dir = TempDir::new().unwrap();
        let config = ClientConfig {
            data_dir: Some(dir.path().to_path_buf()),
            max_blob_size: 4,
            ..ClientConfig::default()
        };
        let client = SafelineClient::open(config).await.unwrap();
        client.register_user(user("jane@example.com")).await.unwrap();

        assert_eq!(
            client.submit_report(draft()).await,
            Err(UploadError::TooLarge { size: 5, max: 4 }.into())
        );
        let reports: Vec<Report> = client
            .store
            .query_records(&Query::collection(Report::COLLECTION))
            .await
            .unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_chat_between_roles() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir).await;

        client.register_responder(responder("R-1")).await.unwrap();
        client.register_user(user("jane@example.com")).await.unwrap();
        let responders = client.list_responders().await.unwrap();
        assert_eq!(responders.len(), 1);
        assert_eq!(responders[0].responder_id.as_deref(), Some("R-1"));

        client.send_chat("0600", "need help").await.unwrap();
        client.sign_in_responder("R-1", "badge-123").await.unwrap();
        client.send_chat("0600", "on my way").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _chat = client
            .subscribe_chat("0600", move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        let Some(SnapshotEvent::Snapshot(thread)) = rx.recv().await else {
            panic!("expected a snapshot");
        };
        let lines: Vec<_> = thread.iter().map(|m| (m.sender_role, m.text.as_str())).collect();
        assert_eq!(
            lines,
            vec![(Role::User, "need help"), (Role::Responder, "on my way")]
        );
    }
}
