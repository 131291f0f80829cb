//! Authentication collaborator.
//!
//! [`AuthProvider`] is the seam the session resolver listens on. The local
//! implementation keeps accounts in the shared database with salted BLAKE3
//! secret hashes and publishes the signed-in identity on a watch channel;
//! dropping a receiver is the unsubscribe.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use safeline_shared::{AuthError, Identity, SafelineError, UserId, ValidationError};
use safeline_store::{Account, Database, StoreError};

/// Shortest secret accepted at registration.
pub const MIN_SECRET_LEN: usize = 6;

const SECRET_KDF_CONTEXT: &str = "safeline-account-secret-v1";

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Register a new account and sign it in.
    async fn create_account(
        &self,
        email: &str,
        secret: &str,
        display_name: Option<&str>,
    ) -> Result<Identity, SafelineError>;

    async fn sign_in(&self, email: &str, secret: &str) -> Result<Identity, SafelineError>;

    async fn sign_out(&self);

    fn current_identity(&self) -> Option<Identity>;

    /// Every sign-in and sign-out is published here, including a repeated
    /// sign-in of the same identity.
    fn auth_state(&self) -> watch::Receiver<Option<Identity>>;
}

/// [`AuthProvider`] over the local accounts table.
pub struct LocalAuth {
    db: Arc<Mutex<Database>>,
    state: watch::Sender<Option<Identity>>,
}

impl LocalAuth {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        let (state, _) = watch::channel(None);
        Self { db, state }
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&guard)
    }

    fn publish(&self, identity: Option<Identity>) {
        self.state.send_replace(identity);
    }
}

fn hash_secret(salt: &[u8], secret: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_derive_key(SECRET_KDF_CONTEXT);
    hasher.update(salt);
    hasher.update(secret.as_bytes());
    hasher.finalize()
}

fn verify_secret(account: &Account, secret: &str) -> bool {
    let Ok(salt) = hex::decode(&account.salt) else {
        return false;
    };
    let Ok(stored) = blake3::Hash::from_hex(&account.secret_hash) else {
        return false;
    };
    // blake3::Hash equality is constant-time.
    hash_secret(&salt, secret) == stored
}

fn identity_of(account: &Account) -> Identity {
    Identity {
        uid: UserId(account.uid.clone()),
        email: account.email.clone(),
        display_name: account.display_name.clone(),
    }
}

fn backend(e: StoreError) -> SafelineError {
    AuthError::Backend(e.to_string()).into()
}

#[async_trait]
impl AuthProvider for LocalAuth {
    async fn create_account(
        &self,
        email: &str,
        secret: &str,
        display_name: Option<&str>,
    ) -> Result<Identity, SafelineError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(ValidationError::MissingField("email").into());
        }
        if !email.contains('@') {
            return Err(ValidationError::Invalid {
                field: "email",
                reason: "missing @".to_string(),
            }
            .into());
        }
        if secret.len() < MIN_SECRET_LEN {
            return Err(ValidationError::Invalid {
                field: "password",
                reason: format!("must be at least {MIN_SECRET_LEN} characters"),
            }
            .into());
        }

        let salt: [u8; 16] = rand::random();
        let account = Account {
            uid: Uuid::new_v4().simple().to_string(),
            email: email.clone(),
            display_name: display_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            secret_hash: hash_secret(&salt, secret).to_hex().to_string(),
            salt: hex::encode(salt),
            created_at: Utc::now(),
        };

        let inserted = self
            .with_db(|db| {
                if db.email_registered(&email)? {
                    return Ok(false);
                }
                db.insert_account(&account)?;
                Ok(true)
            })
            .map_err(backend)?;
        if !inserted {
            return Err(AuthError::EmailInUse(email).into());
        }

        let identity = identity_of(&account);
        info!(uid = %identity.uid.short(), "Account created");
        self.publish(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, secret: &str) -> Result<Identity, SafelineError> {
        let account = match self.with_db(|db| db.get_account_by_email(email.trim())) {
            Ok(account) => account,
            Err(StoreError::NotFound) => return Err(AuthError::InvalidCredentials.into()),
            Err(e) => return Err(backend(e)),
        };

        if !verify_secret(&account, secret) {
            warn!(uid = %account.uid, "Sign-in rejected");
            return Err(AuthError::InvalidCredentials.into());
        }

        let identity = identity_of(&account);
        info!(uid = %identity.uid.short(), "Signed in");
        self.publish(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) {
        if self.state.borrow().is_some() {
            info!("Signed out");
        }
        self.publish(None);
    }

    fn current_identity(&self) -> Option<Identity> {
        self.state.borrow().clone()
    }

    fn auth_state(&self) -> watch::Receiver<Option<Identity>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> LocalAuth {
        LocalAuth::new(Arc::new(Mutex::new(Database::open_in_memory().unwrap())))
    }

    #[tokio::test]
    async fn test_create_then_sign_in() {
        let auth = auth();
        let created = auth
            .create_account("Jane@Example.com", "hunter22", Some("Jane"))
            .await
            .unwrap();
        assert_eq!(created.email, "jane@example.com");
        assert_eq!(auth.current_identity(), Some(created.clone()));

        auth.sign_out().await;
        assert_eq!(auth.current_identity(), None);

        let signed_in = auth.sign_in("jane@example.com", "hunter22").await.unwrap();
        assert_eq!(signed_in, created);
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let auth = auth();
        auth.create_account("a@b.c", "secret1", None).await.unwrap();
        auth.sign_out().await;

        assert_eq!(
            auth.sign_in("a@b.c", "wrong-secret").await,
            Err(AuthError::InvalidCredentials.into())
        );
        assert_eq!(
            auth.sign_in("nobody@b.c", "secret1").await,
            Err(AuthError::InvalidCredentials.into())
        );
        assert_eq!(auth.current_identity(), None);
    }

    #[tokio::test]
    async fn test_email_in_use() {
        let auth = auth();
        auth.create_account("a@b.c", "secret1", None).await.unwrap();
        assert_eq!(
            auth.create_account("A@B.C", "secret2", None).await,
            Err(AuthError::EmailInUse("a@b.c".into()).into())
        );
    }

    #[tokio::test]
    async fn test_registration_validation() {
        let auth = auth();
        assert!(matches!(
            auth.create_account("", "secret1", None).await,
            Err(SafelineError::Validation(ValidationError::MissingField("email")))
        ));
        assert!(matches!(
            auth.create_account("a@b.c", "123", None).await,
            Err(SafelineError::Validation(ValidationError::Invalid { field: "password", .. }))
        ));
    }

    #[tokio::test]
    async fn test_auth_state_publishes_changes() {
        let auth = auth();
        let mut rx = auth.auth_state();
        assert!(rx.borrow_and_update().is_none());

        auth.create_account("a@b.c", "secret1", None).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_some());

        auth.sign_out().await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
