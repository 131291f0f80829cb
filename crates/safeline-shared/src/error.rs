use thiserror::Error;

use crate::types::Role;

/// Top-level error returned by client operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SafelineError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Role resolution error: {0}")]
    RoleResolution(#[from] RoleResolutionError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Geolocation error: {0}")]
    Geolocation(#[from] GeolocationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("A submission is already in progress")]
    SubmissionInProgress,

    #[error("Storage error: {0}")]
    Storage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Email already in use: {0}")]
    EmailInUse(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Action requires the {required} role")]
    Forbidden { required: Role },

    #[error("Only the owner may change this record")]
    NotOwner,

    #[error("Authentication backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoleResolutionError {
    #[error("Failed to fetch role record: {0}")]
    Fetch(String),

    #[error("Malformed role record: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Failed to decode document {id}: {reason}")]
    Decode { id: String, reason: String },

    #[error("Change feed closed")]
    Closed,

    #[error("Session ended")]
    SessionEnded,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Cannot read upload source: {0}")]
    Source(String),

    #[error("Blob too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Upload cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeolocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location fix timed out after {0} s")]
    Timeout(u64),

    #[error("Position unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Passwords do not match")]
    SecretMismatch,

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
