/// Application name
pub const APP_NAME: &str = "Safeline";

/// Collection holding role documents for responders, keyed by uid.
pub const RESPONDERS_COLLECTION: &str = "responders";

/// Collection holding civilian user profiles, keyed by uid.
pub const USERS_COLLECTION: &str = "users";

/// Append-only chat log.
pub const CHATS_COLLECTION: &str = "chats";

/// Incident reports.
pub const REPORTS_COLLECTION: &str = "reports";

/// Append-only SOS alert log.
pub const SOS_ALERTS_COLLECTION: &str = "sos_alerts";

/// Role string stored in a role document for responders.
pub const RESPONDER_ROLE_TAG: &str = "responder";

/// Role string stored in a user profile.
pub const USER_ROLE_TAG: &str = "user";

/// Display name written on an SOS alert when the identity has none.
pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

/// Seconds counted down before an SOS capture starts.
pub const SOS_COUNTDOWN_SECS: u8 = 5;

/// Geolocation fix timeout in seconds.
pub const GEOLOCATION_TIMEOUT_SECS: u64 = 20;

/// Oldest cached position accepted for an SOS fix, in milliseconds.
pub const GEOLOCATION_MAX_CACHE_AGE_MS: u64 = 1_000;

/// Default upload chunk size in bytes (256 KiB)
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// Default maximum blob size in bytes (20 MiB)
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 20 * 1024 * 1024;

/// Email domain appended to a responder id at sign-in.
pub const DEFAULT_RESPONDER_EMAIL_DOMAIN: &str = "responder.safeline";

/// Maps search URL prefix used to open an SOS alert location.
pub const MAPS_SEARCH_URL: &str = "https://www.google.com/maps/search/?api=1&query=";
