//! # safeline-client
//!
//! Client core for the Safeline safety app: session and role resolution,
//! live queries, chunked uploads, the SOS alert countdown and accident
//! report submission. [`SafelineClient`] is the entry point a UI shell
//! drives; the modules below are usable on their own against any
//! [`DocumentStore`](safeline_store::DocumentStore).

pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod events;
pub mod geolocation;
pub mod reports;
pub mod session;
pub mod sos;
pub mod subscriptions;
pub mod upload;

use tracing_subscriber::{fmt, EnvFilter};

pub use client::{Collaborators, ResponderRegistration, SafelineClient, UserRegistration};
pub use config::{ClientConfig, RoleFallback};
pub use events::{Level, Notification};
pub use reports::{ReportDraft, SubmissionProgress};
pub use session::SessionState;
pub use sos::{SosAlertMachine, SosCanceller, SosState};
pub use subscriptions::{SnapshotEvent, SubscriptionCloser, SubscriptionHandle};
pub use upload::{UploadProgress, UploadSource, UploadTask};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("safeline_client=debug,safeline_store=info,warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    tracing::info!("Safeline client logging initialised");
}
