//! Persisted record schemas.
//!
//! Every record maps one-to-one onto a JSON document in a named collection.
//! The document id is not part of the stored fields; it is carried in the
//! `id` member, skipped by serde, and filled in when a document is decoded.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{
    CHATS_COLLECTION, MAPS_SEARCH_URL, REPORTS_COLLECTION, RESPONDERS_COLLECTION,
    RESPONDER_ROLE_TAG, SOS_ALERTS_COLLECTION, USERS_COLLECTION,
};
use crate::types::Role;

/// A typed view over documents of one collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection the record lives in.
    const COLLECTION: &'static str;

    /// Field the store fills with its own commit time on creation, if any.
    const SERVER_TIMESTAMP_FIELD: Option<&'static str> = None;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);
}

// ---------------------------------------------------------------------------
// Role document
// ---------------------------------------------------------------------------

/// Role document stored under `responders/{uid}`.
///
/// The `role` tag is kept as a raw string: older documents may carry tags the
/// client does not know, and those must resolve to the base role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRecord {
    #[serde(skip)]
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub responder_id: Option<String>,
}

impl RoleRecord {
    pub fn responder(responder_id: &str, display_name: &str) -> Self {
        Self {
            id: String::new(),
            role: RESPONDER_ROLE_TAG.to_string(),
            display_name: Some(display_name.to_string()),
            responder_id: Some(responder_id.to_string()),
        }
    }

    pub fn marks_responder(&self) -> bool {
        self.role == RESPONDER_ROLE_TAG
    }
}

impl Record for RoleRecord {
    const COLLECTION: &'static str = RESPONDERS_COLLECTION;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

// ---------------------------------------------------------------------------
// User profile
// ---------------------------------------------------------------------------

/// Civilian profile stored under `users/{uid}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(skip)]
    pub id: String,
    pub uid: String,
    pub username: String,
    pub email: String,
    pub mobile: String,
    pub role: Role,
}

impl Record for UserProfile {
    const COLLECTION: &'static str = USERS_COLLECTION;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(skip)]
    pub id: String,
    #[serde(rename = "userId")]
    pub reporter_id: String,
    pub name: String,
    pub mobile: String,
    /// Download address of the licence image, `None` when omitted.
    pub licence_image: Option<String>,
    /// Download address of the insurance image, `None` when omitted.
    pub insurance_image: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Record for Report {
    const COLLECTION: &'static str = REPORTS_COLLECTION;
    const SERVER_TIMESTAMP_FIELD: Option<&'static str> = Some("createdAt");

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

// ---------------------------------------------------------------------------
// Chat message
// ---------------------------------------------------------------------------

/// One entry of the append-only chat log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(skip)]
    pub id: String,
    pub text: String,
    #[serde(rename = "userType")]
    pub sender_role: Role,
    pub thread_key: String,
    pub created_at: DateTime<Utc>,
}

impl Record for ChatMessage {
    const COLLECTION: &'static str = CHATS_COLLECTION;
    const SERVER_TIMESTAMP_FIELD: Option<&'static str> = Some("createdAt");

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

// ---------------------------------------------------------------------------
// SOS alert
// ---------------------------------------------------------------------------

/// One entry of the append-only SOS alert log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SosAlert {
    #[serde(skip)]
    pub id: String,
    pub display_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

impl SosAlert {
    /// Search URL that opens the alert position in a maps application.
    pub fn maps_url(&self) -> String {
        format!("{MAPS_SEARCH_URL}{},{}", self.latitude, self.longitude)
    }
}

impl Record for SosAlert {
    const COLLECTION: &'static str = SOS_ALERTS_COLLECTION;
    const SERVER_TIMESTAMP_FIELD: Option<&'static str> = Some("timestamp");

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_report_uses_persisted_field_names() {
        let report = Report {
            id: "r1".into(),
            reporter_id: "u1".into(),
            name: "Jane".into(),
            mobile: "0600".into(),
            licence_image: None,
            insurance_image: Some("file:///blobs/a.jpg".into()),
            description: "scratch on door".into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };

        let value = serde_json::to_value(&report).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["userId"], "u1");
        assert!(obj["licenceImage"].is_null());
        assert_eq!(obj["insuranceImage"], "file:///blobs/a.jpg");
        assert!(obj.contains_key("createdAt"));
        assert!(!obj.contains_key("id"));
    }

    #[test]
    fn test_chat_sender_role_is_user_type() {
        let value = serde_json::json!({
            "text": "hello",
            "userType": "responder",
            "threadKey": "0600",
            "createdAt": "2024-05-01T12:00:00Z",
        });
        let msg: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(msg.sender_role, Role::Responder);
        assert_eq!(msg.id, "");
    }

    #[test]
    fn test_unknown_role_tag_is_not_responder() {
        let record: RoleRecord =
            serde_json::from_value(serde_json::json!({ "role": "dispatcher" })).unwrap();
        assert!(!record.marks_responder());
        assert!(RoleRecord::responder("R-17", "Officer").marks_responder());
    }

    #[test]
    fn test_maps_url() {
        let alert = SosAlert {
            id: String::new(),
            display_name: "Anonymous".into(),
            latitude: 12.5,
            longitude: -3.25,
            timestamp: Utc::now(),
        };
        assert_eq!(
            alert.maps_url(),
            "https://www.google.com/maps/search/?api=1&query=12.5,-3.25"
        );
    }
}
