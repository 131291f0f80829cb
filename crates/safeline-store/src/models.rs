//! Types persisted in, or returned by, the local database.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use safeline_shared::Record;

use crate::error::{Result, StoreError};

/// The fields of a document, as a JSON object.
pub type Fields = serde_json::Map<String, Value>;

/// Key of the placeholder object that the store replaces with its commit time.
pub const SERVER_TIMESTAMP_KEY: &str = "$serverTimestamp";

/// Placeholder value resolved to the commit time when the document is written.
pub fn server_timestamp() -> Value {
    serde_json::json!({ SERVER_TIMESTAMP_KEY: true })
}

pub(crate) fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| obj.len() == 1 && obj.get(SERVER_TIMESTAMP_KEY) == Some(&Value::Bool(true)))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A stored JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub fields: Fields,
    /// Sequence number of the commit that last wrote this document.
    pub seq: i64,
}

impl Document {
    /// Decode the fields as a typed record, filling in the document id.
    pub fn decode<T: Record>(&self) -> Result<T> {
        let mut record: T = serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| StoreError::Decode {
                collection: self.collection.clone(),
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        record.set_id(self.id.clone());
        Ok(record)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Serialize a record into document fields, swapping its server-stamped
/// field (if any) for the placeholder.
pub fn encode_record<T: Record>(record: &T, stamp: bool) -> Result<Fields> {
    let mut fields = match serde_json::to_value(record)? {
        Value::Object(map) => map,
        other => {
            return Err(StoreError::Decode {
                collection: T::COLLECTION.to_string(),
                id: record.id().to_string(),
                reason: format!("record serialized to non-object {other}"),
            })
        }
    };
    if stamp {
        if let Some(field) = T::SERVER_TIMESTAMP_FIELD {
            fields.insert(field.to_string(), server_timestamp());
        }
    }
    Ok(fields)
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

impl Filter {
    pub fn matches(&self, fields: &Fields) -> bool {
        fields.get(&self.field) == Some(&self.value)
    }
}

/// A query over a single collection.
///
/// Documents come back in commit order unless an [`OrderBy`] is given, in
/// which case commit order breaks ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters.iter().all(|f| f.matches(fields))
    }

    /// Filter, sort and truncate documents already loaded in commit order.
    pub fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs
            .into_iter()
            .filter(|d| self.matches(&d.fields))
            .collect();

        if let Some(order) = &self.order_by {
            out.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.field), b.get(&order.field));
                let ord = match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                };
                ord.then(a.seq.cmp(&b.seq))
            });
        }

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

/// Total order over optional JSON values.
///
/// Missing < null < bool < number < timestamp < string < other. Strings that
/// parse as RFC 3339 compare as instants, since serialized timestamps do not
/// sort lexically when their fractional digits differ.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(s)) if parse_instant(s).is_some() => 4,
            Some(Value::String(_)) => 5,
            Some(_) => 6,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (parse_instant(x), parse_instant(y)) {
                (Some(tx), Some(ty)) => tx.cmp(&ty),
                _ => rank(a).cmp(&rank(b)).then_with(|| x.cmp(y)),
            }
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Commit log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitKind {
    Added,
    Set,
    Deleted,
}

impl CommitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Set => "set",
            Self::Deleted => "deleted",
        }
    }
}

/// One entry of the commit log, broadcast to live queries after the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub seq: i64,
    pub collection: String,
    pub document_id: String,
    pub kind: CommitKind,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Local credential record backing the authentication collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub uid: String,
    /// Stored lower-cased.
    pub email: String,
    pub display_name: Option<String>,
    /// Hex-encoded salted hash of the secret.
    pub secret_hash: String,
    /// Hex-encoded salt.
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Upload task record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only lifecycle: pending -> active -> terminal. A pending task
    /// may also be cancelled or fail before its first byte moves.
    pub fn can_advance_to(&self, next: UploadStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Active | Self::Failed | Self::Cancelled) => true,
            (Self::Active, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted snapshot of an upload task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub source_ref: String,
    pub destination_key: String,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
    pub status: UploadStatus,
    /// Download address, present only once completed.
    pub address: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(seq: i64, fields: Value) -> Document {
        Document {
            collection: "c".into(),
            id: format!("d{seq}"),
            fields: fields.as_object().cloned().unwrap_or_default(),
            seq,
        }
    }

    #[test]
    fn test_timestamps_compare_as_instants() {
        let a = json!("2024-05-01T12:00:05Z");
        let b = json!("2024-05-01T12:00:05.500Z");
        assert_eq!(compare_values(Some(&a), Some(&b)), Ordering::Less);
        // Lexical order would say the opposite.
        assert!(a.as_str().unwrap() > b.as_str().unwrap());
    }

    #[test]
    fn test_query_filters_sorts_and_limits() {
        let docs = vec![
            doc(1, json!({ "k": "a", "n": 3 })),
            doc(2, json!({ "k": "b", "n": 1 })),
            doc(3, json!({ "k": "a", "n": 2 })),
            doc(4, json!({ "k": "a", "n": 2 })),
        ];

        let q = Query::collection("c")
            .where_eq("k", "a")
            .order_by("n", Direction::Ascending);
        let ids: Vec<_> = q.apply(docs.clone()).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["d3", "d4", "d1"]);

        let q = Query::collection("c")
            .order_by("n", Direction::Descending)
            .limit(2);
        let ids: Vec<_> = q.apply(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["d1", "d3"]);
    }

    #[test]
    fn test_upload_status_only_moves_forward() {
        use UploadStatus::*;
        assert!(Pending.can_advance_to(Active));
        assert!(Active.can_advance_to(Completed));
        assert!(Active.can_advance_to(Cancelled));
        assert!(!Active.can_advance_to(Pending));
        assert!(!Active.can_advance_to(Active));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Cancelled.can_advance_to(Completed));
        assert!(!Pending.can_advance_to(Completed));
    }

    #[test]
    fn test_server_timestamp_placeholder() {
        assert!(is_server_timestamp(&server_timestamp()));
        assert!(!is_server_timestamp(&json!({ "$serverTimestamp": true, "x": 1 })));
        assert!(!is_server_timestamp(&json!("2024-05-01T12:00:00Z")));
    }
}
