use serde::{Deserialize, Serialize};

use crate::constants::{RESPONDER_ROLE_TAG, USER_ROLE_TAG};

// Authentication uid, opaque to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The authenticated principal as reported by the auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub uid: UserId,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Responder,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => USER_ROLE_TAG,
            Self::Responder => RESPONDER_ROLE_TAG,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved identity plus role, stamped with the sign-in generation that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub role: Role,
    pub generation: u64,
}

impl Session {
    pub fn uid(&self) -> &UserId {
        &self.identity.uid
    }

    pub fn is_responder(&self) -> bool {
        self.role == Role::Responder
    }
}

/// A single position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl std::str::FromStr for Position {
    type Err = String;

    /// Parses `"lat,long"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (lat, long) = s
            .split_once(',')
            .ok_or_else(|| format!("expected \"lat,long\", got {s:?}"))?;
        let latitude: f64 = lat
            .trim()
            .parse()
            .map_err(|e| format!("invalid latitude: {e}"))?;
        let longitude: f64 = long
            .trim()
            .parse()
            .map_err(|e| format!("invalid longitude: {e}"))?;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(format!("position out of range: {latitude},{longitude}"));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde_tags() {
        assert_eq!(serde_json::to_value(Role::Responder).unwrap(), "responder");
        let role: Role = serde_json::from_value(serde_json::json!("user")).unwrap();
        assert_eq!(role, Role::User);
    }

    #[test]
    fn test_parse_position() {
        let pos: Position = "48.85, 2.35".parse().unwrap();
        assert_eq!(pos.latitude, 48.85);
        assert_eq!(pos.longitude, 2.35);
        assert!("91,0".parse::<Position>().is_err());
        assert!("nonsense".parse::<Position>().is_err());
    }

    #[test]
    fn test_short_uid() {
        assert_eq!(UserId::from("abc").short(), "abc");
        assert_eq!(UserId::from("0123456789").short(), "01234567");
    }
}
