use std::{
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Deserializer,
    Serialize,
};
use uuid::{
    Uuid,
    Version,
};

/// Longest participant id we accept. Ids are opaque to the server, so the cap
/// exists only to bound storage and log line size.
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidSessionId {
    #[error("session id is not a valid UUID: {0}")]
    NotAUuid(String),
    #[error("session id must be a version 4 UUID: {0}")]
    NotV4(Uuid),
}

/// Primary key of a session. Always a UUIDv4; other UUID versions are
/// rejected everywhere one can enter — `FromStr` for path parameters and
/// `Deserialize` for request bodies — so keys stay uniformly distributed
/// and no unreachable session can be created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    fn require_v4(uuid: Uuid) -> Result<Self, InvalidSessionId> {
        if uuid.get_version() != Some(Version::Random) {
            return Err(InvalidSessionId::NotV4(uuid));
        }
        Ok(Self(uuid))
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|_| InvalidSessionId::NotAUuid(s.to_owned()))?;
        Self::require_v4(uuid)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let uuid = Uuid::deserialize(deserializer)?;
        Self::require_v4(uuid).map_err(serde::de::Error::custom)
    }
}

impl From<SessionId> for Uuid {
    fn from(id: SessionId) -> Uuid {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidParticipantId {
    #[error("participant id must be non-empty")]
    Empty,
    #[error("participant id exceeds {MAX_PARTICIPANT_ID_LEN} bytes")]
    TooLong,
}

/// Identifier of a participant within a session. A UUID in most deployments,
/// but callers may supply any opaque string up to
/// [`MAX_PARTICIPANT_ID_LEN`] bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidParticipantId> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidParticipantId::Empty);
        }
        if id.len() > MAX_PARTICIPANT_ID_LEN {
            return Err(InvalidParticipantId::TooLong);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ParticipantId {
    type Err = InvalidParticipantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_rejects_non_v4() {
        // v1 UUID (version nibble is 1).
        let err = "c232ab00-9414-11ec-b3c8-9f6bdeced846"
            .parse::<SessionId>()
            .unwrap_err();
        assert!(matches!(err, InvalidSessionId::NotV4(_)));

        assert!("not-a-uuid".parse::<SessionId>().is_err());
        assert!("11111111-1111-4111-8111-111111111111"
            .parse::<SessionId>()
            .is_ok());
    }

    #[test]
    fn participant_id_bounds() {
        assert_eq!(
            ParticipantId::new("").unwrap_err(),
            InvalidParticipantId::Empty
        );
        assert_eq!(
            ParticipantId::new("x".repeat(MAX_PARTICIPANT_ID_LEN + 1)).unwrap_err(),
            InvalidParticipantId::TooLong
        );
        assert!(ParticipantId::new("x".repeat(MAX_PARTICIPANT_ID_LEN)).is_ok());
    }

    #[test]
    fn participant_id_deserialization_validates() {
        assert!(serde_json::from_str::<ParticipantId>("\"\"").is_err());
        let id: ParticipantId = serde_json::from_str("\"player-1\"").unwrap();
        assert_eq!(id.as_str(), "player-1");
    }

    #[test]
    fn session_id_deserialization_rejects_non_v4() {
        // Both entry points agree: a non-v4 id cannot come in through a
        // request body any more than through a path parameter.
        let err = serde_json::from_str::<SessionId>("\"c232ab00-9414-11ec-b3c8-9f6bdeced846\"")
            .unwrap_err();
        assert!(err.to_string().contains("version 4"), "{err}");
        assert!(serde_json::from_str::<SessionId>("\"not-a-uuid\"").is_err());

        let id: SessionId =
            serde_json::from_str("\"11111111-1111-4111-8111-111111111111\"").unwrap();
        assert_eq!(id.to_string(), "11111111-1111-4111-8111-111111111111");
    }
}
