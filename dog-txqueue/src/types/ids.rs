use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Backend-assigned row identity. Monotonic per queue and immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueId(pub i64);

impl QueueId {
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for QueueId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Opaque message identifier assigned at send time.
///
/// `has_value` separates "never assigned" from a real value, so an empty
/// string supplied by a caller is still a valid id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageId(Option<String>);

impl MessageId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        Self(Some(Uuid::new_v4().to_string()))
    }

    /// An id with no value; commit and rollback skip these
    pub fn unset() -> Self {
        Self(None)
    }

    pub fn has_value(&self) -> bool {
        self.0.is_some()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => write!(f, "{id}"),
            None => write!(f, "<unset>"),
        }
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(Some(id))
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(Some(id.to_string()))
    }
}

impl From<&CorrelationId> for MessageId {
    /// RPC responses are stored under the request's correlation id
    fn from(id: &CorrelationId) -> Self {
        match id.value() {
            Some(uuid) => Self(Some(uuid.to_string())),
            None => Self::unset(),
        }
    }
}

/// Identifier used to match RPC responses to their requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CorrelationId(Option<Uuid>);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Some(Uuid::new_v4()))
    }

    pub fn unset() -> Self {
        Self(None)
    }

    pub fn has_value(&self) -> bool {
        self.0.is_some()
    }

    pub fn value(&self) -> Option<Uuid> {
        self.0
    }

    /// Parse the stored text form; empty or malformed text yields an unset id
    pub fn parse(text: &str) -> Self {
        Self(Uuid::parse_str(text).ok())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(id) => write!(f, "{id}"),
            None => write!(f, "<unset>"),
        }
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        Self(Some(id))
    }
}

/// Proof of a single claim. A fresh token is stamped on every claim, so a
/// worker whose lease was recovered and handed to someone else can no longer
/// renew, commit or roll back the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for LeaseToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<&str> for LeaseToken {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}
