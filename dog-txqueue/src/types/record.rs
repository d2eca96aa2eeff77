use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    headers::standard, ColumnValue, CorrelationId, Headers, LeaseToken, MessageId, Priority, QueueId,
    ReceivedMessage,
};

/// Claim state of a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Queued and claimable once visible
    Waiting,
    /// Claimed by a worker
    Processing,
}

impl MessageStatus {
    /// Integer form persisted by relational backends
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Waiting => 0,
            Self::Processing => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Waiting),
            1 => Some(Self::Processing),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
        }
    }
}

/// Count filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// Every record in the pending set
    Pending,
    Waiting,
    Processing,
    /// Records in the error table
    Error,
}

/// Stored form of a pending message
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub queue_id: QueueId,
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub body: Bytes,
    pub headers: Headers,
    pub priority: Priority,
    pub status: MessageStatus,
    pub queue_process_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
    /// Set while processing; identifies the current claim
    pub lease_token: Option<LeaseToken>,
    pub route: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub additional_columns: BTreeMap<String, ColumnValue>,
}

impl MessageRecord {
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.queue_process_time.map_or(true, |at| at <= now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_time.map_or(false, |at| at <= now)
    }

    /// Claimed, but the worker stopped renewing before `dead_before`
    pub fn heartbeat_stale(&self, dead_before: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Processing
            && self.heartbeat.map_or(true, |beat| beat < dead_before)
    }

    /// Start processing under a fresh lease
    pub fn claim(&mut self, now: DateTime<Utc>) -> LeaseToken {
        let token = LeaseToken::new();
        self.status = MessageStatus::Processing;
        self.heartbeat = Some(now);
        self.lease_token = Some(token.clone());
        token
    }

    /// Processing under exactly this lease
    pub fn held_by(&self, token: &LeaseToken) -> bool {
        self.status == MessageStatus::Processing && self.lease_token.as_ref() == Some(token)
    }

    /// Back to waiting, optionally not visible until `visible_at`
    pub fn release(&mut self, visible_at: Option<DateTime<Utc>>) {
        self.status = MessageStatus::Waiting;
        self.heartbeat = None;
        self.lease_token = None;
        if visible_at.is_some() {
            self.queue_process_time = visible_at;
        }
    }

    pub fn to_received(&self, lease_token: LeaseToken) -> ReceivedMessage {
        ReceivedMessage {
            queue_id: self.queue_id,
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id,
            body: self.body.clone(),
            headers: self.headers.clone(),
            priority: self.priority,
            queue_process_time: self.queue_process_time,
            expiration_time: self.expiration_time,
            heartbeat: self.heartbeat,
            lease_token,
            route: self.route.clone(),
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Why a message is being moved to the error table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    pub exception_type: String,
    pub message: String,
    pub error_count: u64,
}

impl FailureDetails {
    /// Copy of `headers` carrying the exception type and text
    pub fn annotate(&self, headers: Headers) -> Headers {
        annotate_failure(headers, &self.exception_type, &self.message)
    }
}

pub(crate) fn annotate_failure(headers: Headers, exception_type: &str, message: &str) -> Headers {
    headers
        .with(&standard::EXCEPTION_TYPE, exception_type.to_string())
        .with(&standard::EXCEPTION_MESSAGE, message.to_string())
}

/// Quarantined copy of a poisoned message, kept for operator inspection
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub queue_id: QueueId,
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub body: Bytes,
    pub headers: Headers,
    pub exception_type: String,
    pub last_exception: String,
    pub error_count: u64,
    pub failed_at: DateTime<Utc>,
}

/// A claim recovered by the heartbeat monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetOutcome {
    pub queue_id: QueueId,
    pub message_id: MessageId,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueCreationStatus {
    Success,
    AlreadyExists,
    InvalidConfiguration,
    BackendError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCreationResult {
    pub success: bool,
    pub status: QueueCreationStatus,
    pub error_message: Option<String>,
}

impl QueueCreationResult {
    pub fn created() -> Self {
        Self {
            success: true,
            status: QueueCreationStatus::Success,
            error_message: None,
        }
    }

    pub fn already_exists() -> Self {
        Self {
            success: false,
            status: QueueCreationStatus::AlreadyExists,
            error_message: Some("queue already exists".to_string()),
        }
    }

    pub fn failed(status: QueueCreationStatus, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueRemoveStatus {
    Removed,
    DoesNotExist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRemoveResult {
    pub status: QueueRemoveStatus,
}
