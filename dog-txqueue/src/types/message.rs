use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{headers::standard, CorrelationId, Headers, LeaseToken, MessageId, Priority, QueueId};
use crate::{QueueError, QueueResult};

/// Value for a user-defined status-table column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Per-message send settings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub priority: Option<Priority>,
    /// Message becomes claimable only after this delay
    pub delay: Option<Duration>,
    /// Message is dropped if not claimed within this window
    pub expiration: Option<Duration>,
    pub route: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    /// Overrides the generated message id
    pub message_id: Option<MessageId>,
    pub additional_columns: BTreeMap<String, ColumnValue>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_column(mut self, name: impl Into<String>, value: ColumnValue) -> Self {
        self.additional_columns.insert(name.into(), value);
        self
    }
}

/// Message as handed to a transport for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub headers: Headers,
    pub options: SendOptions,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
            options: SendOptions::default(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    /// The route wins from options, then from the route header
    pub fn route(&self) -> Option<String> {
        self.options
            .route
            .clone()
            .or_else(|| self.headers.get(&standard::ROUTE))
    }
}

/// Identity of a freshly inserted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub queue_id: QueueId,
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
}

/// Selection criteria for a claim
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Only claim messages carrying one of these routes; empty means any
    pub routes: Vec<String>,
    /// Claim exactly this message if it is still pending
    pub message_id: Option<MessageId>,
}

impl ReceiveRequest {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_routes<I, S>(routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            routes: routes.into_iter().map(Into::into).collect(),
            message_id: None,
        }
    }

    pub fn specific(message_id: MessageId) -> Self {
        Self {
            routes: Vec::new(),
            message_id: Some(message_id),
        }
    }
}

/// A claimed message
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub queue_id: QueueId,
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub body: Bytes,
    pub headers: Headers,
    pub priority: Priority,
    pub queue_process_time: Option<DateTime<Utc>>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
    /// Required to renew, commit or roll back this claim
    pub lease_token: LeaseToken,
    pub route: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl ReceivedMessage {
    /// Decode a JSON body
    pub fn decode<T: DeserializeOwned>(&self) -> QueueResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}
