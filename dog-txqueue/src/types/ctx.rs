use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{headers::standard, CorrelationId, Headers, LeaseToken, MessageId, QueueId, ReceivedMessage};

/// Per-message processing context handed to handlers, commit and rollback
#[derive(Debug, Clone)]
pub struct MessageContext {
    queue_id: QueueId,
    message_id: MessageId,
    correlation_id: CorrelationId,
    lease_token: LeaseToken,

    /// Working copy of the message headers; rollback reads the delay hint here
    headers: Headers,

    /// Cancelled on worker shutdown or when the lease is lost
    cancel: CancellationToken,

    lease_lost: Arc<AtomicBool>,

    /// Optional trace ID for distributed tracing
    pub trace_id: Option<String>,

    /// Additional tags for observability and filtering
    pub tags: HashMap<String, String>,
}

impl MessageContext {
    pub fn new(message: &ReceivedMessage, cancel: CancellationToken) -> Self {
        Self {
            queue_id: message.queue_id,
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id,
            lease_token: message.lease_token.clone(),
            trace_id: message.headers.get(&standard::TRACE_ID),
            headers: message.headers.clone(),
            cancel,
            lease_lost: Arc::new(AtomicBool::new(false)),
            tags: HashMap::new(),
        }
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn lease_token(&self) -> &LeaseToken {
        &self.lease_token
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Delay to add to the process time if this message is rolled back
    pub fn increase_delay(&self) -> Option<Duration> {
        self.headers
            .get(&standard::INCREASE_QUEUE_DELAY_MS)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn set_increase_delay(&mut self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.headers.set(&standard::INCREASE_QUEUE_DELAY_MS, millis);
    }

    /// Another worker may own the message now; stop and do not commit
    pub fn mark_lease_lost(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn lease_lost(&self) -> bool {
        self.lease_lost.load(Ordering::SeqCst)
    }

    pub fn with_tag(mut self, key: String, value: String) -> Self {
        self.tags.insert(key, value);
        self
    }
}
