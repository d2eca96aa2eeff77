pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{
    types::{
        ErrorRecord, FailureDetails, LeaseToken, MessageEvent, MessageState, MessageStatus, OutboundMessage,
        QueueCreationResult, QueueId, QueueRemoveResult, ReceiveRequest, ReceivedMessage,
        ResetOutcome, SendResult, TransportOptions,
    },
    QueueResult,
};

pub use memory::MemoryTransport;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTransport;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Storage primitives for one queue.
///
/// Every backend enforces the same claim rule: a message is claimable when it
/// is waiting (or processing with a stale heartbeat, when heartbeat is on),
/// visible (delay elapsed), not expired, and matches the route filter. At most
/// one concurrent `receive` wins any given record.
///
/// Each claim carries a fresh [`LeaseToken`]. Operations on a claimed message
/// only act while the record is processing under that same token; a mismatch
/// is reported as `false` or `None`, never as an error.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn options(&self) -> &TransportOptions;

    /// Create the backing storage; an existing queue is reported, not an error
    async fn create_queue(&self) -> QueueResult<QueueCreationResult>;

    async fn remove_queue(&self) -> QueueResult<QueueRemoveResult>;

    async fn queue_exists(&self) -> QueueResult<bool>;

    async fn send(&self, message: OutboundMessage) -> QueueResult<SendResult>;

    /// Insert several messages; stops at the first failure
    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> QueueResult<Vec<SendResult>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.send(message).await?);
        }
        Ok(results)
    }

    /// Atomically claim the next eligible message, or the one named by the request
    async fn receive(&self, request: &ReceiveRequest) -> QueueResult<Option<ReceivedMessage>>;

    /// Remove a claimed message and its status row. Error tracking rows are kept.
    async fn delete(&self, queue_id: QueueId, lease_token: &LeaseToken) -> QueueResult<bool>;

    async fn update_status(&self, queue_id: QueueId, status: MessageStatus) -> QueueResult<bool>;

    /// Return a claimed message to waiting, optionally delaying its next visibility
    async fn rollback(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        delay: Option<Duration>,
    ) -> QueueResult<bool>;

    /// Renew the claim. `None` means the lease is no longer held.
    async fn send_heartbeat(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
    ) -> QueueResult<Option<DateTime<Utc>>>;

    async fn get_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64>;

    /// Add one failure and return the new count
    async fn increment_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64>;

    /// Sum of every tracked failure in the queue
    async fn total_error_count(&self) -> QueueResult<u64>;

    /// Drop tracking rows for a message; returns how many were removed
    async fn purge_error_tracking(&self, queue_id: QueueId) -> QueueResult<u64>;

    /// Copy the message into the error table and delete it from the pending set
    async fn move_to_error(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        details: &FailureDetails,
    ) -> QueueResult<bool>;

    async fn error_records(&self) -> QueueResult<Vec<ErrorRecord>>;

    /// Delete waiting messages past their expiration time
    async fn clear_expired_messages(&self, cancel: &CancellationToken) -> QueueResult<u64>;

    /// Release processing messages whose heartbeat is older than the monitor time
    async fn reset_heartbeats(&self, cancel: &CancellationToken) -> QueueResult<Vec<ResetOutcome>>;

    async fn count(&self, state: MessageState) -> QueueResult<u64>;

    /// Lifecycle events for observability (boxed for stable Rust)
    fn event_stream(&self) -> BoxStream<MessageEvent>;
}

/// Earliest instant a message may be considered dead
pub(crate) fn dead_threshold(options: &TransportOptions, now: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(options.heartbeat.monitor_time)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Check user column values against the status-table definitions
pub(crate) fn check_columns(
    options: &TransportOptions,
    values: &std::collections::BTreeMap<String, crate::types::ColumnValue>,
) -> Result<(), String> {
    use crate::types::ColumnValue;

    if !options.enable_status_table {
        return Ok(());
    }
    for name in values.keys() {
        if !options.additional_columns.iter().any(|c| &c.name == name) {
            return Err(format!("unknown status column '{name}'"));
        }
    }
    for column in &options.additional_columns {
        let missing = matches!(values.get(&column.name), None | Some(ColumnValue::Null));
        if missing && !column.nullable {
            return Err(format!("status column '{}' requires a value", column.name));
        }
    }
    Ok(())
}

/// `at + delay`, saturating at the latest representable instant
pub(crate) fn shift(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
