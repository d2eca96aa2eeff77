use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    backend::{check_columns, dead_threshold, shift, BoxStream, TransportAdapter},
    types::{
        CorrelationId, ErrorRecord, FailureDetails, LeaseToken, MessageEvent, MessageId, MessageRecord,
        MessageState, MessageStatus, OutboundMessage, Priority, QueueCreationResult,
        QueueCreationStatus, QueueId, QueueRemoveResult, QueueRemoveStatus, ReceiveRequest,
        ReceivedMessage, ResetOutcome, SendResult, TransportOptions,
    },
    QueueError, QueueResult,
};

/// Tables of one created queue
#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// Pending set in insertion order
    pub(crate) messages: BTreeMap<QueueId, MessageRecord>,

    /// Failure counts keyed by (message, exception type)
    pub(crate) error_tracking: BTreeMap<(QueueId, String), u64>,

    /// Poisoned messages
    pub(crate) errors: BTreeMap<QueueId, ErrorRecord>,
}

/// In-process backend for testing and development.
///
/// Every operation runs under one write lock, which is what makes a claim
/// atomic: the eligible record is selected and marked processing before any
/// other caller can observe it.
pub struct MemoryTransport {
    options: TransportOptions,

    /// `None` until `create_queue`
    pub(crate) state: Arc<RwLock<Option<QueueState>>>,

    next_id: AtomicI64,

    /// Event broadcaster for observability
    event_broadcaster: broadcast::Sender<MessageEvent>,
}

impl MemoryTransport {
    pub fn new(options: TransportOptions) -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);

        Self {
            options,
            state: Arc::new(RwLock::new(None)),
            next_id: AtomicI64::new(0),
            event_broadcaster,
        }
    }

    /// Snapshot of a pending record, for inspection
    pub fn record(&self, queue_id: QueueId) -> Option<MessageRecord> {
        self.state
            .read()
            .as_ref()
            .and_then(|state| state.messages.get(&queue_id).cloned())
    }

    fn write<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> QueueResult<R> {
        let mut guard = self.state.write();
        let state = guard
            .as_mut()
            .ok_or_else(|| QueueError::QueueNotFound(self.options.queue_name.clone()))?;
        Ok(f(state))
    }

    fn read<R>(&self, f: impl FnOnce(&QueueState) -> R) -> QueueResult<R> {
        let guard = self.state.read();
        let state = guard
            .as_ref()
            .ok_or_else(|| QueueError::QueueNotFound(self.options.queue_name.clone()))?;
        Ok(f(state))
    }

    fn emit(&self, event: MessageEvent) {
        let _ = self.event_broadcaster.send(event);
    }

    /// Claim rule shared by ordered and specific receives
    fn claimable(
        &self,
        record: &MessageRecord,
        now: DateTime<Utc>,
        dead_before: DateTime<Utc>,
        honour_delay: bool,
    ) -> bool {
        let free = record.status == MessageStatus::Waiting
            || (self.options.enable_heartbeat && record.heartbeat_stale(dead_before));
        let visible =
            !honour_delay || !self.options.enable_delayed_processing || record.is_visible(now);
        let live = !self.options.enable_message_expiration || !record.is_expired(now);
        free && visible && live
    }

    fn route_matches(&self, record: &MessageRecord, routes: &[String]) -> bool {
        if !self.options.enable_route || routes.is_empty() {
            return true;
        }
        record
            .route
            .as_ref()
            .map_or(false, |route| routes.iter().any(|r| r == route))
    }

    fn order_key(&self, record: &MessageRecord) -> (u8, QueueId) {
        let priority = if self.options.enable_priority {
            record.priority.value()
        } else {
            0
        };
        (priority, record.queue_id)
    }

    fn build_record(&self, message: OutboundMessage, now: DateTime<Utc>) -> QueueResult<MessageRecord> {
        let route = if self.options.enable_route {
            message.route()
        } else {
            None
        };
        let options = message.options;

        if let Err(reason) = check_columns(&self.options, &options.additional_columns) {
            return Err(QueueError::Send {
                correlation_id: options
                    .correlation_id
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                reason,
            });
        }

        let queue_id = QueueId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let queue_process_time = self
            .options
            .enable_delayed_processing
            .then(|| shift(now, options.delay.unwrap_or_default()));
        let expiration_time = if self.options.enable_message_expiration {
            options.expiration.map(|window| shift(now, window))
        } else {
            None
        };
        let priority = if self.options.enable_priority {
            options.priority.unwrap_or_default()
        } else {
            Priority::default()
        };
        let additional_columns = if self.options.enable_status_table {
            options.additional_columns
        } else {
            BTreeMap::new()
        };

        Ok(MessageRecord {
            queue_id,
            message_id: options
                .message_id
                .filter(MessageId::has_value)
                .unwrap_or_else(MessageId::new),
            correlation_id: options.correlation_id.unwrap_or_else(CorrelationId::new),
            body: message.body,
            headers: message.headers,
            priority,
            status: MessageStatus::Waiting,
            queue_process_time,
            expiration_time,
            heartbeat: None,
            lease_token: None,
            route,
            enqueued_at: now,
            additional_columns,
        })
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    fn options(&self) -> &TransportOptions {
        &self.options
    }

    async fn create_queue(&self) -> QueueResult<QueueCreationResult> {
        let validation = self.options.validate();
        if !validation.valid {
            return Ok(QueueCreationResult::failed(
                QueueCreationStatus::InvalidConfiguration,
                validation.error_message.unwrap_or_default(),
            ));
        }

        let mut guard = self.state.write();
        if guard.is_some() {
            return Ok(QueueCreationResult::already_exists());
        }
        *guard = Some(QueueState::default());
        Ok(QueueCreationResult::created())
    }

    async fn remove_queue(&self) -> QueueResult<QueueRemoveResult> {
        let status = match self.state.write().take() {
            Some(_) => QueueRemoveStatus::Removed,
            None => QueueRemoveStatus::DoesNotExist,
        };
        Ok(QueueRemoveResult { status })
    }

    async fn queue_exists(&self) -> QueueResult<bool> {
        Ok(self.state.read().is_some())
    }

    async fn send(&self, message: OutboundMessage) -> QueueResult<SendResult> {
        let now = Utc::now();
        let record = self.build_record(message, now)?;
        let result = SendResult {
            queue_id: record.queue_id,
            message_id: record.message_id.clone(),
            correlation_id: record.correlation_id,
        };

        self.write(|state| state.messages.insert(record.queue_id, record))?;

        self.emit(MessageEvent::Sent {
            queue_id: result.queue_id,
            message_id: result.message_id.clone(),
            queue: self.options.queue_name.clone(),
            at: now,
        });
        Ok(result)
    }

    async fn receive(&self, request: &ReceiveRequest) -> QueueResult<Option<ReceivedMessage>> {
        let now = Utc::now();
        let dead_before = dead_threshold(&self.options, now);

        let claimed = self.write(|state| {
            let selected = match &request.message_id {
                Some(message_id) => state
                    .messages
                    .values()
                    .find(|r| &r.message_id == message_id && self.claimable(r, now, dead_before, false))
                    .map(|r| r.queue_id),
                None => state
                    .messages
                    .values()
                    .filter(|r| {
                        self.claimable(r, now, dead_before, true)
                            && self.route_matches(r, &request.routes)
                    })
                    .min_by_key(|r| self.order_key(r))
                    .map(|r| r.queue_id),
            }?;

            if self.options.destructive_receive() {
                return state
                    .messages
                    .remove(&selected)
                    .map(|r| r.to_received(LeaseToken::new()));
            }

            let record = state.messages.get_mut(&selected)?;
            let lease_token = record.claim(now);
            Some(record.to_received(lease_token))
        })?;

        if let Some(message) = &claimed {
            debug!(queue_id = %message.queue_id, "claimed message");
            self.emit(MessageEvent::Claimed {
                queue_id: message.queue_id,
                message_id: message.message_id.clone(),
                at: now,
            });
        }
        Ok(claimed)
    }

    async fn delete(&self, queue_id: QueueId, lease_token: &LeaseToken) -> QueueResult<bool> {
        let removed = self.write(|state| {
            let held = state
                .messages
                .get(&queue_id)
                .map_or(false, |r| r.held_by(lease_token));
            held && state.messages.remove(&queue_id).is_some()
        })?;
        if removed {
            self.emit(MessageEvent::Committed {
                queue_id,
                at: Utc::now(),
            });
        }
        Ok(removed)
    }

    async fn update_status(&self, queue_id: QueueId, status: MessageStatus) -> QueueResult<bool> {
        self.write(|state| match state.messages.get_mut(&queue_id) {
            Some(record) => {
                record.status = status;
                true
            }
            None => false,
        })
    }

    async fn rollback(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        delay: Option<Duration>,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        let visible_at = if self.options.enable_delayed_processing {
            delay.map(|delay| shift(now, delay))
        } else {
            None
        };

        let released = self.write(|state| match state.messages.get_mut(&queue_id) {
            Some(record) if record.held_by(lease_token) => {
                record.release(visible_at);
                true
            }
            _ => false,
        })?;

        if released {
            self.emit(MessageEvent::RolledBack {
                queue_id,
                visible_at,
                at: now,
            });
        }
        Ok(released)
    }

    async fn send_heartbeat(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
    ) -> QueueResult<Option<DateTime<Utc>>> {
        let now = Utc::now();
        self.write(|state| match state.messages.get_mut(&queue_id) {
            Some(record) if record.held_by(lease_token) => {
                record.heartbeat = Some(now);
                Some(now)
            }
            _ => None,
        })
    }

    async fn get_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64> {
        self.read(|state| {
            state
                .error_tracking
                .get(&(queue_id, exception_type.to_string()))
                .copied()
                .unwrap_or(0)
        })
    }

    async fn increment_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64> {
        self.write(|state| {
            let count = state
                .error_tracking
                .entry((queue_id, exception_type.to_string()))
                .or_insert(0);
            *count += 1;
            *count
        })
    }

    async fn total_error_count(&self) -> QueueResult<u64> {
        self.read(|state| state.error_tracking.values().sum())
    }

    async fn purge_error_tracking(&self, queue_id: QueueId) -> QueueResult<u64> {
        self.write(|state| {
            let before = state.error_tracking.len();
            state.error_tracking.retain(|(id, _), _| *id != queue_id);
            (before - state.error_tracking.len()) as u64
        })
    }

    async fn move_to_error(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        details: &FailureDetails,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        let moved = self.write(|state| {
            if !state.messages.get(&queue_id).map_or(false, |r| r.held_by(lease_token)) {
                return false;
            }
            let Some(record) = state.messages.remove(&queue_id) else {
                return false;
            };
            state.errors.insert(
                queue_id,
                ErrorRecord {
                    queue_id,
                    message_id: record.message_id,
                    correlation_id: record.correlation_id,
                    body: record.body,
                    headers: details.annotate(record.headers),
                    exception_type: details.exception_type.clone(),
                    last_exception: details.message.clone(),
                    error_count: details.error_count,
                    failed_at: now,
                },
            );
            true
        })?;

        if moved {
            self.emit(MessageEvent::Poisoned {
                queue_id,
                exception_type: details.exception_type.clone(),
                at: now,
            });
        }
        Ok(moved)
    }

    async fn error_records(&self) -> QueueResult<Vec<ErrorRecord>> {
        self.read(|state| state.errors.values().cloned().collect())
    }

    async fn clear_expired_messages(&self, cancel: &CancellationToken) -> QueueResult<u64> {
        if !self.options.enable_message_expiration {
            return Ok(0);
        }

        let batch_size = self.options.expiration_batch_size.max(1) as usize;
        let mut total = 0u64;

        while !cancel.is_cancelled() {
            let now = Utc::now();
            let removed = self.write(|state| {
                let expired: Vec<QueueId> = state
                    .messages
                    .values()
                    .filter(|r| r.status == MessageStatus::Waiting && r.is_expired(now))
                    .map(|r| r.queue_id)
                    .take(batch_size)
                    .collect();
                for queue_id in &expired {
                    state.messages.remove(queue_id);
                }
                expired
            })?;

            for queue_id in &removed {
                self.emit(MessageEvent::Expired {
                    queue_id: *queue_id,
                    at: now,
                });
            }
            total += removed.len() as u64;
            if removed.len() < batch_size {
                break;
            }
        }
        Ok(total)
    }

    async fn reset_heartbeats(&self, cancel: &CancellationToken) -> QueueResult<Vec<ResetOutcome>> {
        if !self.options.enable_heartbeat || cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let dead_before = dead_threshold(&self.options, now);
        let visible_at = self
            .options
            .heartbeat
            .reset_delay
            .filter(|_| self.options.enable_delayed_processing)
            .map(|delay| shift(now, delay));

        let reset = self.write(|state| {
            state
                .messages
                .values_mut()
                .filter(|r| r.heartbeat_stale(dead_before))
                .map(|record| {
                    record.release(visible_at);
                    ResetOutcome {
                        queue_id: record.queue_id,
                        message_id: record.message_id.clone(),
                        reset_at: now,
                    }
                })
                .collect::<Vec<_>>()
        })?;

        for outcome in &reset {
            self.emit(MessageEvent::HeartbeatReset {
                queue_id: outcome.queue_id,
                at: now,
            });
        }
        Ok(reset)
    }

    async fn count(&self, state: MessageState) -> QueueResult<u64> {
        self.read(|tables| {
            let by_status = |status: MessageStatus| {
                tables
                    .messages
                    .values()
                    .filter(|r| r.status == status)
                    .count() as u64
            };
            match state {
                MessageState::Pending => tables.messages.len() as u64,
                MessageState::Waiting => by_status(MessageStatus::Waiting),
                MessageState::Processing => by_status(MessageStatus::Processing),
                MessageState::Error => tables.errors.len() as u64,
            }
        })
    }

    fn event_stream(&self) -> BoxStream<MessageEvent> {
        let receiver = self.event_broadcaster.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnDefinition, ColumnType, ColumnValue, SendOptions};

    async fn create_test_transport(options: TransportOptions) -> MemoryTransport {
        let transport = MemoryTransport::new(options);
        assert!(transport.create_queue().await.unwrap().success);
        transport
    }

    #[tokio::test]
    async fn test_queue_must_exist() {
        let transport = MemoryTransport::new(TransportOptions::new("jobs"));
        let result = transport.send(OutboundMessage::new("x")).await;
        assert!(matches!(result, Err(QueueError::QueueNotFound(_))));

        assert!(transport.create_queue().await.unwrap().success);
        let again = transport.create_queue().await.unwrap();
        assert_eq!(again.status, QueueCreationStatus::AlreadyExists);
    }

    #[tokio::test]
    async fn test_invalid_options_not_created() {
        let options = TransportOptions {
            enable_hold_transaction_until_committed: true,
            ..TransportOptions::new("jobs")
        };
        let transport = MemoryTransport::new(options);
        let result = transport.create_queue().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.status, QueueCreationStatus::InvalidConfiguration);
        assert!(!transport.queue_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_marks_processing() {
        let transport = create_test_transport(TransportOptions::new("jobs")).await;
        let sent = transport.send(OutboundMessage::new("payload")).await.unwrap();

        let claimed = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();
        assert_eq!(claimed.queue_id, sent.queue_id);
        assert!(claimed.heartbeat.is_some());

        let record = transport.record(sent.queue_id).unwrap();
        assert_eq!(record.status, MessageStatus::Processing);
        assert!(transport.receive(&ReceiveRequest::any()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destructive_receive_deletes() {
        let transport = create_test_transport(TransportOptions::fifo("jobs")).await;
        transport.send(OutboundMessage::new("a")).await.unwrap();

        assert!(transport.receive(&ReceiveRequest::any()).await.unwrap().is_some());
        assert_eq!(transport.count(MessageState::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_route_filter() {
        let transport = create_test_transport(TransportOptions::full("jobs")).await;
        transport
            .send(OutboundMessage::new("eu").with_options(SendOptions::new().with_route("eu")))
            .await
            .unwrap();
        transport
            .send(OutboundMessage::new("us").with_options(SendOptions::new().with_route("us")))
            .await
            .unwrap();

        let claimed = transport
            .receive(&ReceiveRequest::for_routes(["us"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.route.as_deref(), Some("us"));
        assert!(transport
            .receive(&ReceiveRequest::for_routes(["us"]))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_specific_receive_ignores_delay() {
        let transport = create_test_transport(TransportOptions::new("jobs")).await;
        let sent = transport
            .send(OutboundMessage::new("later").with_options(SendOptions::new().with_delay(Duration::from_secs(60))))
            .await
            .unwrap();

        assert!(transport.receive(&ReceiveRequest::any()).await.unwrap().is_none());
        let claimed = transport
            .receive(&ReceiveRequest::specific(sent.message_id.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_rollback_requires_processing() {
        let transport = create_test_transport(TransportOptions::new("jobs")).await;
        let sent = transport.send(OutboundMessage::new("x")).await.unwrap();

        let token = LeaseToken::new();
        assert!(!transport.rollback(sent.queue_id, &token, None).await.unwrap());
        let claimed = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();
        assert!(!transport.rollback(sent.queue_id, &token, None).await.unwrap());
        assert!(transport
            .rollback(sent.queue_id, &claimed.lease_token, None)
            .await
            .unwrap());

        let record = transport.record(sent.queue_id).unwrap();
        assert_eq!(record.status, MessageStatus::Waiting);
        assert_eq!(record.heartbeat, None);
    }

    #[tokio::test]
    async fn test_error_tracking_survives_delete() {
        let transport = create_test_transport(TransportOptions::new("jobs")).await;
        let sent = transport.send(OutboundMessage::new("x")).await.unwrap();
        let claimed = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();

        assert_eq!(transport.increment_error_count(sent.queue_id, "IoError").await.unwrap(), 1);
        assert_eq!(transport.increment_error_count(sent.queue_id, "IoError").await.unwrap(), 2);
        assert_eq!(transport.increment_error_count(sent.queue_id, "Timeout").await.unwrap(), 1);
        assert!(transport.delete(sent.queue_id, &claimed.lease_token).await.unwrap());

        assert_eq!(transport.get_error_count(sent.queue_id, "IoError").await.unwrap(), 2);
        assert_eq!(transport.total_error_count().await.unwrap(), 3);
        assert_eq!(transport.purge_error_tracking(sent.queue_id).await.unwrap(), 2);
        assert_eq!(transport.total_error_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_move_to_error() {
        let transport = create_test_transport(TransportOptions::new("jobs")).await;
        let sent = transport.send(OutboundMessage::new("bad")).await.unwrap();
        let claimed = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();

        let details = FailureDetails {
            exception_type: "FormatError".to_string(),
            message: "unparseable".to_string(),
            error_count: 1,
        };
        assert!(!transport
            .move_to_error(sent.queue_id, &LeaseToken::from("stale"), &details)
            .await
            .unwrap());
        assert!(transport
            .move_to_error(sent.queue_id, &claimed.lease_token, &details)
            .await
            .unwrap());
        assert!(!transport
            .move_to_error(sent.queue_id, &claimed.lease_token, &details)
            .await
            .unwrap());

        assert_eq!(transport.count(MessageState::Pending).await.unwrap(), 0);
        let errors = transport.error_records().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].exception_type, "FormatError");
        assert_eq!(errors[0].body.as_ref(), b"bad");
    }

    #[tokio::test]
    async fn test_unknown_status_column_rejected() {
        let mut options = TransportOptions::full("jobs");
        options
            .additional_columns
            .push(ColumnDefinition::new("tenant", ColumnType::Text));
        let transport = create_test_transport(options).await;

        let ok = transport
            .send(OutboundMessage::new("x").with_options(
                SendOptions::new().with_column("tenant", ColumnValue::Text("acme".into())),
            ))
            .await
            .unwrap();
        let record = transport.record(ok.queue_id).unwrap();
        assert_eq!(
            record.additional_columns.get("tenant"),
            Some(&ColumnValue::Text("acme".into()))
        );

        let bad = transport
            .send(OutboundMessage::new("x").with_options(
                SendOptions::new().with_column("region", ColumnValue::Text("eu".into())),
            ))
            .await;
        assert!(matches!(bad, Err(QueueError::Send { .. })));
    }

    #[tokio::test]
    async fn test_unset_message_id_replaced() {
        let transport = create_test_transport(TransportOptions::new("jobs")).await;
        let sent = transport
            .send(OutboundMessage::new("x").with_options(SendOptions::new().with_message_id(MessageId::unset())))
            .await
            .unwrap();
        assert!(sent.message_id.has_value());

        let claimed = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();
        assert_eq!(claimed.message_id, sent.message_id);
        assert!(transport.delete(claimed.queue_id, &claimed.lease_token).await.unwrap());
        assert_eq!(transport.count(MessageState::Pending).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_expiration_batch_still_sweeps() {
        let options = TransportOptions {
            expiration_batch_size: 0,
            ..TransportOptions::new("jobs")
        };
        let transport = MemoryTransport::new(options);
        *transport.state.write() = Some(QueueState::default());
        transport
            .send(OutboundMessage::new("a").with_options(SendOptions::new().with_expiration(Duration::from_millis(1))))
            .await
            .unwrap();
        transport
            .send(OutboundMessage::new("b").with_options(SendOptions::new().with_expiration(Duration::from_millis(1))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let swept = tokio::time::timeout(
            Duration::from_secs(5),
            transport.clear_expired_messages(&CancellationToken::new()),
        )
        .await
        .expect("sweep did not terminate")
        .unwrap();
        assert_eq!(swept, 2);
    }

    #[tokio::test]
    async fn test_remove_queue() {
        let transport = create_test_transport(TransportOptions::new("jobs")).await;
        assert_eq!(
            transport.remove_queue().await.unwrap().status,
            QueueRemoveStatus::Removed
        );
        assert_eq!(
            transport.remove_queue().await.unwrap().status,
            QueueRemoveStatus::DoesNotExist
        );
    }
}
