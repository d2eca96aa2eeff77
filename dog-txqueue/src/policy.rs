//! Bounded retry of transient storage errors.
//!
//! [`RetryingTransport`] wraps any backend and re-runs an operation that
//! failed with [`QueueError::Transient`], sleeping an exponential backoff
//! between tries. Every other error is returned on the first failure.
//!
//! For chaos testing a [`FaultInjector`] can fail calls with an injected
//! transient error before they reach the backend. The injection sequence is
//! seeded, so a failing run can be replayed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    backend::{BoxStream, TransportAdapter},
    config::{FaultInjectionConfig, QueueConfig, RetryPolicyConfig},
    observability::QueueMetrics,
    types::{
        ErrorRecord, FailureDetails, LeaseToken, MessageEvent, MessageState, MessageStatus, OutboundMessage,
        QueueCreationResult, QueueId, QueueRemoveResult, ReceiveRequest, ReceivedMessage,
        ResetOutcome, SendResult, TransportOptions,
    },
    QueueError, QueueResult,
};

/// Exponential backoff with optional jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Wait before retry number `retry` (0 for the first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        let backoff = self
            .config
            .base_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff);
        if self.config.jitter {
            backoff.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            backoff
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. `on_retry` runs before every retry.
    pub async fn run<R, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
        mut on_retry: impl FnMut() + Send,
    ) -> QueueResult<R>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = QueueResult<R>> + Send,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.max_attempts() => {
                    let wait = self.backoff(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts(),
                        ?wait,
                        error = %err,
                        "transient failure; retrying"
                    );
                    on_retry();
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryPolicyConfig::default())
    }
}

/// Fails a seeded fraction of calls with a transient error
#[derive(Debug)]
pub struct FaultInjector {
    rate: f64,
    rng: Mutex<StdRng>,
}

impl FaultInjector {
    pub fn new(rate: f64, seed: u64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// `None` unless injection is enabled
    pub fn from_config(config: &FaultInjectionConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(config.injection_rate, config.seed))
    }

    pub fn should_inject(&self) -> bool {
        self.rate > 0.0 && self.rng.lock().gen_bool(self.rate)
    }
}

/// A backend whose calls are retried on transient errors
pub struct RetryingTransport<T: TransportAdapter + ?Sized> {
    inner: Arc<T>,
    policy: RetryPolicy,
    faults: Option<FaultInjector>,
    metrics: Option<Arc<QueueMetrics>>,
}

impl<T: TransportAdapter + ?Sized> RetryingTransport<T> {
    pub fn new(inner: Arc<T>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            faults: None,
            metrics: None,
        }
    }

    /// Retry policy and fault injection as configured
    pub fn from_config(inner: Arc<T>, config: &QueueConfig) -> Self {
        let transport = Self::new(inner, RetryPolicy::new(config.transient_retry.clone()));
        match FaultInjector::from_config(&config.fault_injection) {
            Some(faults) => transport.with_fault_injection(faults),
            None => transport,
        }
    }

    pub fn with_fault_injection(mut self, faults: FaultInjector) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    async fn call<R, F, Fut>(&self, operation: &'static str, mut op: F) -> QueueResult<R>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = QueueResult<R>> + Send,
    {
        let faults = self.faults.as_ref();
        let metrics = self.metrics.as_ref();
        self.policy
            .run(
                operation,
                || {
                    let injected = faults.map_or(false, FaultInjector::should_inject);
                    let fut = op();
                    async move {
                        if injected {
                            return Err(QueueError::transient(operation, "injected fault"));
                        }
                        fut.await
                    }
                },
                || {
                    if let Some(metrics) = metrics {
                        metrics.record_transient_retry();
                    }
                },
            )
            .await
    }
}

#[async_trait]
impl<T: TransportAdapter + ?Sized + 'static> TransportAdapter for RetryingTransport<T> {
    fn options(&self) -> &TransportOptions {
        self.inner.options()
    }

    async fn create_queue(&self) -> QueueResult<QueueCreationResult> {
        self.call("create_queue", || self.inner.create_queue()).await
    }

    async fn remove_queue(&self) -> QueueResult<QueueRemoveResult> {
        self.call("remove_queue", || self.inner.remove_queue()).await
    }

    async fn queue_exists(&self) -> QueueResult<bool> {
        self.call("queue_exists", || self.inner.queue_exists()).await
    }

    async fn send(&self, message: OutboundMessage) -> QueueResult<SendResult> {
        self.call("send", || self.inner.send(message.clone())).await
    }

    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> QueueResult<Vec<SendResult>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.send(message).await?);
        }
        Ok(results)
    }

    async fn receive(&self, request: &ReceiveRequest) -> QueueResult<Option<ReceivedMessage>> {
        self.call("receive", || self.inner.receive(request)).await
    }

    async fn delete(&self, queue_id: QueueId, lease_token: &LeaseToken) -> QueueResult<bool> {
        self.call("delete", || self.inner.delete(queue_id, lease_token))
            .await
    }

    async fn update_status(&self, queue_id: QueueId, status: MessageStatus) -> QueueResult<bool> {
        self.call("update_status", || self.inner.update_status(queue_id, status))
            .await
    }

    async fn rollback(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        delay: Option<Duration>,
    ) -> QueueResult<bool> {
        self.call("rollback", || self.inner.rollback(queue_id, lease_token, delay))
            .await
    }

    async fn send_heartbeat(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
    ) -> QueueResult<Option<DateTime<Utc>>> {
        self.call("send_heartbeat", || {
            self.inner.send_heartbeat(queue_id, lease_token)
        })
        .await
    }

    async fn get_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64> {
        self.call("get_error_count", || {
            self.inner.get_error_count(queue_id, exception_type)
        })
        .await
    }

    async fn increment_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64> {
        self.call("increment_error_count", || {
            self.inner.increment_error_count(queue_id, exception_type)
        })
        .await
    }

    async fn total_error_count(&self) -> QueueResult<u64> {
        self.call("total_error_count", || self.inner.total_error_count())
            .await
    }

    async fn purge_error_tracking(&self, queue_id: QueueId) -> QueueResult<u64> {
        self.call("purge_error_tracking", || {
            self.inner.purge_error_tracking(queue_id)
        })
        .await
    }

    async fn move_to_error(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        details: &FailureDetails,
    ) -> QueueResult<bool> {
        self.call("move_to_error", || {
            self.inner.move_to_error(queue_id, lease_token, details)
        })
        .await
    }

    async fn error_records(&self) -> QueueResult<Vec<ErrorRecord>> {
        self.call("error_records", || self.inner.error_records()).await
    }

    async fn clear_expired_messages(&self, cancel: &CancellationToken) -> QueueResult<u64> {
        self.call("clear_expired_messages", || {
            self.inner.clear_expired_messages(cancel)
        })
        .await
    }

    async fn reset_heartbeats(&self, cancel: &CancellationToken) -> QueueResult<Vec<ResetOutcome>> {
        self.call("reset_heartbeats", || self.inner.reset_heartbeats(cancel))
            .await
    }

    async fn count(&self, state: MessageState) -> QueueResult<u64> {
        self.call("count", || self.inner.count(state)).await
    }

    fn event_stream(&self) -> BoxStream<MessageEvent> {
        self.inner.event_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryPolicyConfig {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: false,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(RetryPolicyConfig {
            max_attempts: 10,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
            jitter: false,
        });
        assert_eq!(policy.backoff(0), Duration::from_millis(50));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(40), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(RetryPolicyConfig {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(100),
            jitter: true,
            ..RetryPolicyConfig::default()
        });
        for _ in 0..100 {
            let wait = policy.backoff(0);
            assert!(wait >= Duration::from_millis(50) && wait <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_injection_is_deterministic() {
        let a = FaultInjector::new(0.3, 42);
        let b = FaultInjector::new(0.3, 42);
        let first: Vec<bool> = (0..64).map(|_| a.should_inject()).collect();
        let second: Vec<bool> = (0..64).map(|_| b.should_inject()).collect();
        assert_eq!(first, second);
        assert!(first.iter().any(|hit| *hit));
        assert!(!FaultInjector::new(0.0, 1).should_inject());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let policy = fast_policy(4);
        let calls = AtomicU32::new(0);
        let result = policy
            .run(
                "flaky",
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(QueueError::transient("flaky", "busy"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                || {},
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let policy = fast_policy(4);
        let calls = AtomicU32::new(0);
        let result: QueueResult<()> = policy
            .run(
                "broken",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(QueueError::Backend("constraint".to_string())) }
                },
                || {},
            )
            .await;
        assert!(matches!(result, Err(QueueError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_surface_transient_error() {
        let memory = Arc::new(MemoryTransport::new(TransportOptions::new("chaos")));
        memory.create_queue().await.unwrap();
        let transport = RetryingTransport::new(memory, fast_policy(3))
            .with_fault_injection(FaultInjector::new(1.0, 7));

        let result = transport.count(MessageState::Pending).await;
        assert!(matches!(result, Err(QueueError::Transient { .. })));
    }

    #[tokio::test]
    async fn test_wrapped_queue_survives_injected_faults() {
        let memory = Arc::new(MemoryTransport::new(TransportOptions::new("chaos")));
        let metrics = Arc::new(QueueMetrics::new());
        let transport = RetryingTransport::new(memory.clone(), fast_policy(30))
            .with_fault_injection(FaultInjector::new(0.3, 11))
            .with_metrics(metrics.clone());
        transport.create_queue().await.unwrap();

        for i in 0..20 {
            transport
                .send(OutboundMessage::new(format!("m{i}")))
                .await
                .unwrap();
        }
        let mut received = 0;
        while let Some(message) = transport.receive(&ReceiveRequest::any()).await.unwrap() {
            assert!(transport
                .delete(message.queue_id, &message.lease_token)
                .await
                .unwrap());
            received += 1;
        }

        assert_eq!(received, 20);
        assert_eq!(memory.count(MessageState::Pending).await.unwrap(), 0);
        assert!(metrics.snapshot().transient_retries > 0);
    }
}
