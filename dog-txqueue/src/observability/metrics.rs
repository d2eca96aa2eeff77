use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{backend::BoxStream, types::MessageEvent};

/// Live counters for one queue, fed from the transport's event stream
#[derive(Debug, Default)]
pub struct QueueMetrics {
    sent: AtomicU64,
    claimed: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    poisoned: AtomicU64,
    expired: AtomicU64,
    heartbeat_resets: AtomicU64,
    transient_retries: AtomicU64,

    /// Handler failures per exception type
    failures: DashMap<String, u64>,
}

/// Point-in-time copy of [`QueueMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub sent: u64,
    pub claimed: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub poisoned: u64,
    pub expired: u64,
    pub heartbeat_resets: u64,
    pub transient_retries: u64,
}

impl MetricsSnapshot {
    /// Committed share of finished messages, in percent
    pub fn success_rate(&self) -> f64 {
        let finished = (self.committed + self.poisoned) as f64;
        if finished == 0.0 {
            100.0
        } else {
            (self.committed as f64 / finished) * 100.0
        }
    }

    /// Rollbacks per claim, in percent
    pub fn retry_rate(&self) -> f64 {
        if self.claimed == 0 {
            0.0
        } else {
            (self.rolled_back as f64 / self.claimed as f64) * 100.0
        }
    }
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: &MessageEvent) {
        let counter = match event {
            MessageEvent::Sent { .. } => &self.sent,
            MessageEvent::Claimed { .. } => &self.claimed,
            MessageEvent::Committed { .. } => &self.committed,
            MessageEvent::RolledBack { .. } => &self.rolled_back,
            MessageEvent::Poisoned { .. } => &self.poisoned,
            MessageEvent::Expired { .. } => &self.expired,
            MessageEvent::HeartbeatReset { .. } => &self.heartbeat_resets,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, exception_type: &str) {
        *self.failures.entry(exception_type.to_string()).or_insert(0) += 1;
    }

    pub fn failures(&self, exception_type: &str) -> u64 {
        self.failures.get(exception_type).map_or(0, |count| *count)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            poisoned: self.poisoned.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            heartbeat_resets: self.heartbeat_resets.load(Ordering::Relaxed),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
        }
    }

    /// Count events from `events` until the stream ends or `cancel` fires
    pub fn spawn_collector(
        self: Arc<Self>,
        mut events: BoxStream<MessageEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => {
                            debug!(event = event.event_name(), queue_id = %event.queue_id(), "queue event");
                            self.record(&event);
                        }
                        None => break,
                    },
                }
            }
        })
    }
}
