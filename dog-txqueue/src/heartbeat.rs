//! Lease renewal for claimed messages and recovery of abandoned ones.
//!
//! A worker holding a message renews its heartbeat every `interval`. The
//! monitor releases any processing message whose heartbeat is older than
//! `monitor_time`; the claim rule also treats such messages as claimable, so
//! recovery does not depend on the monitor running.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::TransportAdapter,
    schedule::Cadence,
    types::{LeaseToken, MessageContext, QueueId, ResetOutcome},
    QueueError, QueueResult,
};

/// Outcome of one renewal
#[derive(Debug, Clone, PartialEq)]
pub enum HeartBeatStatus {
    Renewed(DateTime<Utc>),
    /// The message is no longer processing under this claim
    LeaseLost,
    Failed(QueueError),
}

/// Renews heartbeats of claimed messages
#[derive(Clone)]
pub struct HeartbeatWorker {
    transport: Arc<dyn TransportAdapter>,
}

impl HeartbeatWorker {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self { transport }
    }

    pub async fn send_heartbeat(&self, queue_id: QueueId, lease_token: &LeaseToken) -> HeartBeatStatus {
        match self.transport.send_heartbeat(queue_id, lease_token).await {
            Ok(Some(at)) => HeartBeatStatus::Renewed(at),
            Ok(None) => HeartBeatStatus::LeaseLost,
            Err(err) => HeartBeatStatus::Failed(err),
        }
    }

    /// Renew `ctx`'s claim every heartbeat interval until the guard is
    /// stopped or dropped. On lease loss the context is marked and cancelled.
    /// `None` when heartbeat is disabled for the queue.
    pub fn start(&self, ctx: &MessageContext) -> Option<HeartbeatGuard> {
        let options = self.transport.options();
        if !options.enable_heartbeat {
            return None;
        }

        let interval = options.heartbeat.interval;
        let worker = self.clone();
        let ctx = ctx.clone();
        let stop = CancellationToken::new();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            let queue_id = ctx.queue_id();
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match worker.send_heartbeat(queue_id, ctx.lease_token()).await {
                    HeartBeatStatus::Renewed(at) => debug!(%queue_id, %at, "heartbeat renewed"),
                    HeartBeatStatus::LeaseLost => {
                        warn!(%queue_id, "lease lost; cancelling handler");
                        ctx.mark_lease_lost();
                        break;
                    }
                    HeartBeatStatus::Failed(err) => {
                        warn!(%queue_id, error = %err, "heartbeat failed");
                    }
                }
            }
        });

        Some(HeartbeatGuard {
            stop,
            handle: Some(handle),
        })
    }
}

/// Stops the renewal task when stopped or dropped
pub struct HeartbeatGuard {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatGuard {
    /// Stop renewing and wait for the task to exit
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Periodically releases messages whose worker stopped renewing
pub struct HeartbeatMonitor {
    transport: Arc<dyn TransportAdapter>,
}

impl HeartbeatMonitor {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self { transport }
    }

    /// One sweep. Error counts are left alone.
    #[instrument(skip_all, fields(queue = %self.transport.options().queue_name))]
    pub async fn reset_expired_heartbeats(
        &self,
        cancel: &CancellationToken,
    ) -> QueueResult<Vec<ResetOutcome>> {
        let reset = self.transport.reset_heartbeats(cancel).await?;
        if !reset.is_empty() {
            info!("Reset {} messages with expired heartbeats", reset.len());
        }
        Ok(reset)
    }

    /// Sweep on the configured cron schedule, or every half monitor time
    pub async fn run(self, cancel: CancellationToken) -> QueueResult<()> {
        let options = self.transport.options();
        if !options.enable_heartbeat {
            return Ok(());
        }
        let cadence = Cadence::from_expression(
            options.heartbeat.time_expression.as_deref(),
            options.heartbeat.monitor_time / 2,
        )?;

        info!(queue = %options.queue_name, ?cadence, "Starting heartbeat monitor");
        while cadence.wait(&cancel).await {
            if let Err(err) = self.reset_expired_heartbeats(&cancel).await {
                error!(error = %err, "heartbeat sweep failed");
            }
        }
        debug!("heartbeat monitor stopped");
        Ok(())
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<QueueResult<()>> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryTransport;
    use crate::types::{MessageState, OutboundMessage, ReceiveRequest, TransportOptions};
    use std::time::Duration;

    fn fast_options() -> TransportOptions {
        let mut options = TransportOptions::new("beats");
        options.heartbeat.interval = Duration::from_millis(20);
        options.heartbeat.monitor_time = Duration::from_millis(80);
        options
    }

    async fn claimed_ctx(transport: &MemoryTransport) -> MessageContext {
        transport.send(OutboundMessage::new("x")).await.unwrap();
        let message = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();
        MessageContext::new(&message, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_lease_lost_is_a_value() {
        let transport = Arc::new(MemoryTransport::new(fast_options()));
        transport.create_queue().await.unwrap();
        let worker = HeartbeatWorker::new(transport.clone());
        let ctx = claimed_ctx(&transport).await;

        assert!(matches!(
            worker.send_heartbeat(ctx.queue_id(), ctx.lease_token()).await,
            HeartBeatStatus::Renewed(_)
        ));
        transport
            .rollback(ctx.queue_id(), ctx.lease_token(), None)
            .await
            .unwrap();
        assert_eq!(
            worker.send_heartbeat(ctx.queue_id(), ctx.lease_token()).await,
            HeartBeatStatus::LeaseLost
        );
    }

    #[tokio::test]
    async fn test_renewal_keeps_claim_alive() {
        let transport = Arc::new(MemoryTransport::new(fast_options()));
        transport.create_queue().await.unwrap();
        let worker = HeartbeatWorker::new(transport.clone());
        let monitor = HeartbeatMonitor::new(transport.clone());
        let ctx = claimed_ctx(&transport).await;

        let guard = worker.start(&ctx).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let reset = monitor
            .reset_expired_heartbeats(&CancellationToken::new())
            .await
            .unwrap();
        assert!(reset.is_empty());
        guard.stop().await;
        assert!(!ctx.lease_lost());
    }

    #[tokio::test]
    async fn test_renewal_detects_lost_lease() {
        let transport = Arc::new(MemoryTransport::new(fast_options()));
        transport.create_queue().await.unwrap();
        let worker = HeartbeatWorker::new(transport.clone());
        let ctx = claimed_ctx(&transport).await;

        let _guard = worker.start(&ctx).unwrap();
        transport.delete(ctx.queue_id(), ctx.lease_token()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), ctx.cancellation().cancelled())
            .await
            .unwrap();
        assert!(ctx.lease_lost());
    }

    #[tokio::test]
    async fn test_renewal_stops_when_message_reclaimed() {
        let transport = Arc::new(MemoryTransport::new(fast_options()));
        transport.create_queue().await.unwrap();
        let worker = HeartbeatWorker::new(transport.clone());
        let ctx = claimed_ctx(&transport).await;

        // Abandon the claim long enough for another worker to take it over
        tokio::time::sleep(Duration::from_millis(150)).await;
        let next = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();
        assert_eq!(next.queue_id, ctx.queue_id());

        assert_eq!(
            worker.send_heartbeat(ctx.queue_id(), ctx.lease_token()).await,
            HeartBeatStatus::LeaseLost
        );
        assert!(matches!(
            worker.send_heartbeat(next.queue_id, &next.lease_token).await,
            HeartBeatStatus::Renewed(_)
        ));
    }

    #[tokio::test]
    async fn test_monitor_recovers_abandoned_message() {
        let transport = Arc::new(MemoryTransport::new(fast_options()));
        transport.create_queue().await.unwrap();
        let monitor = HeartbeatMonitor::new(transport.clone());
        let ctx = claimed_ctx(&transport).await;
        transport.increment_error_count(ctx.queue_id(), "IoError").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let reset = monitor
            .reset_expired_heartbeats(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reset.len(), 1);
        assert_eq!(reset[0].queue_id, ctx.queue_id());
        assert_eq!(transport.count(MessageState::Waiting).await.unwrap(), 1);
        assert_eq!(transport.get_error_count(ctx.queue_id(), "IoError").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_monitor_disabled_without_heartbeat() {
        let options = TransportOptions {
            enable_heartbeat: false,
            ..TransportOptions::new("plain")
        };
        let transport = Arc::new(MemoryTransport::new(options));
        transport.create_queue().await.unwrap();
        let worker = HeartbeatWorker::new(transport.clone());
        let ctx = claimed_ctx(&transport).await;

        assert!(worker.start(&ctx).is_none());
        HeartbeatMonitor::new(transport)
            .run(CancellationToken::new())
            .await
            .unwrap();
    }
}
