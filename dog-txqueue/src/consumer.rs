//! # Consumer framework
//!
//! [`QueueConsumer`] runs `worker_count` workers against one queue. Each
//! worker loops: claim, start heartbeat renewal, run the handler, then commit
//! on success or hand the failure to the poison path. There is no
//! coordinator; the backend's atomic claim keeps workers apart.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_txqueue::prelude::*;
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl MessageHandler for PrintHandler {
//!     async fn handle(&self, message: &ReceivedMessage, _ctx: &MessageContext) -> Result<(), HandlerError> {
//!         println!("{} bytes", message.body.len());
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let transport = Arc::new(MemoryTransport::new(TransportOptions::new("jobs")));
//! transport.create_queue().await?;
//! let consumer = QueueConsumer::new(transport, PrintHandler, QueueConfig::default())?;
//! let workers = consumer.start();
//! // ...
//! workers.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::TransportAdapter,
    commit::CommitPipeline,
    config::QueueConfig,
    error::HandlerError,
    expiration::ExpirationSweeper,
    heartbeat::{HeartbeatMonitor, HeartbeatWorker},
    observability::QueueMetrics,
    poison::{FailureHandler, RetryDecider},
    policy::RetryingTransport,
    receive::MessageReceiver,
    types::{MessageContext, ReceiveRequest, ReceivedMessage},
    QueueError, QueueResult,
};

/// Application logic run for every claimed message
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// `Ok` commits the message; an error is counted and retried or poisoned
    async fn handle(&self, message: &ReceivedMessage, ctx: &MessageContext) -> Result<(), HandlerError>;
}

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<QueueResult<()>>>,
    background: Vec<JoinHandle<QueueResult<()>>>,
    collector: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Token cancelled on shutdown
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Gracefully shutdown the workers; in-flight handlers run to completion
    pub async fn shutdown(self) -> QueueResult<()> {
        self.shutdown.cancel();

        let mut first_error = None;
        for handle in self.workers.into_iter().chain(self.background) {
            let result = handle
                .await
                .map_err(|e| QueueError::Internal(format!("Worker join error: {}", e)))
                .and_then(|result| result);
            if let Err(err) = result {
                error!(error = %err, "worker exited with error");
                first_error.get_or_insert(err);
            }
        }
        if let Some(collector) = self.collector {
            let _ = collector.await;
        }

        info!("All workers stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Worker pool for one queue
pub struct QueueConsumer<H: MessageHandler> {
    transport: Arc<dyn TransportAdapter>,
    handler: Arc<H>,
    config: QueueConfig,
    request: ReceiveRequest,
    metrics: Option<Arc<QueueMetrics>>,
}

impl<H: MessageHandler> QueueConsumer<H> {
    pub fn new(transport: Arc<dyn TransportAdapter>, handler: H, config: QueueConfig) -> QueueResult<Self> {
        config.validate()?;
        let validation = transport.options().validate();
        if !validation.valid {
            return Err(QueueError::Configuration(
                validation.error_message.unwrap_or_default(),
            ));
        }

        Ok(Self {
            transport,
            handler: Arc::new(handler),
            config,
            request: ReceiveRequest::any(),
            metrics: None,
        })
    }

    /// Only claim messages carrying one of `routes`
    pub fn with_routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request = ReceiveRequest::for_routes(routes);
        self
    }

    /// Count lifecycle events and transient retries into `metrics`
    pub fn with_metrics(mut self, metrics: Arc<QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spawn the workers and, when configured, the background monitors
    #[instrument(skip(self), fields(queue = %self.transport.options().queue_name, workers = self.config.worker_count))]
    pub fn start(&self) -> WorkerHandle {
        let shutdown = CancellationToken::new();

        let mut retrying = RetryingTransport::from_config(self.transport.clone(), &self.config);
        if let Some(metrics) = &self.metrics {
            retrying = retrying.with_metrics(metrics.clone());
        }
        let transport: Arc<dyn TransportAdapter> = Arc::new(retrying);

        let collector = self.metrics.as_ref().map(|metrics| {
            metrics
                .clone()
                .spawn_collector(transport.event_stream(), shutdown.clone())
        });

        let failures = FailureHandler::new(transport.clone(), RetryDecider::from_config(&self.config));
        let workers = (0..self.config.worker_count)
            .map(|index| {
                let worker = Worker {
                    index,
                    receiver: MessageReceiver::new(transport.clone()),
                    heartbeat: HeartbeatWorker::new(transport.clone()),
                    commit: CommitPipeline::new(transport.clone()),
                    failures: failures.clone(),
                    handler: self.handler.clone(),
                    request: self.request.clone(),
                    config: self.config.clone(),
                    metrics: self.metrics.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let mut background = Vec::new();
        if self.config.run_monitors {
            background.push(HeartbeatMonitor::new(transport.clone()).spawn(shutdown.clone()));
            background.push(
                ExpirationSweeper::new(transport.clone(), self.config.expiration_monitor_interval)
                    .spawn(shutdown.clone()),
            );
        }

        info!("Started {} workers", self.config.worker_count);
        WorkerHandle {
            shutdown,
            workers,
            background,
            collector,
        }
    }
}

/// Worker for processing messages from one queue
struct Worker<H> {
    index: usize,
    receiver: MessageReceiver,
    heartbeat: HeartbeatWorker,
    commit: CommitPipeline,
    failures: FailureHandler,
    handler: Arc<H>,
    request: ReceiveRequest,
    config: QueueConfig,
    metrics: Option<Arc<QueueMetrics>>,
    shutdown: CancellationToken,
}

impl<H: MessageHandler> Worker<H> {
    /// Run the worker loop
    async fn run(self) -> QueueResult<()> {
        debug!(worker = self.index, "Worker started");

        while !self.shutdown.is_cancelled() {
            let idle = match self.process_next().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(worker = self.index, "Error processing message: {}", e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        debug!(worker = self.index, "Worker stopped");
        Ok(())
    }

    /// Process the next available message
    async fn process_next(&self) -> QueueResult<bool> {
        let Some(message) = self.receiver.receive(&self.request, &self.shutdown).await? else {
            return Ok(false);
        };

        let mut ctx = MessageContext::new(&message, self.shutdown.child_token());
        debug!(worker = self.index, queue_id = %ctx.queue_id(), "Processing message");

        let guard = self.heartbeat.start(&ctx);
        let result = self.handler.handle(&message, &ctx).await;
        if let Some(guard) = guard {
            guard.stop().await;
        }

        match result {
            Ok(()) if ctx.lease_lost() => {
                warn!(queue_id = %ctx.queue_id(), "Lease lost while handling; not committing");
            }
            Ok(()) => {
                self.commit.commit(&ctx).await?;
                debug!(queue_id = %ctx.queue_id(), "Message completed");
            }
            Err(handler_error) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_failure(handler_error.exception_type());
                }
                let outcome = self.failures.handle_failure(&mut ctx, &handler_error).await?;
                warn!(queue_id = %ctx.queue_id(), ?outcome, "Message failed: {}", handler_error);
            }
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryTransport;
    use crate::types::{MessageState, OutboundMessage, TransportOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &ReceivedMessage, _ctx: &MessageContext) -> Result<(), HandlerError> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn create_test_transport() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::new(TransportOptions::new("consumer")))
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let transport = create_test_transport();
        let handler = CountingHandler {
            handled: AtomicUsize::new(0),
        };
        let result = QueueConsumer::new(transport, handler, QueueConfig::default().with_worker_count(0));
        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_workers_drain_queue() {
        let transport = create_test_transport();
        transport.create_queue().await.unwrap();
        for i in 0..10 {
            transport.send(OutboundMessage::new(format!("m{i}"))).await.unwrap();
        }

        let config = QueueConfig::default()
            .with_worker_count(4)
            .with_poll_interval(Duration::from_millis(10));
        let consumer = QueueConsumer::new(
            transport.clone(),
            CountingHandler {
                handled: AtomicUsize::new(0),
            },
            config,
        )
        .unwrap();
        let metrics = Arc::new(QueueMetrics::new());
        let workers = consumer.with_metrics(metrics.clone()).start();

        tokio::time::timeout(Duration::from_secs(5), async {
            while metrics.snapshot().committed < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        workers.shutdown().await.unwrap();

        assert_eq!(transport.count(MessageState::Pending).await.unwrap(), 0);
        assert_eq!(metrics.snapshot().committed, 10);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let transport = create_test_transport();
        transport.create_queue().await.unwrap();
        let consumer = QueueConsumer::new(
            transport,
            CountingHandler {
                handled: AtomicUsize::new(0),
            },
            QueueConfig::default().with_worker_count(3),
        )
        .unwrap();

        let workers = consumer.start();
        tokio::time::timeout(Duration::from_secs(2), workers.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
