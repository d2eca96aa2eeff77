use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use dog_txqueue::{
    prelude::*, types::headers::standard, MessageState, QueueMetrics, WorkerHandle,
};

/// Fails every message the first `failures` times it is seen
struct FlakyHandler {
    failures: u32,
    attempts: DashMap<MessageId, u32>,
    handled: AtomicUsize,
}

impl FlakyHandler {
    fn new(failures: u32) -> Self {
        Self {
            failures,
            attempts: DashMap::new(),
            handled: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(&self, message: &ReceivedMessage, _ctx: &MessageContext) -> Result<(), HandlerError> {
        let attempt = {
            let mut entry = self.attempts.entry(message.message_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt <= self.failures {
            return Err(HandlerError::retryable("Flaky", format!("attempt {attempt}")));
        }
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct AlwaysFails {
    permanent: bool,
}

#[async_trait]
impl MessageHandler for AlwaysFails {
    async fn handle(&self, _message: &ReceivedMessage, _ctx: &MessageContext) -> Result<(), HandlerError> {
        if self.permanent {
            Err(HandlerError::permanent("BadInput", "cannot parse"))
        } else {
            Err(HandlerError::retryable("AlwaysFails", "boom"))
        }
    }
}

async fn create_test_transport(options: TransportOptions) -> Arc<MemoryTransport> {
    let transport = Arc::new(MemoryTransport::new(options));
    transport.create_queue().await.unwrap();
    transport
}

fn fast_config(workers: usize) -> QueueConfig {
    QueueConfig::default()
        .with_worker_count(workers)
        .with_poll_interval(Duration::from_millis(5))
        .with_retry_limit(2)
}

async fn wait_for(metrics: &QueueMetrics, done: impl Fn(&dog_txqueue::MetricsSnapshot) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done(&metrics.snapshot()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer did not finish in time");
}

fn start<H: MessageHandler>(
    transport: Arc<MemoryTransport>,
    handler: H,
    config: QueueConfig,
) -> (WorkerHandle, Arc<QueueMetrics>) {
    let metrics = Arc::new(QueueMetrics::new());
    let workers = QueueConsumer::new(transport, handler, config)
        .unwrap()
        .with_metrics(metrics.clone())
        .start();
    (workers, metrics)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poison_after_retry_limit() {
    let transport = create_test_transport(TransportOptions::new("poison")).await;
    transport.send(OutboundMessage::new("bad")).await.unwrap();

    let (workers, metrics) = start(
        transport.clone(),
        AlwaysFails { permanent: false },
        fast_config(2),
    );
    wait_for(&metrics, |snapshot| snapshot.poisoned == 1).await;
    workers.shutdown().await.unwrap();

    assert_eq!(transport.count(MessageState::Pending).await.unwrap(), 0);
    let errors = transport.error_records().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].exception_type, "AlwaysFails");
    assert_eq!(errors[0].error_count, 3);
    assert_eq!(&errors[0].body[..], b"bad");
    assert_eq!(
        errors[0].headers.get(&standard::EXCEPTION_MESSAGE).as_deref(),
        Some("boom")
    );
    assert_eq!(metrics.failures("AlwaysFails"), 3);
    assert_eq!(metrics.snapshot().rolled_back, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_permanent_failure_skips_retries() {
    let transport = create_test_transport(TransportOptions::new("permanent")).await;
    transport.send(OutboundMessage::new("bad")).await.unwrap();

    let (workers, metrics) = start(
        transport.clone(),
        AlwaysFails { permanent: true },
        fast_config(1),
    );
    wait_for(&metrics, |snapshot| snapshot.poisoned == 1).await;
    workers.shutdown().await.unwrap();

    let errors = transport.error_records().await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_count, 1);
    assert_eq!(metrics.snapshot().rolled_back, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_flaky_messages_succeed_within_limit() {
    let transport = create_test_transport(TransportOptions::new("flaky")).await;
    transport
        .send_batch(
            (0..25)
                .map(|i| {
                    OutboundMessage::new(format!("job {i}"))
                        .with_options(SendOptions::new().with_message_id(MessageId::from(format!("job-{i}"))))
                })
                .collect(),
        )
        .await
        .unwrap();

    let handler = FlakyHandler::new(2);
    let (workers, metrics) = start(transport.clone(), handler, fast_config(20));
    wait_for(&metrics, |snapshot| snapshot.committed == 25).await;
    workers.shutdown().await.unwrap();

    assert_eq!(transport.count(MessageState::Pending).await.unwrap(), 0);
    assert!(transport.error_records().await.unwrap().is_empty());
    assert_eq!(transport.total_error_count().await.unwrap(), 50);
    assert_eq!(metrics.failures("Flaky"), 50);
    assert_eq!(metrics.snapshot().poisoned, 0);
}

#[tokio::test]
async fn test_retry_delay_defers_next_attempt() {
    let transport = create_test_transport(TransportOptions::new("delayed_retry")).await;
    transport.send(OutboundMessage::new("x")).await.unwrap();

    let config = fast_config(1).with_retry_delay("Flaky", vec![Duration::from_millis(300)]);
    let (workers, metrics) = start(transport.clone(), FlakyHandler::new(1), config);

    wait_for(&metrics, |snapshot| snapshot.rolled_back == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(metrics.snapshot().committed, 0);
    assert_eq!(transport.count(MessageState::Waiting).await.unwrap(), 1);

    wait_for(&metrics, |snapshot| snapshot.committed == 1).await;
    workers.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_route_filtered_consumer() {
    let options = TransportOptions {
        enable_route: true,
        ..TransportOptions::new("routed")
    };
    let transport = create_test_transport(options).await;
    transport
        .send(OutboundMessage::new("a").with_options(SendOptions::new().with_route("billing")))
        .await
        .unwrap();
    transport
        .send(OutboundMessage::new("b").with_options(SendOptions::new().with_route("shipping")))
        .await
        .unwrap();

    let metrics = Arc::new(QueueMetrics::new());
    let workers = QueueConsumer::new(transport.clone(), FlakyHandler::new(0), fast_config(2))
        .unwrap()
        .with_routes(["billing"])
        .with_metrics(metrics.clone())
        .start();
    wait_for(&metrics, |snapshot| snapshot.committed == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    workers.shutdown().await.unwrap();

    assert_eq!(metrics.snapshot().committed, 1);
    let left = transport.receive(&ReceiveRequest::any()).await.unwrap().unwrap();
    assert_eq!(left.route.as_deref(), Some("shipping"));
}
