//! # dog-txqueue: Transactional Work Queues
//!
//! **Storage-backed message queue with atomic claims and heartbeat leases**
//!
//! Producers enqueue messages; consumers claim them, run a handler, and then
//! either commit (delete) or roll back (retry later, or quarantine after too
//! many failures). Correctness under many concurrent workers comes from the
//! storage backend: a claim is a single atomic operation, so a message has at
//! most one owner at a time.
//!
//! ## Features
//!
//! - **Atomic Claims**: one conditional update per claim; no coordinator
//! - **Heartbeat Leases**: abandoned claims become claimable again
//! - **Poison Handling**: per-exception retry budgets and an error table
//! - **Delayed Visibility & Expiration**: per-message delay and deadline
//! - **Priority & Routes**: ordered claims and route-filtered consumers
//! - **Transient Retry**: backoff with jitter, plus seeded fault injection
//! - **RPC**: request/response over a pair of queues
//! - **Backends**: in-memory and SQLite (`sqlite` feature, on by default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_txqueue::prelude::*;
//!
//! # async fn run() -> QueueResult<()> {
//! let transport = Arc::new(MemoryTransport::new(TransportOptions::new("emails")));
//! transport.create_queue().await?;
//!
//! let producer = QueueProducer::new(transport.clone());
//! producer
//!     .send_json(
//!         &serde_json::json!({ "to": "ops@example.com" }),
//!         Headers::new(),
//!         SendOptions::new().with_priority(Priority::HIGH),
//!     )
//!     .await?;
//!
//! let receiver = MessageReceiver::new(transport.clone());
//! if let Some(message) = receiver.receive(&ReceiveRequest::any(), &CancellationToken::new()).await? {
//!     let ctx = MessageContext::new(&message, CancellationToken::new());
//!     CommitPipeline::new(transport).commit(&ctx).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod types;
pub mod backend;
pub mod codec;
pub mod observability;
pub mod schedule;
pub mod receive;
pub mod blocking;
pub mod commit;
pub mod heartbeat;
pub mod poison;
pub mod expiration;
pub mod policy;
pub mod producer;
pub mod consumer;
pub mod rpc;

// Core API exports
pub use error::{HandlerError, QueueError, QueueResult};
pub use config::{FaultInjectionConfig, QueueConfig, RetryDelay, RetryPolicyConfig};
pub use types::{
    ColumnDefinition, ColumnType, ColumnValue, ConfigurationValidation, ConstraintDefinition,
    ConstraintKind, CorrelationId, ErrorRecord, FailureDetails, HeaderKey, Headers,
    HeartbeatOptions, LeaseToken, MessageContext, MessageEvent, MessageId, MessageRecord, MessageState,
    MessageStatus, OutboundMessage, Priority, QueueCreationResult, QueueCreationStatus, QueueId,
    QueueRemoveResult, QueueRemoveStatus, ReceiveRequest, ReceivedMessage, ResetOutcome,
    SendOptions, SendResult, TransportOptions,
};
pub use backend::{BoxStream, MemoryTransport, TransportAdapter};
pub use codec::{json::JsonCodec, CodecRegistry, MessageCodec};
pub use observability::{MetricsSnapshot, QueueMetrics};
pub use receive::MessageReceiver;
pub use blocking::BlockingQueue;
pub use commit::CommitPipeline;
pub use heartbeat::{HeartBeatStatus, HeartbeatGuard, HeartbeatMonitor, HeartbeatWorker};
pub use poison::{FailureHandler, FailureOutcome, RetryDecider, RetryDecision};
pub use expiration::ExpirationSweeper;
pub use policy::{FaultInjector, RetryPolicy, RetryingTransport};
pub use producer::QueueProducer;
pub use consumer::{MessageHandler, QueueConsumer, WorkerHandle};
pub use rpc::{RpcClient, RpcServer};

// Backend implementations
#[cfg(feature = "sqlite")]
pub use backend::sqlite::{SqliteConfig, SqliteTransport};

// Observability features
#[cfg(feature = "tracing-basic")]
pub use observability::{init_tracing, LogFormat};

/// Everything needed to produce and consume messages
pub mod prelude {
    // Transports
    pub use crate::{MemoryTransport, TransportAdapter, TransportOptions};

    #[cfg(feature = "sqlite")]
    pub use crate::SqliteTransport;

    // Messages
    pub use crate::{
        CorrelationId, Headers, LeaseToken, MessageContext, MessageId, OutboundMessage, Priority,
        QueueId, ReceiveRequest, ReceivedMessage, SendOptions,
    };

    // Pipelines
    pub use crate::{
        CommitPipeline, MessageHandler, MessageReceiver, QueueConfig, QueueConsumer,
        QueueProducer, RpcClient, RpcServer,
    };

    // Errors
    pub use crate::{HandlerError, QueueError, QueueResult};

    // Essential traits
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;
}
