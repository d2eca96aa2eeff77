use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::TransportAdapter,
    commit::CommitPipeline,
    receive::MessageReceiver,
    types::{MessageContext, OutboundMessage, ReceiveRequest, ReceivedMessage, SendResult},
    QueueError, QueueResult,
};

/// Synchronous façade over the claim and commit pipelines.
///
/// Owns a current-thread runtime and drives the async pipelines on it. Must
/// not be used from inside an async context; blocking inside a runtime panics.
pub struct BlockingQueue {
    runtime: Runtime,
    receiver: MessageReceiver,
    commit: CommitPipeline,
}

impl BlockingQueue {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> QueueResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| QueueError::Internal(format!("failed to build runtime: {e}")))?;
        Ok(Self {
            runtime,
            receiver: MessageReceiver::new(transport.clone()),
            commit: CommitPipeline::new(transport),
        })
    }

    pub fn transport(&self) -> &Arc<dyn TransportAdapter> {
        self.receiver.transport()
    }

    /// Run any future on the owned runtime, e.g. backend setup
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn send(&self, message: OutboundMessage) -> QueueResult<SendResult> {
        let transport = self.transport().clone();
        self.block_on(async move { transport.send(message).await })
    }

    pub fn receive(
        &self,
        request: &ReceiveRequest,
        cancel: &CancellationToken,
    ) -> QueueResult<Option<ReceivedMessage>> {
        self.block_on(self.receiver.receive(request, cancel))
    }

    pub fn commit(&self, ctx: &MessageContext) -> QueueResult<bool> {
        self.block_on(self.commit.commit(ctx))
    }

    pub fn rollback(&self, ctx: &MessageContext) -> QueueResult<bool> {
        self.block_on(self.commit.rollback(ctx))
    }
}
