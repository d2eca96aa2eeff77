use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    backend::TransportAdapter,
    types::{ReceiveRequest, ReceivedMessage},
    QueueError, QueueResult,
};

/// Claim side of the consumer pipeline
#[derive(Clone)]
pub struct MessageReceiver {
    transport: Arc<dyn TransportAdapter>,
}

impl MessageReceiver {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn TransportAdapter> {
        &self.transport
    }

    /// Claim the next eligible message.
    ///
    /// Returns `Ok(None)` when nothing is eligible or `cancel` has fired. A
    /// claim that lands after cancellation is rolled back, except on
    /// destructive queues where the message is already gone and is returned.
    #[instrument(skip_all, fields(queue = %self.transport.options().queue_name))]
    pub async fn receive(
        &self,
        request: &ReceiveRequest,
        cancel: &CancellationToken,
    ) -> QueueResult<Option<ReceivedMessage>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let claimed = self.transport.receive(request).await.map_err(|err| {
            if err.is_transient() {
                err
            } else {
                QueueError::Receive {
                    reason: err.to_string(),
                }
            }
        })?;
        let Some(message) = claimed else {
            return Ok(None);
        };

        if cancel.is_cancelled() && self.transport.options().rollback_supported() {
            debug!(queue_id = %message.queue_id, "cancelled during claim; releasing");
            if let Err(err) = self
                .transport
                .rollback(message.queue_id, &message.lease_token, None)
                .await
            {
                warn!(queue_id = %message.queue_id, error = %err, "failed to release cancelled claim");
                return Err(err);
            }
            return Ok(None);
        }

        Ok(Some(message))
    }
}
