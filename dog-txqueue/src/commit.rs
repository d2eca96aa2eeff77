use std::sync::Arc;

use tracing::{debug, instrument};

use crate::{backend::TransportAdapter, types::MessageContext, QueueError, QueueResult};

/// Finishes a claimed message: delete on success, release on failure
#[derive(Clone)]
pub struct CommitPipeline {
    transport: Arc<dyn TransportAdapter>,
}

impl CommitPipeline {
    pub fn new(transport: Arc<dyn TransportAdapter>) -> Self {
        Self { transport }
    }

    /// Delete the message. `Ok(false)` when there was nothing to delete or
    /// the lease has passed to another claim, which makes a repeated or stale
    /// commit harmless.
    #[instrument(skip_all, fields(queue_id = %ctx.queue_id()))]
    pub async fn commit(&self, ctx: &MessageContext) -> QueueResult<bool> {
        if !ctx.message_id().has_value() || self.transport.options().destructive_receive() {
            return Ok(false);
        }

        let deleted = self
            .transport
            .delete(ctx.queue_id(), ctx.lease_token())
            .await
            .map_err(|err| {
                if err.is_transient() {
                    return err;
                }
                QueueError::Commit {
                    message_id: ctx.message_id().to_string(),
                    correlation_id: ctx.correlation_id().to_string(),
                    reason: err.to_string(),
                }
            })?;
        debug!(deleted, "commit");
        Ok(deleted)
    }

    /// Return the message to waiting, delayed by the context's increase-delay
    /// hint when delayed processing is on
    #[instrument(skip_all, fields(queue_id = %ctx.queue_id()))]
    pub async fn rollback(&self, ctx: &MessageContext) -> QueueResult<bool> {
        let options = self.transport.options();
        if !ctx.message_id().has_value() || !options.rollback_supported() {
            return Ok(false);
        }

        let delay = if options.enable_delayed_processing {
            ctx.increase_delay()
        } else {
            None
        };
        let released = self
            .transport
            .rollback(ctx.queue_id(), ctx.lease_token(), delay)
            .await
            .map_err(|err| {
                if err.is_transient() {
                    return err;
                }
                QueueError::Rollback {
                    message_id: ctx.message_id().to_string(),
                    correlation_id: ctx.correlation_id().to_string(),
                    reason: err.to_string(),
                }
            })?;
        debug!(released, ?delay, "rollback");
        Ok(released)
    }
}
