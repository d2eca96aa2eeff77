use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::{
    backend::TransportAdapter,
    commit::CommitPipeline,
    config::QueueConfig,
    error::HandlerError,
    types::{FailureDetails, MessageContext},
    QueueResult,
};

/// What to do with a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release for another attempt after `delay`
    Retry { delay: Option<Duration> },
    /// Quarantine in the error table
    Poison,
}

/// Retry budget per exception type
#[derive(Debug, Clone)]
pub struct RetryDecider {
    config: QueueConfig,
}

impl RetryDecider {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Failures tolerated for `exception_type` before poisoning
    pub fn limit_for(&self, exception_type: &str) -> u64 {
        self.config
            .delays_for(exception_type)
            .map_or(self.config.retry_limit, |delays| delays.len() as u64)
    }

    /// Decide from the failure count including the current failure
    pub fn decide(&self, error: &HandlerError, error_count: u64) -> RetryDecision {
        let exception_type = error.exception_type();
        if !error.is_retryable() || self.config.non_retryable.contains(exception_type) {
            return RetryDecision::Poison;
        }
        if error_count > self.limit_for(exception_type) {
            return RetryDecision::Poison;
        }

        let delay = self
            .config
            .delays_for(exception_type)
            .and_then(|delays| delays.get(error_count.saturating_sub(1) as usize))
            .copied()
            .or(self.config.default_retry_delay);
        RetryDecision::Retry { delay }
    }
}

/// How a failure was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    RolledBack { delay: Option<Duration> },
    Poisoned,
    /// The message was no longer held by this worker
    LeaseLost,
    /// Destructive queue: the message was removed by the claim
    Discarded,
}

/// Failure path: count, decide, then roll back or poison
#[derive(Clone)]
pub struct FailureHandler {
    transport: Arc<dyn TransportAdapter>,
    decider: RetryDecider,
    commit: CommitPipeline,
}

impl FailureHandler {
    pub fn new(transport: Arc<dyn TransportAdapter>, decider: RetryDecider) -> Self {
        Self {
            commit: CommitPipeline::new(transport.clone()),
            transport,
            decider,
        }
    }

    pub fn decider(&self) -> &RetryDecider {
        &self.decider
    }

    #[instrument(skip_all, fields(queue_id = %ctx.queue_id(), exception_type = error.exception_type()))]
    pub async fn handle_failure(
        &self,
        ctx: &mut MessageContext,
        error: &HandlerError,
    ) -> QueueResult<FailureOutcome> {
        if ctx.lease_lost() {
            return Ok(FailureOutcome::LeaseLost);
        }

        let queue_id = ctx.queue_id();
        let error_count = self
            .transport
            .increment_error_count(queue_id, error.exception_type())
            .await?;

        if self.transport.options().destructive_receive() {
            warn!(error_count, "handler failed on a destructive queue; message dropped");
            return Ok(FailureOutcome::Discarded);
        }

        match self.decider.decide(error, error_count) {
            RetryDecision::Poison => {
                let details = FailureDetails {
                    exception_type: error.exception_type().to_string(),
                    message: error.message().to_string(),
                    error_count,
                };
                if self
                    .transport
                    .move_to_error(queue_id, ctx.lease_token(), &details)
                    .await? {
                    info!(error_count, "message moved to error table");
                    Ok(FailureOutcome::Poisoned)
                } else {
                    Ok(FailureOutcome::LeaseLost)
                }
            }
            RetryDecision::Retry { delay } => {
                if let Some(delay) = delay {
                    ctx.set_increase_delay(delay);
                }
                if self.commit.rollback(ctx).await? {
                    info!(error_count, ?delay, "message rolled back for retry");
                    Ok(FailureOutcome::RolledBack { delay })
                } else {
                    Ok(FailureOutcome::LeaseLost)
                }
            }
        }
    }
}
