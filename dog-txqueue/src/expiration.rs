use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::{backend::TransportAdapter, schedule::Cadence, QueueResult};

/// Deletes messages past their expiration time
pub struct ExpirationSweeper {
    transport: Arc<dyn TransportAdapter>,
    interval: Duration,
}

impl ExpirationSweeper {
    pub fn new(transport: Arc<dyn TransportAdapter>, interval: Duration) -> Self {
        Self { transport, interval }
    }

    /// One sweep in batches of `expiration_batch_size`; stops between
    /// batches when cancelled. Returns the number deleted.
    #[instrument(skip_all, fields(queue = %self.transport.options().queue_name))]
    pub async fn clear_expired_messages(&self, cancel: &CancellationToken) -> QueueResult<u64> {
        if !self.transport.options().enable_message_expiration {
            return Ok(0);
        }
        let removed = self.transport.clear_expired_messages(cancel).await?;
        if removed > 0 {
            info!("Deleted {} expired messages", removed);
        }
        Ok(removed)
    }

    pub async fn run(self, cancel: CancellationToken) -> QueueResult<()> {
        if !self.transport.options().enable_message_expiration {
            return Ok(());
        }
        let cadence = Cadence::from_expression(None, self.interval)?;
        info!(?cadence, "Starting expiration sweeper");
        while cadence.wait(&cancel).await {
            if let Err(err) = self.clear_expired_messages(&cancel).await {
                error!(error = %err, "expiration sweep failed");
            }
        }
        debug!("expiration sweeper stopped");
        Ok(())
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<QueueResult<()>> {
        tokio::spawn(self.run(cancel))
    }
}
