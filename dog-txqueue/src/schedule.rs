use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::{QueueError, QueueResult};

/// When a background loop runs next
#[derive(Debug, Clone)]
pub enum Cadence {
    Every(Duration),
    Cron(Box<Schedule>),
}

impl Cadence {
    /// A cron expression (seconds field first) if given, else a fixed interval
    pub fn from_expression(expression: Option<&str>, fallback: Duration) -> QueueResult<Self> {
        match expression {
            Some(expression) => Schedule::from_str(expression)
                .map(|schedule| Self::Cron(Box::new(schedule)))
                .map_err(|e| {
                    QueueError::Configuration(format!("invalid time expression '{expression}': {e}"))
                }),
            None => Ok(Self::Every(fallback.max(Duration::from_millis(1)))),
        }
    }

    fn next_delay(&self) -> Option<Duration> {
        match self {
            Self::Every(interval) => Some(*interval),
            Self::Cron(schedule) => schedule
                .upcoming(Utc)
                .next()
                .map(|next| (next - Utc::now()).to_std().unwrap_or_default()),
        }
    }

    /// Sleep until the next tick. Returns false if cancelled first.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.next_delay() else {
            // Schedule has no future occurrence
            cancel.cancelled().await;
            return false;
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
