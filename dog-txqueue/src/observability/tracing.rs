use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use crate::{QueueError, QueueResult};

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Install a global subscriber filtered by `env_var` (default level `info`).
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(env_var: &str, format: LogFormat) -> QueueResult<()> {
    let filter = EnvFilter::builder()
        .with_env_var(env_var)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()
        .map_err(|e| QueueError::Configuration(e.to_string()))?;

    let builder = FmtSubscriber::builder().with_env_filter(filter);
    let installed = match format {
        LogFormat::Pretty => builder.pretty().finish().try_init(),
        LogFormat::Json => builder.json().finish().try_init(),
    };
    installed.map_err(|e| QueueError::Internal(e.to_string()))
}
