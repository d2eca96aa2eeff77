//! SQLite backend.
//!
//! Claims are one `UPDATE ... WHERE queue_id = (SELECT ... LIMIT 1) RETURNING`
//! statement, so selection and marking happen under SQLite's single write
//! lock. With `enable_hold_transaction_until_committed` the claim runs in a
//! transaction that stays open until commit, rollback or poison.

pub mod schema;
pub mod storage;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::{
    types::{options::is_identifier, LeaseToken, MessageEvent, QueueId, TransportOptions},
    QueueError, QueueResult,
};
use schema::TableNames;

/// Connection settings
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file; `None` opens a private in-memory database
    pub path: Option<PathBuf>,
    pub max_connections: u32,
    /// How long a writer waits on a locked database before reporting busy
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// A single shared connection; an in-memory database lives only as long as it
    pub fn in_memory() -> Self {
        Self {
            path: None,
            max_connections: 1,
            ..Self::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Claim transaction kept open until its lease holder finishes the message
pub(crate) struct HeldClaim {
    pub(crate) lease_token: LeaseToken,
    pub(crate) tx: Transaction<'static, Sqlite>,
}

/// SQLite-backed queue
pub struct SqliteTransport {
    pub(crate) pool: SqlitePool,
    pub(crate) options: TransportOptions,
    pub(crate) tables: TableNames,

    /// Claim transactions kept open until the message is finished
    pub(crate) held: Mutex<HashMap<QueueId, HeldClaim>>,

    pub(crate) event_broadcaster: broadcast::Sender<MessageEvent>,
}

impl SqliteTransport {
    /// Open (creating if needed) a database file
    pub async fn connect(path: impl Into<PathBuf>, options: TransportOptions) -> QueueResult<Self> {
        Self::connect_with(SqliteConfig::file(path), options).await
    }

    pub async fn connect_with(config: SqliteConfig, options: TransportOptions) -> QueueResult<Self> {
        let connect = if let Some(path) = &config.path {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .busy_timeout(config.busy_timeout);

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections.max(1));
        if config.path.is_none() {
            // Every connection to `:memory:` is its own database
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(connect).await?;

        info!(
            queue = %options.queue_name,
            path = ?config.path,
            "Connected sqlite transport"
        );
        Self::from_pool(pool, options)
    }

    /// Use an existing pool; several queues may share one database
    pub fn from_pool(pool: SqlitePool, options: TransportOptions) -> QueueResult<Self> {
        // Table names are spliced into SQL; the rest is checked by create_queue
        let names = std::iter::once(&options.queue_name)
            .chain(options.additional_columns.iter().map(|c| &c.name))
            .chain(options.additional_constraints.iter().map(|c| &c.name))
            .chain(options.additional_constraints.iter().flat_map(|c| c.columns.iter()));
        for name in names {
            if !is_identifier(name) {
                return Err(QueueError::Configuration(format!(
                    "'{name}' is not a valid identifier"
                )));
            }
        }
        let (event_broadcaster, _) = broadcast::channel(1000);

        Ok(Self {
            tables: TableNames::new(&options.queue_name),
            pool,
            options,
            held: Mutex::new(HashMap::new()),
            event_broadcaster,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Number of claims currently holding an open transaction
    pub async fn held_transactions(&self) -> usize {
        self.held.lock().await.len()
    }
}
