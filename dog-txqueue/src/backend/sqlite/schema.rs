//! Table layout for one queue.
//!
//! Every queue owns four tables, all prefixed with the queue name:
//!
//! | table | contents |
//! |---|---|
//! | `{q}_messages` | pending set, one row per message |
//! | `{q}_status` | status mirror plus user columns (status table only) |
//! | `{q}_error_tracking` | failure counts per (queue_id, exception type) |
//! | `{q}_errors` | poisoned messages |
//!
//! Timestamps are unix milliseconds. Columns for optional features always
//! exist and are ignored when the feature is off.

use crate::types::{ConstraintKind, TransportOptions};

/// Table names derived from a validated queue name
#[derive(Debug, Clone)]
pub struct TableNames {
    pub messages: String,
    pub status: String,
    pub error_tracking: String,
    pub errors: String,
}

impl TableNames {
    pub fn new(queue_name: &str) -> Self {
        Self {
            messages: format!("{queue_name}_messages"),
            status: format!("{queue_name}_status"),
            error_tracking: format!("{queue_name}_error_tracking"),
            errors: format!("{queue_name}_errors"),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [
            &self.messages,
            &self.status,
            &self.error_tracking,
            &self.errors,
        ]
    }
}

/// Column list returned by claims
pub const MESSAGE_COLUMNS: &str = "queue_id, message_id, correlation_id, body, headers, priority, \
     queue_process_time, expiration_time, heartbeat, lease_token, route, enqueued_at";

/// DDL statements, in execution order
pub fn create_statements(options: &TransportOptions, tables: &TableNames) -> Vec<String> {
    let q = &options.queue_name;
    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {messages} (
                queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                body BLOB NOT NULL,
                headers TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 128,
                status INTEGER NOT NULL DEFAULT 0,
                queue_process_time INTEGER NULL,
                expiration_time INTEGER NULL,
                heartbeat INTEGER NULL,
                lease_token TEXT NULL,
                route TEXT NULL,
                enqueued_at INTEGER NOT NULL
            )",
            messages = tables.messages
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_{q}_claim ON {messages} (status, priority, queue_id)",
            messages = tables.messages
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_{q}_message_id ON {messages} (message_id)",
            messages = tables.messages
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_{q}_expiration ON {messages} (expiration_time)",
            messages = tables.messages
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {tracking} (
                queue_id INTEGER NOT NULL,
                exception_type TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (queue_id, exception_type)
            )",
            tracking = tables.error_tracking
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {errors} (
                queue_id INTEGER PRIMARY KEY,
                message_id TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                body BLOB NOT NULL,
                headers TEXT NOT NULL,
                exception_type TEXT NOT NULL,
                last_exception TEXT NOT NULL,
                error_count INTEGER NOT NULL,
                failed_at INTEGER NOT NULL
            )",
            errors = tables.errors
        ),
    ];

    if options.enable_status_table {
        let mut columns = vec![
            "queue_id INTEGER PRIMARY KEY".to_string(),
            "message_id TEXT NOT NULL".to_string(),
            "status INTEGER NOT NULL DEFAULT 0".to_string(),
        ];
        for column in &options.additional_columns {
            let null = if column.nullable { "NULL" } else { "NOT NULL" };
            columns.push(format!("{} {} {null}", column.name, column.column_type.sql_type()));
        }
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {status} ({columns})",
            status = tables.status,
            columns = columns.join(", ")
        ));

        for constraint in &options.additional_constraints {
            let unique = match constraint.kind {
                ConstraintKind::Unique => "UNIQUE ",
                ConstraintKind::Index => "",
            };
            statements.push(format!(
                "CREATE {unique}INDEX IF NOT EXISTS {name} ON {status} ({columns})",
                name = constraint.name,
                status = tables.status,
                columns = constraint.columns.join(", ")
            ));
        }

        // Keep the mirror in step with every delete and status change
        statements.push(format!(
            "CREATE TRIGGER IF NOT EXISTS tr_{q}_delete AFTER DELETE ON {messages}
             BEGIN
                DELETE FROM {status} WHERE queue_id = OLD.queue_id;
             END",
            messages = tables.messages,
            status = tables.status
        ));
        statements.push(format!(
            "CREATE TRIGGER IF NOT EXISTS tr_{q}_status AFTER UPDATE OF status ON {messages}
             BEGIN
                UPDATE {status} SET status = NEW.status WHERE queue_id = NEW.queue_id;
             END",
            messages = tables.messages,
            status = tables.status
        ));
    }

    statements
}
