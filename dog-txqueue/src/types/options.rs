use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// Feature switches and schema extras for one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Table prefix / logical queue name
    pub queue_name: String,
    pub enable_priority: bool,
    pub enable_status: bool,
    /// Mirror status into a parallel table that can carry user columns
    pub enable_status_table: bool,
    pub enable_heartbeat: bool,
    pub enable_delayed_processing: bool,
    pub enable_message_expiration: bool,
    /// Keep the claim transaction open until commit or rollback
    pub enable_hold_transaction_until_committed: bool,
    pub enable_route: bool,
    pub additional_columns: Vec<ColumnDefinition>,
    pub additional_constraints: Vec<ConstraintDefinition>,
    pub heartbeat: HeartbeatOptions,
    /// Upper bound on rows deleted per expiration batch
    pub expiration_batch_size: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            enable_priority: false,
            enable_status: true,
            enable_status_table: false,
            enable_heartbeat: true,
            enable_delayed_processing: true,
            enable_message_expiration: true,
            enable_hold_transaction_until_committed: false,
            enable_route: false,
            additional_columns: Vec::new(),
            additional_constraints: Vec::new(),
            heartbeat: HeartbeatOptions::default(),
            expiration_batch_size: 50,
        }
    }
}

impl TransportOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Plain FIFO queue: no status, heartbeat, delay, expiration or priority
    pub fn fifo(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            enable_status: false,
            enable_heartbeat: false,
            enable_delayed_processing: false,
            enable_message_expiration: false,
            ..Self::default()
        }
    }

    /// Every optional feature on, heartbeat mode
    pub fn full(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            enable_priority: true,
            enable_status_table: true,
            enable_route: true,
            ..Self::default()
        }
    }

    /// Claims delete the record outright when nothing could roll them back
    pub fn destructive_receive(&self) -> bool {
        !self.enable_status
            && !self.enable_heartbeat
            && !self.enable_delayed_processing
            && !self.enable_hold_transaction_until_committed
    }

    pub fn rollback_supported(&self) -> bool {
        !self.destructive_receive()
    }

    pub fn validate(&self) -> ConfigurationValidation {
        match self.check() {
            Ok(()) => ConfigurationValidation::valid(),
            Err(message) => ConfigurationValidation::invalid(message),
        }
    }

    fn check(&self) -> Result<(), String> {
        if !is_identifier(&self.queue_name) {
            return Err(format!(
                "queue name '{}' must start with a letter or underscore and contain only letters, digits and underscores",
                self.queue_name
            ));
        }
        if self.enable_hold_transaction_until_committed && self.enable_heartbeat {
            return Err(
                "hold-transaction-until-committed and heartbeat are mutually exclusive".to_string(),
            );
        }
        if self.enable_heartbeat && !self.enable_status {
            return Err("heartbeat requires status tracking".to_string());
        }
        if self.enable_status_table && !self.enable_status {
            return Err("the status table requires status tracking".to_string());
        }
        if !self.additional_columns.is_empty() && !self.enable_status_table {
            return Err("additional columns require the status table".to_string());
        }
        if !self.additional_constraints.is_empty() && !self.enable_status_table {
            return Err("additional constraints require the status table".to_string());
        }

        let mut seen = HashSet::new();
        for column in &self.additional_columns {
            if !is_identifier(&column.name) {
                return Err(format!("invalid column name '{}'", column.name));
            }
            if RESERVED_COLUMNS.contains(&column.name.to_lowercase().as_str()) {
                return Err(format!("column name '{}' is reserved", column.name));
            }
            if !seen.insert(column.name.to_lowercase()) {
                return Err(format!("column '{}' is defined twice", column.name));
            }
        }
        for constraint in &self.additional_constraints {
            if !is_identifier(&constraint.name) {
                return Err(format!("invalid constraint name '{}'", constraint.name));
            }
            if constraint.columns.is_empty() {
                return Err(format!("constraint '{}' has no columns", constraint.name));
            }
            for column in &constraint.columns {
                let known = seen.contains(&column.to_lowercase())
                    || RESERVED_COLUMNS.contains(&column.to_lowercase().as_str());
                if !known {
                    return Err(format!(
                        "constraint '{}' references unknown column '{}'",
                        constraint.name, column
                    ));
                }
            }
        }

        if self.enable_heartbeat {
            self.heartbeat.check()?;
        }
        if self.expiration_batch_size == 0 {
            return Err("expiration batch size must be greater than zero".to_string());
        }
        Ok(())
    }
}

const RESERVED_COLUMNS: &[&str] = &["queue_id", "message_id", "status"];

/// True for `[A-Za-z_][A-Za-z0-9_]*`; names are spliced into DDL
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Heartbeat timing. A claim is considered dead once its heartbeat is older
/// than `monitor_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatOptions {
    #[serde(with = "crate::config::duration_ms")]
    pub interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub monitor_time: Duration,
    /// Cron schedule (seconds field first) for the reset sweep
    pub time_expression: Option<String>,
    /// Pushes the process time of recovered messages forward
    #[serde(with = "crate::config::option_duration_ms")]
    pub reset_delay: Option<Duration>,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            monitor_time: Duration::from_secs(60),
            time_expression: None,
            reset_delay: None,
        }
    }
}

impl HeartbeatOptions {
    fn check(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("heartbeat interval must be greater than zero".to_string());
        }
        if self.monitor_time <= self.interval {
            return Err(format!(
                "heartbeat monitor time ({:?}) must exceed the heartbeat interval ({:?})",
                self.monitor_time, self.interval
            ));
        }
        if let Some(expression) = &self.time_expression {
            cron::Schedule::from_str(expression)
                .map_err(|e| format!("invalid heartbeat time expression '{expression}': {e}"))?;
        }
        Ok(())
    }
}

/// User column on the status table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Text,
    Real,
    Boolean,
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Text => "TEXT",
            Self::Real => "REAL",
        }
    }
}

/// Index or unique constraint over status-table columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDefinition {
    pub name: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintKind {
    Index,
    Unique,
}

/// Outcome of option validation; callers decide whether to proceed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationValidation {
    pub valid: bool,
    pub error_message: Option<String>,
}

impl ConfigurationValidation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error_message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(TransportOptions::default().validate().valid);
        assert!(TransportOptions::fifo("jobs").validate().valid);
        assert!(TransportOptions::full("jobs").validate().valid);
    }

    #[test]
    fn hold_transaction_conflicts_with_heartbeat() {
        let options = TransportOptions {
            enable_hold_transaction_until_committed: true,
            ..TransportOptions::default()
        };
        let result = options.validate();
        assert!(!result.valid);
        assert!(result.error_message.unwrap().contains("mutually exclusive"));

        let options = TransportOptions {
            enable_hold_transaction_until_committed: true,
            enable_heartbeat: false,
            ..TransportOptions::default()
        };
        assert!(options.validate().valid);
    }

    #[test]
    fn monitor_time_must_exceed_interval() {
        let mut options = TransportOptions::default();
        options.heartbeat.interval = Duration::from_secs(30);
        options.heartbeat.monitor_time = Duration::from_secs(30);
        assert!(!options.validate().valid);
    }

    #[test]
    fn bad_time_expression_rejected() {
        let mut options = TransportOptions::default();
        options.heartbeat.time_expression = Some("every now and then".to_string());
        assert!(!options.validate().valid);

        options.heartbeat.time_expression = Some("*/5 * * * * *".to_string());
        assert!(options.validate().valid);
    }

    #[test]
    fn columns_need_status_table_and_valid_names() {
        let mut options = TransportOptions::default();
        options
            .additional_columns
            .push(ColumnDefinition::new("tenant", ColumnType::Text));
        assert!(!options.validate().valid);

        options.enable_status_table = true;
        assert!(options.validate().valid);

        options
            .additional_columns
            .push(ColumnDefinition::new("drop table", ColumnType::Text));
        assert!(!options.validate().valid);
    }

    #[test]
    fn constraint_must_reference_known_column() {
        let mut options = TransportOptions::full("jobs");
        options
            .additional_columns
            .push(ColumnDefinition::new("tenant", ColumnType::Text));
        options.additional_constraints.push(ConstraintDefinition {
            name: "ix_tenant".to_string(),
            kind: ConstraintKind::Index,
            columns: vec!["tenant".to_string(), "status".to_string()],
        });
        assert!(options.validate().valid);

        options.additional_constraints[0].columns.push("missing".to_string());
        assert!(!options.validate().valid);
    }

    #[test]
    fn destructive_receive_only_without_rollback_features() {
        assert!(TransportOptions::fifo("q").destructive_receive());
        assert!(!TransportOptions::default().destructive_receive());
        let delayed_only = TransportOptions {
            enable_delayed_processing: true,
            ..TransportOptions::fifo("q")
        };
        assert!(delayed_only.rollback_supported());
    }

    #[test]
    fn options_from_json() {
        let options: TransportOptions = serde_json::from_str(
            r#"{"queue_name":"orders","enable_priority":true,"heartbeat":{"interval":500,"monitor_time":2000}}"#,
        )
        .unwrap();
        assert_eq!(options.queue_name, "orders");
        assert!(options.enable_priority);
        assert_eq!(options.heartbeat.interval, Duration::from_millis(500));
        assert_eq!(options.heartbeat.reset_delay, None);
        assert!(options.validate().valid);
    }
}
