use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::{
    query::Query,
    sqlite::{SqliteArguments, SqliteRow},
    Row, Sqlite, Transaction,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{schema, HeldClaim, SqliteTransport};
use crate::{
    backend::{check_columns, dead_threshold, shift, BoxStream, TransportAdapter},
    types::{
        ColumnType, ColumnValue, CorrelationId, ErrorRecord, FailureDetails, Headers, LeaseToken,
        MessageEvent, MessageId, MessageState, MessageStatus, OutboundMessage, Priority, QueueCreationResult,
        QueueCreationStatus, QueueId, QueueRemoveResult, QueueRemoveStatus, ReceiveRequest,
        ReceivedMessage, ResetOutcome, SendResult, TransportOptions,
    },
    types::record::annotate_failure,
    QueueError, QueueResult,
};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &ColumnValue) -> SqliteQuery<'q> {
    match value {
        ColumnValue::Null => query.bind(Option::<i64>::None),
        ColumnValue::Bool(v) => query.bind(*v),
        ColumnValue::Integer(v) => query.bind(*v),
        ColumnValue::Real(v) => query.bind(*v),
        ColumnValue::Text(v) => query.bind(v.clone()),
    }
}

fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::<Utc>::from_timestamp_millis)
}

fn row_to_message(row: &SqliteRow) -> QueueResult<ReceivedMessage> {
    let headers: String = row.try_get("headers")?;
    let priority: i64 = row.try_get("priority")?;
    let correlation_id: String = row.try_get("correlation_id")?;

    Ok(ReceivedMessage {
        queue_id: QueueId(row.try_get("queue_id")?),
        message_id: MessageId::from(row.try_get::<String, _>("message_id")?),
        correlation_id: CorrelationId::parse(&correlation_id),
        body: Bytes::from(row.try_get::<Vec<u8>, _>("body")?),
        headers: Headers::from_json(&headers)?,
        priority: Priority(u8::try_from(priority).unwrap_or(u8::MAX)),
        queue_process_time: from_millis(row.try_get("queue_process_time")?),
        expiration_time: from_millis(row.try_get("expiration_time")?),
        heartbeat: from_millis(row.try_get("heartbeat")?),
        // Destructive claims never stamp a lease
        lease_token: row
            .try_get::<Option<String>, _>("lease_token")?
            .map(LeaseToken::from)
            .unwrap_or_default(),
        route: row.try_get("route")?,
        enqueued_at: from_millis(Some(row.try_get("enqueued_at")?)).unwrap_or_default(),
    })
}

fn row_to_error(row: &SqliteRow) -> QueueResult<ErrorRecord> {
    let headers: String = row.try_get("headers")?;
    let correlation_id: String = row.try_get("correlation_id")?;
    let error_count: i64 = row.try_get("error_count")?;
    let exception_type: String = row.try_get("exception_type")?;
    let last_exception: String = row.try_get("last_exception")?;

    Ok(ErrorRecord {
        queue_id: QueueId(row.try_get("queue_id")?),
        message_id: MessageId::from(row.try_get::<String, _>("message_id")?),
        correlation_id: CorrelationId::parse(&correlation_id),
        body: Bytes::from(row.try_get::<Vec<u8>, _>("body")?),
        headers: annotate_failure(Headers::from_json(&headers)?, &exception_type, &last_exception),
        exception_type,
        last_exception,
        error_count: u64::try_from(error_count).unwrap_or(0),
        failed_at: from_millis(Some(row.try_get("failed_at")?)).unwrap_or_default(),
    })
}

/// Transient errors stay transient so the retry wrapper can see them
fn send_error(correlation_id: &CorrelationId, err: QueueError) -> QueueError {
    if err.is_transient() {
        return err;
    }
    QueueError::Send {
        correlation_id: correlation_id.to_string(),
        reason: err.to_string(),
    }
}

/// SQL plus positional arguments for one claim
struct ClaimQuery {
    sql: String,
    args: Vec<ColumnValue>,
}

impl SqliteTransport {
    fn claim_query(&self, request: &ReceiveRequest, now: DateTime<Utc>) -> ClaimQuery {
        let options = &self.options;
        let now_ms = now.timestamp_millis();
        let mut filter: Vec<String> = Vec::new();
        let mut args = Vec::new();

        if options.enable_heartbeat {
            filter.push(
                "(status = 0 OR (status = 1 AND (heartbeat IS NULL OR heartbeat < ?)))".to_string(),
            );
            args.push(ColumnValue::Integer(
                dead_threshold(options, now).timestamp_millis(),
            ));
        } else {
            filter.push("status = 0".to_string());
        }
        if options.enable_message_expiration {
            filter.push("(expiration_time IS NULL OR expiration_time > ?)".to_string());
            args.push(ColumnValue::Integer(now_ms));
        }

        match request.message_id.as_ref().and_then(|id| id.as_str()) {
            Some(message_id) => {
                filter.push("message_id = ?".to_string());
                args.push(ColumnValue::Text(message_id.to_string()));
            }
            None => {
                if options.enable_delayed_processing {
                    filter.push("(queue_process_time IS NULL OR queue_process_time <= ?)".to_string());
                    args.push(ColumnValue::Integer(now_ms));
                }
                if options.enable_route && !request.routes.is_empty() {
                    let placeholders = vec!["?"; request.routes.len()].join(", ");
                    filter.push(format!("route IN ({placeholders})"));
                    args.extend(request.routes.iter().cloned().map(ColumnValue::Text));
                }
            }
        }

        let order = if options.enable_priority {
            "priority ASC, queue_id ASC"
        } else {
            "queue_id ASC"
        };
        let select = format!(
            "SELECT queue_id FROM {messages} WHERE {filter} ORDER BY {order} LIMIT 1",
            messages = self.tables.messages,
            filter = filter.join(" AND "),
        );

        let sql = if options.destructive_receive() {
            format!(
                "DELETE FROM {messages} WHERE queue_id = ({select}) RETURNING {columns}",
                messages = self.tables.messages,
                columns = schema::MESSAGE_COLUMNS,
            )
        } else {
            args.insert(0, ColumnValue::Text(LeaseToken::new().0));
            args.insert(0, ColumnValue::Integer(now_ms));
            format!(
                "UPDATE {messages} SET status = 1, heartbeat = ?, lease_token = ? \
                 WHERE queue_id = ({select}) RETURNING {columns}",
                messages = self.tables.messages,
                columns = schema::MESSAGE_COLUMNS,
            )
        };

        ClaimQuery { sql, args }
    }

    /// The held claim transaction for a message, or a fresh one. `None` when
    /// the message is held under another lease.
    async fn finishing_transaction(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
    ) -> QueueResult<Option<Transaction<'static, Sqlite>>> {
        let mut held = self.held.lock().await;
        if let Some(claim) = held.remove(&queue_id) {
            if &claim.lease_token == lease_token {
                return Ok(Some(claim.tx));
            }
            held.insert(queue_id, claim);
            return Ok(None);
        }
        drop(held);
        Ok(Some(self.pool.begin().await?))
    }

    async fn insert(&self, message: OutboundMessage, correlation_id: CorrelationId, now: DateTime<Utc>) -> QueueResult<SendResult> {
        let options = &self.options;
        let route = if options.enable_route {
            message.route()
        } else {
            None
        };
        let send = message.options;

        check_columns(options, &send.additional_columns).map_err(QueueError::Backend)?;

        let message_id = send
            .message_id
            .clone()
            .filter(MessageId::has_value)
            .unwrap_or_else(MessageId::new);
        let priority = if options.enable_priority {
            send.priority.unwrap_or_default()
        } else {
            Priority::default()
        };
        let process_time = options
            .enable_delayed_processing
            .then(|| shift(now, send.delay.unwrap_or_default()).timestamp_millis());
        let expiration_time = if options.enable_message_expiration {
            send.expiration.map(|window| shift(now, window).timestamp_millis())
        } else {
            None
        };

        let sql = format!(
            "INSERT INTO {messages} (message_id, correlation_id, body, headers, priority, status, \
             queue_process_time, expiration_time, heartbeat, lease_token, route, enqueued_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, NULL, NULL, ?, ?) RETURNING queue_id",
            messages = self.tables.messages
        );

        let mut tx = self.pool.begin().await?;
        let queue_id: i64 = sqlx::query_scalar(&sql)
            .bind(message_id.as_str().unwrap_or_default().to_string())
            .bind(correlation_id.to_string())
            .bind(message.body.to_vec())
            .bind(message.headers.to_json())
            .bind(i64::from(priority.value()))
            .bind(process_time)
            .bind(expiration_time)
            .bind(route)
            .bind(now.timestamp_millis())
            .fetch_one(&mut *tx)
            .await?;

        if options.enable_status_table {
            let mut names = vec!["queue_id".to_string(), "message_id".to_string(), "status".to_string()];
            let mut values = vec![
                ColumnValue::Integer(queue_id),
                ColumnValue::Text(message_id.as_str().unwrap_or_default().to_string()),
                ColumnValue::Integer(MessageStatus::Waiting.as_i64()),
            ];
            for column in &options.additional_columns {
                if let Some(value) = send.additional_columns.get(&column.name) {
                    names.push(column.name.clone());
                    values.push(value.clone());
                }
            }
            let sql = format!(
                "INSERT INTO {status} ({names}) VALUES ({placeholders})",
                status = self.tables.status,
                names = names.join(", "),
                placeholders = vec!["?"; values.len()].join(", "),
            );
            values
                .iter()
                .fold(sqlx::query(&sql), bind_value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(SendResult {
            queue_id: QueueId(queue_id),
            message_id,
            correlation_id,
        })
    }

    /// User columns of a message's status row
    pub async fn status_columns(&self, queue_id: QueueId) -> QueueResult<Option<BTreeMap<String, ColumnValue>>> {
        if !self.options.enable_status_table {
            return Ok(None);
        }
        let sql = format!("SELECT * FROM {} WHERE queue_id = ?", self.tables.status);
        let Some(row) = sqlx::query(&sql)
            .bind(queue_id.get())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let mut values = BTreeMap::new();
        for column in &self.options.additional_columns {
            let name = column.name.as_str();
            let value = match column.column_type {
                ColumnType::Integer => row.try_get::<Option<i64>, _>(name)?.map(ColumnValue::Integer),
                ColumnType::Boolean => row.try_get::<Option<bool>, _>(name)?.map(ColumnValue::Bool),
                ColumnType::Real => row.try_get::<Option<f64>, _>(name)?.map(ColumnValue::Real),
                ColumnType::Text => row.try_get::<Option<String>, _>(name)?.map(ColumnValue::Text),
            };
            values.insert(column.name.clone(), value.unwrap_or(ColumnValue::Null));
        }
        Ok(Some(values))
    }

    /// Mirrored status of a message, when the status table is on
    pub async fn status_row(&self, queue_id: QueueId) -> QueueResult<Option<MessageStatus>> {
        if !self.options.enable_status_table {
            return Ok(None);
        }
        let sql = format!("SELECT status FROM {} WHERE queue_id = ?", self.tables.status);
        let status: Option<i64> = sqlx::query_scalar(&sql)
            .bind(queue_id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.and_then(MessageStatus::from_i64))
    }

    fn emit(&self, event: MessageEvent) {
        let _ = self.event_broadcaster.send(event);
    }
}

#[async_trait]
impl TransportAdapter for SqliteTransport {
    fn options(&self) -> &TransportOptions {
        &self.options
    }

    async fn create_queue(&self) -> QueueResult<QueueCreationResult> {
        let validation = self.options.validate();
        if !validation.valid {
            return Ok(QueueCreationResult::failed(
                QueueCreationStatus::InvalidConfiguration,
                validation.error_message.unwrap_or_default(),
            ));
        }
        if self.queue_exists().await? {
            return Ok(QueueCreationResult::already_exists());
        }

        let created: QueueResult<()> = async {
            let mut tx = self.pool.begin().await?;
            for statement in schema::create_statements(&self.options, &self.tables) {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match created {
            Ok(()) => {
                info!(queue = %self.options.queue_name, "Created sqlite queue");
                Ok(QueueCreationResult::created())
            }
            Err(err) if err.is_transient() => Err(err),
            Err(err) => Ok(QueueCreationResult::failed(
                QueueCreationStatus::BackendError,
                err.to_string(),
            )),
        }
    }

    async fn remove_queue(&self) -> QueueResult<QueueRemoveResult> {
        if !self.queue_exists().await? {
            return Ok(QueueRemoveResult {
                status: QueueRemoveStatus::DoesNotExist,
            });
        }

        let mut held = self.held.lock().await;
        for (_, claim) in held.drain() {
            claim.tx.rollback().await?;
        }
        drop(held);

        let mut tx = self.pool.begin().await?;
        for table in self.tables.all() {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(queue = %self.options.queue_name, "Removed sqlite queue");
        Ok(QueueRemoveResult {
            status: QueueRemoveStatus::Removed,
        })
    }

    async fn queue_exists(&self) -> QueueResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(&self.tables.messages)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn send(&self, message: OutboundMessage) -> QueueResult<SendResult> {
        let now = Utc::now();
        let correlation_id = message
            .options
            .correlation_id
            .unwrap_or_else(CorrelationId::new);

        let result = self
            .insert(message, correlation_id, now)
            .await
            .map_err(|err| send_error(&correlation_id, err))?;

        self.emit(MessageEvent::Sent {
            queue_id: result.queue_id,
            message_id: result.message_id.clone(),
            queue: self.options.queue_name.clone(),
            at: now,
        });
        Ok(result)
    }

    async fn receive(&self, request: &ReceiveRequest) -> QueueResult<Option<ReceivedMessage>> {
        if request.message_id.as_ref().is_some_and(|id| !id.has_value()) {
            return Ok(None);
        }

        let now = Utc::now();
        let claim = self.claim_query(request, now);
        let query = claim.args.iter().fold(sqlx::query(&claim.sql), bind_value);

        let message = if self.options.enable_hold_transaction_until_committed {
            let mut tx = self.pool.begin().await?;
            match query.fetch_optional(&mut *tx).await? {
                Some(row) => {
                    let message = row_to_message(&row)?;
                    let claim = HeldClaim {
                        lease_token: message.lease_token.clone(),
                        tx,
                    };
                    self.held.lock().await.insert(message.queue_id, claim);
                    Some(message)
                }
                None => {
                    tx.rollback().await?;
                    None
                }
            }
        } else {
            query
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row_to_message(&row))
                .transpose()?
        };

        if let Some(message) = &message {
            debug!(queue_id = %message.queue_id, "claimed message");
            self.emit(MessageEvent::Claimed {
                queue_id: message.queue_id,
                message_id: message.message_id.clone(),
                at: now,
            });
        }
        Ok(message)
    }

    async fn delete(&self, queue_id: QueueId, lease_token: &LeaseToken) -> QueueResult<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE queue_id = ? AND status = 1 AND lease_token = ?",
            self.tables.messages
        );
        let Some(mut tx) = self.finishing_transaction(queue_id, lease_token).await? else {
            return Ok(false);
        };
        let deleted = sqlx::query(&sql)
            .bind(queue_id.get())
            .bind(lease_token.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;

        if deleted {
            self.emit(MessageEvent::Committed {
                queue_id,
                at: Utc::now(),
            });
        }
        Ok(deleted)
    }

    async fn update_status(&self, queue_id: QueueId, status: MessageStatus) -> QueueResult<bool> {
        let sql = format!("UPDATE {} SET status = ? WHERE queue_id = ?", self.tables.messages);
        let updated = sqlx::query(&sql)
            .bind(status.as_i64())
            .bind(queue_id.get())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    async fn rollback(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        delay: Option<Duration>,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        let visible_at = if self.options.enable_delayed_processing {
            delay.map(|delay| shift(now, delay))
        } else {
            None
        };

        // In held mode the release is committed with the claim transaction,
        // keeping any error counts recorded inside it
        let sql = format!(
            "UPDATE {} SET status = 0, heartbeat = NULL, lease_token = NULL, \
             queue_process_time = COALESCE(?, queue_process_time) \
             WHERE queue_id = ? AND status = 1 AND lease_token = ?",
            self.tables.messages
        );
        let Some(mut tx) = self.finishing_transaction(queue_id, lease_token).await? else {
            return Ok(false);
        };
        let released = sqlx::query(&sql)
            .bind(visible_at.map(|at| at.timestamp_millis()))
            .bind(queue_id.get())
            .bind(lease_token.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;

        if released {
            self.emit(MessageEvent::RolledBack {
                queue_id,
                visible_at,
                at: now,
            });
        }
        Ok(released)
    }

    async fn send_heartbeat(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
    ) -> QueueResult<Option<DateTime<Utc>>> {
        let sql = format!(
            "UPDATE {} SET heartbeat = ? WHERE queue_id = ? AND status = 1 AND lease_token = ? \
             RETURNING heartbeat",
            self.tables.messages
        );
        let beat: Option<i64> = sqlx::query_scalar(&sql)
            .bind(Utc::now().timestamp_millis())
            .bind(queue_id.get())
            .bind(lease_token.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(from_millis(beat))
    }

    async fn get_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64> {
        let sql = format!(
            "SELECT retry_count FROM {} WHERE queue_id = ? AND exception_type = ?",
            self.tables.error_tracking
        );
        let query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(queue_id.get())
            .bind(exception_type);

        // A held claim sees its own uncommitted increments
        let mut held = self.held.lock().await;
        let count = match held.get_mut(&queue_id) {
            Some(claim) => query.fetch_optional(&mut *claim.tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(count.map_or(0, |c| u64::try_from(c).unwrap_or(0)))
    }

    async fn increment_error_count(&self, queue_id: QueueId, exception_type: &str) -> QueueResult<u64> {
        let sql = format!(
            "INSERT INTO {} (queue_id, exception_type, retry_count) VALUES (?, ?, 1) \
             ON CONFLICT (queue_id, exception_type) DO UPDATE SET retry_count = retry_count + 1 \
             RETURNING retry_count",
            self.tables.error_tracking
        );
        let query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(queue_id.get())
            .bind(exception_type);

        let mut held = self.held.lock().await;
        let count = match held.get_mut(&queue_id) {
            Some(claim) => query.fetch_one(&mut *claim.tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn total_error_count(&self) -> QueueResult<u64> {
        let sql = format!(
            "SELECT COALESCE(SUM(retry_count), 0) FROM {}",
            self.tables.error_tracking
        );
        let total: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn purge_error_tracking(&self, queue_id: QueueId) -> QueueResult<u64> {
        let sql = format!("DELETE FROM {} WHERE queue_id = ?", self.tables.error_tracking);
        let removed = sqlx::query(&sql)
            .bind(queue_id.get())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn move_to_error(
        &self,
        queue_id: QueueId,
        lease_token: &LeaseToken,
        details: &FailureDetails,
    ) -> QueueResult<bool> {
        let now = Utc::now();
        let copy = format!(
            "INSERT OR REPLACE INTO {errors} (queue_id, message_id, correlation_id, body, headers, \
             exception_type, last_exception, error_count, failed_at) \
             SELECT queue_id, message_id, correlation_id, body, headers, ?, ?, ?, ? \
             FROM {messages} WHERE queue_id = ? AND status = 1 AND lease_token = ?",
            errors = self.tables.errors,
            messages = self.tables.messages
        );
        let delete = format!("DELETE FROM {} WHERE queue_id = ?", self.tables.messages);

        let Some(mut tx) = self.finishing_transaction(queue_id, lease_token).await? else {
            return Ok(false);
        };
        let moved = sqlx::query(&copy)
            .bind(&details.exception_type)
            .bind(&details.message)
            .bind(i64::try_from(details.error_count).unwrap_or(i64::MAX))
            .bind(now.timestamp_millis())
            .bind(queue_id.get())
            .bind(lease_token.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        if moved {
            sqlx::query(&delete)
                .bind(queue_id.get())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if moved {
            self.emit(MessageEvent::Poisoned {
                queue_id,
                exception_type: details.exception_type.clone(),
                at: now,
            });
        }
        Ok(moved)
    }

    async fn error_records(&self) -> QueueResult<Vec<ErrorRecord>> {
        let sql = format!("SELECT * FROM {} ORDER BY queue_id", self.tables.errors);
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_error)
            .collect()
    }

    async fn clear_expired_messages(&self, cancel: &CancellationToken) -> QueueResult<u64> {
        if !self.options.enable_message_expiration {
            return Ok(0);
        }

        let batch_size = i64::from(self.options.expiration_batch_size.max(1));
        let sql = format!(
            "DELETE FROM {messages} WHERE queue_id IN (\
                SELECT queue_id FROM {messages} \
                WHERE status = 0 AND expiration_time IS NOT NULL AND expiration_time <= ? \
                ORDER BY queue_id LIMIT ?) \
             RETURNING queue_id",
            messages = self.tables.messages
        );

        let mut total = 0u64;
        while !cancel.is_cancelled() {
            let now = Utc::now();
            let removed: Vec<i64> = sqlx::query_scalar(&sql)
                .bind(now.timestamp_millis())
                .bind(batch_size)
                .fetch_all(&self.pool)
                .await?;

            for queue_id in &removed {
                self.emit(MessageEvent::Expired {
                    queue_id: QueueId(*queue_id),
                    at: now,
                });
            }
            total += removed.len() as u64;
            if (removed.len() as i64) < batch_size {
                break;
            }
        }
        Ok(total)
    }

    async fn reset_heartbeats(&self, cancel: &CancellationToken) -> QueueResult<Vec<ResetOutcome>> {
        if !self.options.enable_heartbeat || cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let visible_at = self
            .options
            .heartbeat
            .reset_delay
            .filter(|_| self.options.enable_delayed_processing)
            .map(|delay| shift(now, delay).timestamp_millis());
        let sql = format!(
            "UPDATE {} SET status = 0, heartbeat = NULL, lease_token = NULL, \
             queue_process_time = COALESCE(?, queue_process_time) \
             WHERE status = 1 AND (heartbeat IS NULL OR heartbeat < ?) \
             RETURNING queue_id, message_id",
            self.tables.messages
        );

        let rows = sqlx::query(&sql)
            .bind(visible_at)
            .bind(dead_threshold(&self.options, now).timestamp_millis())
            .fetch_all(&self.pool)
            .await?;

        let mut reset = Vec::with_capacity(rows.len());
        for row in &rows {
            let queue_id = QueueId(row.try_get("queue_id")?);
            reset.push(ResetOutcome {
                queue_id,
                message_id: MessageId::from(row.try_get::<String, _>("message_id")?),
                reset_at: now,
            });
            self.emit(MessageEvent::HeartbeatReset { queue_id, at: now });
        }
        Ok(reset)
    }

    async fn count(&self, state: MessageState) -> QueueResult<u64> {
        let sql = match state {
            MessageState::Pending => format!("SELECT COUNT(*) FROM {}", self.tables.messages),
            MessageState::Waiting => format!("SELECT COUNT(*) FROM {} WHERE status = 0", self.tables.messages),
            MessageState::Processing => format!("SELECT COUNT(*) FROM {} WHERE status = 1", self.tables.messages),
            MessageState::Error => format!("SELECT COUNT(*) FROM {}", self.tables.errors),
        };
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn event_stream(&self) -> BoxStream<MessageEvent> {
        let receiver = self.event_broadcaster.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }
}
