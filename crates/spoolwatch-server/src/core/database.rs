use anyhow::{Context, Result};
use spoolwatch_model::{
    AuditAction, AuditLogEntry, DeliveryAttempt, EventKind, LogEvent, LogSource,
    MessageId, MessageStatus, MessageStatusRecord, NewAuditEntry,
    NewDeliveryAttempt, QueueSnapshot
};
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::debug;

use super::store::{AuditQuery, EventQuery, Repository};

const SCHEMA: &str = include_str!("schema.sql");

/// Rows per multi-row INSERT; keeps placeholders well under the MySQL limit.
const INSERT_CHUNK: usize = 500;
const PURGE_CHUNK: u64 = 10_000;

const EVENT_COLUMNS: &str = "occurred_at, message_id, source, kind, host, host_address, sender, recipients, size, status, error_code, error_text, confirmation, raw_line, ingested_at";

const ATTEMPT_COLUMNS: &str = "message_id, recipient, sequence, attempted_at, host, host_address, response_code, response_text, outcome";

const AUDIT_COLUMNS: &str =
    "id, created_at, action, message_id, actor_id, source_address, detail";

#[derive(Debug, Clone)]
pub struct Database {
    pool: MySqlPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("failed to open mysql pool")?;

        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("database ping failed")?;

        Ok(Self { pool })
    }

    /// Creates missing tables. Existing tables are left untouched.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    async fn purge_before(
        &self,
        table: &str,
        column: &str,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        let sql =
            format!("DELETE FROM {table} WHERE {column} < ? LIMIT {PURGE_CHUNK}");
        let mut total = 0;

        loop {
            let result = sqlx::query(&sql)
                .bind(to_db_time(cutoff))
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to purge {table}"))?;
            total += result.rows_affected();
            if result.rows_affected() < PURGE_CHUNK {
                break;
            }
        }

        debug!("db purge: table={}, rows_deleted={}", table, total);
        Ok(total)
    }
}

impl Repository for Database {
    async fn insert_events(
        &self,
        events: &[LogEvent],
    ) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("failed to begin tx")?;
        let mut inserted = 0;

        for chunk in events.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<MySql>::new(format!(
                "INSERT INTO log_events ({EVENT_COLUMNS}) "
            ));
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(to_db_time(event.timestamp))
                    .push_bind(event.message_id.as_ref().map(MessageId::as_str))
                    .push_bind(event.source.as_str())
                    .push_bind(event.kind.as_str())
                    .push_bind(event.host.as_deref())
                    .push_bind(event.host_address.as_deref())
                    .push_bind(event.sender.as_deref())
                    .push_bind(encode_recipients(event.recipients.as_deref()))
                    .push_bind(event.size)
                    .push_bind(event.status.as_deref())
                    .push_bind(event.error_code.as_deref())
                    .push_bind(event.error_text.as_deref())
                    .push_bind(event.confirmation.as_deref())
                    .push_bind(event.raw_line.as_str())
                    .push_bind(to_db_time(event.ingested_at));
            });

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .context("failed to insert log_events")?;
            inserted += result.rows_affected();
        }

        tx.commit().await.context("failed to commit tx")?;
        debug!("db insert log_events: rows_affected={}", inserted);
        Ok(inserted)
    }

    async fn advance_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin tx")?;

        // The row lock serializes concurrent writers for the same message.
        let current = sqlx::query_scalar::<_, u8>(
            "SELECT status_rank FROM message_status WHERE message_id = ? FOR UPDATE",
        )
        .bind(message_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .context("failed to read message_status")?;

        if current.is_some_and(|rank| status.rank() <= rank) {
            tx.rollback().await.context("failed to rollback tx")?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO message_status (message_id, status, status_rank, updated_at) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE status = VALUES(status), status_rank = VALUES(status_rank), updated_at = VALUES(updated_at)",
        )
        .bind(message_id.as_str())
        .bind(status.as_str())
        .bind(status.rank())
        .bind(to_db_time(at))
        .execute(&mut *tx)
        .await
        .context("failed to advance message_status")?;

        tx.commit().await.context("failed to commit tx")?;
        Ok(true)
    }

    async fn thaw_message_status(
        &self,
        message_id: &MessageId,
        at: OffsetDateTime,
    ) -> Result<bool> {
        let queued = MessageStatus::Queued;
        let result = sqlx::query(
            "UPDATE message_status SET status = ?, status_rank = ?, updated_at = ? \
             WHERE message_id = ? AND status = ?",
        )
        .bind(queued.as_str())
        .bind(queued.rank())
        .bind(to_db_time(at))
        .bind(message_id.as_str())
        .bind(MessageStatus::Frozen.as_str())
        .execute(&self.pool)
        .await
        .context("failed to thaw message_status")?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_message_status(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
        at: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO message_status (message_id, status, status_rank, updated_at) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE status = VALUES(status), status_rank = VALUES(status_rank), updated_at = VALUES(updated_at)",
        )
        .bind(message_id.as_str())
        .bind(status.as_str())
        .bind(status.rank())
        .bind(to_db_time(at))
        .execute(&self.pool)
        .await
        .context("failed to set message_status")?;
        Ok(())
    }

    async fn insert_delivery_attempt(
        &self,
        attempt: NewDeliveryAttempt,
    ) -> Result<DeliveryAttempt> {
        let mut tx = self.pool.begin().await.context("failed to begin tx")?;

        let last = sqlx::query_scalar::<_, u64>(
            "SELECT CAST(COALESCE(MAX(sequence), 0) AS UNSIGNED) FROM delivery_attempts \
             WHERE message_id = ? AND recipient <=> ? FOR UPDATE",
        )
        .bind(attempt.message_id.as_str())
        .bind(attempt.recipient.as_deref())
        .fetch_one(&mut *tx)
        .await
        .context("failed to query delivery_attempts sequence")?;

        let sequence = u32::try_from(last + 1)
            .context("delivery attempt sequence overflow")?;

        sqlx::query(&format!(
            "INSERT INTO delivery_attempts ({ATTEMPT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(attempt.message_id.as_str())
        .bind(attempt.recipient.as_deref())
        .bind(sequence)
        .bind(to_db_time(attempt.attempted_at))
        .bind(attempt.host.as_deref())
        .bind(attempt.host_address.as_deref())
        .bind(attempt.response_code.as_deref())
        .bind(attempt.response_text.as_deref())
        .bind(attempt.outcome.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to insert delivery_attempts")?;

        tx.commit().await.context("failed to commit tx")?;
        Ok(attempt.with_sequence(sequence))
    }

    async fn insert_audit_entry(
        &self,
        entry: NewAuditEntry,
    ) -> Result<AuditLogEntry> {
        let detail = serde_json::to_string(&entry.detail)
            .context("failed to serialize audit detail")?;

        let result = sqlx::query(
            "INSERT INTO audit_log (created_at, action, message_id, actor_id, source_address, detail) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(to_db_time(entry.created_at))
        .bind(entry.action.as_str())
        .bind(entry.message_id.as_ref().map(MessageId::as_str))
        .bind(&entry.actor_id)
        .bind(entry.source_address.as_deref())
        .bind(detail)
        .execute(&self.pool)
        .await
        .context("failed to insert audit_log")?;

        Ok(entry.stored(result.last_insert_id()))
    }

    async fn insert_queue_snapshot(
        &self,
        snapshot: &QueueSnapshot,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_snapshots (taken_at, total, deferred, frozen, oldest_age_secs) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(to_db_time(snapshot.taken_at))
        .bind(snapshot.total)
        .bind(snapshot.deferred)
        .bind(snapshot.frozen)
        .bind(snapshot.oldest_age_secs)
        .execute(&self.pool)
        .await
        .context("failed to insert queue_snapshots")?;
        Ok(())
    }

    async fn events_for_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<LogEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM log_events WHERE message_id = ? ORDER BY occurred_at, id"
        ))
        .bind(message_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to query log_events")?;

        rows.iter().map(event_from_row).collect()
    }

    async fn query_events(
        &self,
        query: &EventQuery,
    ) -> Result<Vec<LogEvent>> {
        let mut builder = QueryBuilder::<MySql>::new(format!(
            "SELECT {EVENT_COLUMNS} FROM log_events WHERE 1 = 1"
        ));
        if let Some(message_id) = &query.message_id {
            builder.push(" AND message_id = ").push_bind(message_id.as_str());
        }
        if let Some(source) = query.source {
            builder.push(" AND source = ").push_bind(source.as_str());
        }
        if let Some(kind) = query.kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(since) = query.since {
            builder.push(" AND occurred_at >= ").push_bind(to_db_time(since));
        }
        if let Some(until) = query.until {
            builder.push(" AND occurred_at < ").push_bind(to_db_time(until));
        }
        builder
            .push(" ORDER BY occurred_at, id LIMIT ")
            .push_bind(query.effective_limit());

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to query log_events")?;

        rows.iter().map(event_from_row).collect()
    }

    async fn delivery_attempts(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM delivery_attempts WHERE message_id = ? ORDER BY recipient, sequence"
        ))
        .bind(message_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("failed to query delivery_attempts")?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn message_status(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<MessageStatusRecord>> {
        let row = sqlx::query(
            "SELECT status, updated_at FROM message_status WHERE message_id = ? LIMIT 1",
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("failed to query message_status")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(MessageStatusRecord {
            message_id: message_id.clone(),
            status: row.try_get::<String, _>("status")?.parse()?,
            updated_at: from_db_time(row.try_get("updated_at")?),
        }))
    }

    async fn audit_entries(
        &self,
        query: &AuditQuery,
    ) -> Result<Vec<AuditLogEntry>> {
        let mut builder = QueryBuilder::<MySql>::new(format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE 1 = 1"
        ));
        if let Some(action) = query.action {
            builder.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(actor_id) = &query.actor_id {
            builder.push(" AND actor_id = ").push_bind(actor_id.as_str());
        }
        if let Some(message_id) = &query.message_id {
            builder.push(" AND message_id = ").push_bind(message_id.as_str());
        }
        if let Some(since) = query.since {
            builder.push(" AND created_at >= ").push_bind(to_db_time(since));
        }
        builder
            .push(" ORDER BY id DESC LIMIT ")
            .push_bind(query.effective_limit());

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to query audit_log")?;

        rows.iter().map(audit_from_row).collect()
    }

    async fn queue_snapshots(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<QueueSnapshot>> {
        let rows = sqlx::query(
            "SELECT taken_at, total, deferred, frozen, oldest_age_secs FROM queue_snapshots WHERE taken_at >= ? ORDER BY taken_at",
        )
        .bind(to_db_time(since))
        .fetch_all(&self.pool)
        .await
        .context("failed to query queue_snapshots")?;

        rows.iter()
            .map(|row| {
                Ok(QueueSnapshot {
                    taken_at: from_db_time(row.try_get("taken_at")?),
                    total: row.try_get("total")?,
                    deferred: row.try_get("deferred")?,
                    frozen: row.try_get("frozen")?,
                    oldest_age_secs: row.try_get("oldest_age_secs")?,
                })
            })
            .collect()
    }

    async fn purge_events_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        self.purge_before("log_events", "occurred_at", cutoff).await
    }

    async fn purge_audit_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        self.purge_before("audit_log", "created_at", cutoff).await
    }

    async fn purge_snapshots_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        self.purge_before("queue_snapshots", "taken_at", cutoff).await
    }

    async fn purge_attempts_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        self.purge_before("delivery_attempts", "attempted_at", cutoff).await
    }

    async fn purge_statuses_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<u64> {
        self.purge_before("message_status", "updated_at", cutoff).await
    }
}

fn event_from_row(row: &MySqlRow) -> Result<LogEvent> {
    let message_id = row
        .try_get::<Option<String>, _>("message_id")?
        .map(|value| MessageId::parse(&value))
        .transpose()
        .context("stored message_id is malformed")?;
    let recipients = row
        .try_get::<Option<String>, _>("recipients")?
        .map(|value| serde_json::from_str::<Vec<String>>(&value))
        .transpose()
        .context("stored recipients are malformed")?;

    Ok(LogEvent {
        timestamp: from_db_time(row.try_get("occurred_at")?),
        message_id,
        source: row.try_get::<String, _>("source")?.parse::<LogSource>()?,
        kind: row.try_get::<String, _>("kind")?.parse::<EventKind>()?,
        host: row.try_get("host")?,
        host_address: row.try_get("host_address")?,
        sender: row.try_get("sender")?,
        recipients,
        size: row.try_get("size")?,
        status: row.try_get("status")?,
        error_code: row.try_get("error_code")?,
        error_text: row.try_get("error_text")?,
        confirmation: row.try_get("confirmation")?,
        raw_line: row.try_get("raw_line")?,
        ingested_at: from_db_time(row.try_get("ingested_at")?),
    })
}

fn attempt_from_row(row: &MySqlRow) -> Result<DeliveryAttempt> {
    Ok(DeliveryAttempt {
        message_id: MessageId::parse(&row.try_get::<String, _>("message_id")?)?,
        recipient: row.try_get("recipient")?,
        sequence: row.try_get("sequence")?,
        attempted_at: from_db_time(row.try_get("attempted_at")?),
        host: row.try_get("host")?,
        host_address: row.try_get("host_address")?,
        response_code: row.try_get("response_code")?,
        response_text: row.try_get("response_text")?,
        outcome: row.try_get::<String, _>("outcome")?.parse()?,
    })
}

fn audit_from_row(row: &MySqlRow) -> Result<AuditLogEntry> {
    let detail: String = row.try_get("detail")?;
    Ok(AuditLogEntry {
        id: row.try_get("id")?,
        created_at: from_db_time(row.try_get("created_at")?),
        action: row.try_get::<String, _>("action")?.parse::<AuditAction>()?,
        message_id: row
            .try_get::<Option<String>, _>("message_id")?
            .map(|value| MessageId::parse(&value))
            .transpose()?,
        actor_id: row.try_get("actor_id")?,
        source_address: row.try_get("source_address")?,
        detail: serde_json::from_str(&detail)
            .context("stored audit detail is malformed")?,
    })
}

fn encode_recipients(recipients: Option<&[String]>) -> Option<String> {
    recipients.and_then(|list| serde_json::to_string(list).ok())
}

fn to_db_time(value: OffsetDateTime) -> PrimitiveDateTime {
    let utc = value.to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

fn from_db_time(value: PrimitiveDateTime) -> OffsetDateTime {
    value.assume_utc()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn db_time_round_trips_through_utc() {
        let local = datetime!(2024-01-01 14:00:00 +02:00);
        let stored = to_db_time(local);
        assert_eq!(stored, datetime!(2024-01-01 12:00:00));
        assert_eq!(from_db_time(stored), local);
    }

    #[test]
    fn recipients_are_stored_as_json_text() {
        let list = vec!["a@example.org".to_string(), "b@example.org".to_string()];
        assert_eq!(
            encode_recipients(Some(&list)).as_deref(),
            Some(r#"["a@example.org","b@example.org"]"#)
        );
        assert_eq!(encode_recipients(None), None);
        assert_eq!(encode_recipients(Some(&[])).as_deref(), Some("[]"));
    }

    #[test]
    fn schema_creates_every_table() {
        for table in [
            "log_events",
            "message_status",
            "delivery_attempts",
            "audit_log",
            "queue_snapshots",
        ] {
            assert!(
                SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
                "missing {table}"
            );
        }
    }
}
