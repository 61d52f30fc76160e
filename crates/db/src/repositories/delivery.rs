use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use relaydesk_core::domain::delivery::{DeliveryAttempt, DeliveryRecord, DeliveryStatus};
use relaydesk_core::domain::request::RequestId;

use super::codec::{
    encode_map, encode_optional_timestamp, encode_timestamp, parse_integration, parse_json,
    parse_optional_timestamp, parse_timestamp, parse_u32,
};
use super::{DeliveryRepository, RepositoryError};
use crate::DbPool;

const RECORD_COLUMNS: &str = "request_id,
    session_id,
    user_id,
    integration_type,
    integration_context_json,
    content,
    content_hash,
    status,
    attempts,
    max_attempts,
    first_attempt_at,
    last_attempt_at,
    next_attempt_at,
    delivered_at,
    expires_at,
    error_message,
    created_at";

pub struct SqlDeliveryRepository {
    pool: DbPool,
}

impl SqlDeliveryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DeliveryRepository for SqlDeliveryRepository {
    async fn find_by_request(
        &self,
        id: &RequestId,
    ) -> Result<Option<DeliveryRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM delivery_records WHERE request_id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn create(&self, record: &DeliveryRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO delivery_records (
                request_id,
                session_id,
                user_id,
                integration_type,
                integration_context_json,
                content,
                content_hash,
                status,
                attempts,
                max_attempts,
                first_attempt_at,
                last_attempt_at,
                next_attempt_at,
                delivered_at,
                expires_at,
                error_message,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(request_id) DO NOTHING",
        )
        .bind(&record.request_id.0)
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(record.integration_type.as_str())
        .bind(encode_map(&record.integration_context)?)
        .bind(&record.content)
        .bind(&record.content_hash)
        .bind(record.status.as_str())
        .bind(i64::from(record.attempts))
        .bind(i64::from(record.max_attempts))
        .bind(encode_optional_timestamp(record.first_attempt_at.as_ref()))
        .bind(encode_optional_timestamp(record.last_attempt_at.as_ref()))
        .bind(encode_optional_timestamp(record.next_attempt_at.as_ref()))
        .bind(encode_optional_timestamp(record.delivered_at.as_ref()))
        .bind(encode_timestamp(&record.expires_at))
        .bind(record.error_message.as_deref())
        .bind(encode_timestamp(&record.created_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim(
        &self,
        id: &RequestId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, RepositoryError> {
        let now = encode_timestamp(&now);
        let row = sqlx::query(&format!(
            "UPDATE delivery_records SET lease_until = ?
             WHERE request_id = ?
               AND status IN ('PENDING', 'RETRYING')
               AND (lease_until IS NULL OR lease_until <= ?)
               AND (next_attempt_at IS NULL OR next_attempt_at <= ? OR expires_at < ?)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(encode_timestamp(&lease_until))
        .bind(&id.0)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }

    async fn record_attempt(
        &self,
        record: &DeliveryRecord,
        attempt: &DeliveryAttempt,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE delivery_records SET
                status = ?,
                attempts = ?,
                first_attempt_at = ?,
                last_attempt_at = ?,
                next_attempt_at = ?,
                lease_until = NULL,
                delivered_at = ?,
                error_message = ?
             WHERE request_id = ?
               AND status NOT IN ('DELIVERED', 'FAILED', 'EXPIRED')",
        )
        .bind(record.status.as_str())
        .bind(i64::from(record.attempts))
        .bind(encode_optional_timestamp(record.first_attempt_at.as_ref()))
        .bind(encode_optional_timestamp(record.last_attempt_at.as_ref()))
        .bind(encode_optional_timestamp(record.next_attempt_at.as_ref()))
        .bind(encode_optional_timestamp(record.delivered_at.as_ref()))
        .bind(record.error_message.as_deref())
        .bind(&record.request_id.0)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // settled (or unknown) records keep their final audit trail
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO delivery_attempts (
                request_id,
                attempt,
                from_status,
                to_status,
                error_message,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.request_id.0)
        .bind(i64::from(attempt.attempt))
        .bind(attempt.from_status.as_str())
        .bind(attempt.to_status.as_str())
        .bind(attempt.error_message.as_deref())
        .bind(encode_timestamp(&attempt.occurred_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_attempts(
        &self,
        id: &RequestId,
    ) -> Result<Vec<DeliveryAttempt>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                request_id,
                attempt,
                from_status,
                to_status,
                error_message,
                occurred_at
             FROM delivery_attempts
             WHERE request_id = ?
             ORDER BY id ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(attempt_from_row).collect()
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let now = encode_timestamp(&now);
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM delivery_records
             WHERE status IN ('PENDING', 'RETRYING')
               AND (lease_until IS NULL OR lease_until <= ?)
               AND (next_attempt_at IS NULL OR next_attempt_at <= ? OR expires_at < ?)
             ORDER BY created_at ASC
             LIMIT ?"
        ))
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

fn parse_status(column: &str, value: String) -> Result<DeliveryStatus, RepositoryError> {
    DeliveryStatus::parse(&value).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown delivery status in `{column}`: `{value}`"))
    })
}

fn record_from_row(row: SqliteRow) -> Result<DeliveryRecord, RepositoryError> {
    let integration_raw = row.try_get::<String, _>("integration_type")?;
    let context_raw = row.try_get::<String, _>("integration_context_json")?;

    Ok(DeliveryRecord {
        request_id: RequestId(row.try_get("request_id")?),
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        integration_type: parse_integration("integration_type", &integration_raw)?,
        integration_context: parse_json("integration_context_json", &context_raw)?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        status: parse_status("status", row.try_get("status")?)?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        max_attempts: parse_u32("max_attempts", row.try_get("max_attempts")?)?,
        first_attempt_at: parse_optional_timestamp(
            "first_attempt_at",
            row.try_get("first_attempt_at")?,
        )?,
        last_attempt_at: parse_optional_timestamp(
            "last_attempt_at",
            row.try_get("last_attempt_at")?,
        )?,
        next_attempt_at: parse_optional_timestamp(
            "next_attempt_at",
            row.try_get("next_attempt_at")?,
        )?,
        delivered_at: parse_optional_timestamp("delivered_at", row.try_get("delivered_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn attempt_from_row(row: SqliteRow) -> Result<DeliveryAttempt, RepositoryError> {
    Ok(DeliveryAttempt {
        request_id: RequestId(row.try_get("request_id")?),
        attempt: parse_u32("attempt", row.try_get("attempt")?)?,
        from_status: parse_status("from_status", row.try_get("from_status")?)?,
        to_status: parse_status("to_status", row.try_get("to_status")?)?,
        error_message: row.try_get("error_message")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}
