use sqlx::{sqlite::SqliteRow, Row};

use relaydesk_core::domain::request::{NormalizedRequest, RequestId};

use super::codec::{encode_map, encode_timestamp, parse_integration, parse_json, parse_timestamp};
use super::{RepositoryError, RequestRepository};
use crate::DbPool;

pub struct SqlRequestRepository {
    pool: DbPool,
}

impl SqlRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RequestRepository for SqlRequestRepository {
    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<NormalizedRequest>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                request_id,
                session_id,
                user_id,
                integration_type,
                content,
                integration_context_json,
                user_context_json,
                target_agent_id,
                requires_routing,
                created_at
             FROM requests
             WHERE request_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(request_from_row).transpose()
    }

    async fn save(&self, request: &NormalizedRequest) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO requests (
                request_id,
                session_id,
                user_id,
                integration_type,
                content,
                integration_context_json,
                user_context_json,
                target_agent_id,
                requires_routing,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(request_id) DO NOTHING",
        )
        .bind(&request.request_id.0)
        .bind(&request.session_id)
        .bind(&request.user_id)
        .bind(request.integration_type.as_str())
        .bind(&request.content)
        .bind(encode_map(&request.integration_context)?)
        .bind(encode_map(&request.user_context)?)
        .bind(request.target_agent_id.as_deref())
        .bind(request.requires_routing)
        .bind(encode_timestamp(&request.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn request_from_row(row: SqliteRow) -> Result<NormalizedRequest, RepositoryError> {
    let integration_raw = row.try_get::<String, _>("integration_type")?;
    let integration_context_raw = row.try_get::<String, _>("integration_context_json")?;
    let user_context_raw = row.try_get::<String, _>("user_context_json")?;

    Ok(NormalizedRequest {
        request_id: RequestId(row.try_get("request_id")?),
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        integration_type: parse_integration("integration_type", &integration_raw)?,
        content: row.try_get("content")?,
        integration_context: parse_json("integration_context_json", &integration_context_raw)?,
        user_context: parse_json("user_context_json", &user_context_raw)?,
        target_agent_id: row.try_get("target_agent_id")?,
        requires_routing: row.try_get("requires_routing")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}
