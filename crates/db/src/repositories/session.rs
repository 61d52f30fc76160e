use sqlx::{sqlite::SqliteRow, Row};

use relaydesk_core::domain::session::{
    Session, SessionCheckpoint, SessionId, SessionName, SessionStatus, SessionUsage, ThreadId,
};
use relaydesk_core::flows::ConversationState;

use super::codec::{
    encode_timestamp, parse_integration, parse_json, parse_timestamp, parse_u32, parse_u64, to_i64,
};
use super::{RepositoryError, SessionRepository};
use crate::DbPool;

const SESSION_COLUMNS: &str = "session_id,
    user_id,
    session_name,
    current_agent_name,
    state_snapshot_json,
    conversation_thread_id,
    email,
    integration_type,
    pending_reset,
    status,
    turns,
    completion_calls,
    prompt_tokens,
    completion_tokens,
    created_at,
    updated_at";

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn find_active_by_user(&self, user_id: &str) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ? AND status = 'active'"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.map(session_from_row).transpose()
    }

    async fn find_checkpoint(
        &self,
        session_name: &SessionName,
    ) -> Result<Option<SessionCheckpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT session_name, thread_id, agent_name, updated_at
             FROM session_checkpoints
             WHERE session_name = ?",
        )
        .bind(&session_name.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SessionCheckpoint {
                session_name: SessionName(row.try_get("session_name")?),
                thread_id: ThreadId(row.try_get("thread_id")?),
                agent_name: row.try_get("agent_name")?,
                updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
            })
        })
        .transpose()
    }

    async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
        let snapshot = session
            .state_machine_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| {
                RepositoryError::Decode(format!("could not encode state snapshot: {error}"))
            })?;
        let checkpoint = session.checkpoint();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO sessions (
                session_id,
                user_id,
                session_name,
                current_agent_name,
                state_snapshot_json,
                conversation_thread_id,
                email,
                integration_type,
                pending_reset,
                status,
                turns,
                completion_calls,
                prompt_tokens,
                completion_tokens,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                session_name = excluded.session_name,
                current_agent_name = excluded.current_agent_name,
                state_snapshot_json = excluded.state_snapshot_json,
                conversation_thread_id = excluded.conversation_thread_id,
                email = excluded.email,
                integration_type = excluded.integration_type,
                pending_reset = excluded.pending_reset,
                status = excluded.status,
                turns = excluded.turns,
                completion_calls = excluded.completion_calls,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                updated_at = excluded.updated_at",
        )
        .bind(&session.session_id.0)
        .bind(&session.user_id)
        .bind(&session.session_name.0)
        .bind(&session.current_agent_name)
        .bind(snapshot)
        .bind(&session.conversation_thread_id.0)
        .bind(session.email.as_deref())
        .bind(session.integration_type.map(|integration| integration.as_str()))
        .bind(session.pending_reset)
        .bind(session.status.as_str())
        .bind(i64::from(session.usage.turns))
        .bind(i64::from(session.usage.completion_calls))
        .bind(to_i64(session.usage.prompt_tokens))
        .bind(to_i64(session.usage.completion_tokens))
        .bind(encode_timestamp(&session.created_at))
        .bind(encode_timestamp(&session.updated_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO session_checkpoints (
                session_name,
                session_id,
                thread_id,
                agent_name,
                updated_at
             ) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_name) DO UPDATE SET
                thread_id = excluded.thread_id,
                agent_name = excluded.agent_name,
                updated_at = excluded.updated_at",
        )
        .bind(&checkpoint.session_name.0)
        .bind(&session.session_id.0)
        .bind(&checkpoint.thread_id.0)
        .bind(&checkpoint.agent_name)
        .bind(encode_timestamp(&checkpoint.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn close(&self, id: &SessionId) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE sessions
             SET status = 'closed', pending_reset = 0, updated_at = ?
             WHERE session_id = ?",
        )
        .bind(encode_timestamp(&chrono::Utc::now()))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown session status `{status_raw}`")))?;

    let state_machine_snapshot = row
        .try_get::<Option<String>, _>("state_snapshot_json")?
        .map(|raw| parse_json::<ConversationState>("state_snapshot_json", &raw))
        .transpose()?;

    let integration_type = row
        .try_get::<Option<String>, _>("integration_type")?
        .map(|raw| parse_integration("integration_type", &raw))
        .transpose()?;

    Ok(Session {
        session_id: SessionId(row.try_get("session_id")?),
        user_id: row.try_get("user_id")?,
        session_name: SessionName(row.try_get("session_name")?),
        current_agent_name: row.try_get("current_agent_name")?,
        state_machine_snapshot,
        conversation_thread_id: ThreadId(row.try_get("conversation_thread_id")?),
        email: row.try_get("email")?,
        integration_type,
        pending_reset: row.try_get("pending_reset")?,
        status,
        usage: SessionUsage {
            turns: parse_u32("turns", row.try_get("turns")?)?,
            completion_calls: parse_u32("completion_calls", row.try_get("completion_calls")?)?,
            prompt_tokens: parse_u64("prompt_tokens", row.try_get("prompt_tokens")?)?,
            completion_tokens: parse_u64("completion_tokens", row.try_get("completion_tokens")?)?,
        },
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
