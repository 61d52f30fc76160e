use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use relaydesk_core::domain::conversation::{
    ConversationEntry, ConversationQuery, ConversationSummary,
};
use relaydesk_core::flows::Role;

use super::codec::{encode_timestamp, parse_integration, parse_timestamp, parse_u64};
use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn messages_for(
        &self,
        query: &ConversationQuery,
        session_id: &str,
    ) -> Result<Vec<ConversationEntry>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT
                session_id,
                user_id,
                user_email,
                integration_type,
                agent_name,
                role,
                content,
                request_id,
                created_at
             FROM conversation_messages
             WHERE session_id = ",
        );
        builder.push_bind(session_id.to_string());
        push_filters(&mut builder, query);
        builder.push(" ORDER BY id ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.into_iter().map(entry_from_row).collect()
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn append(&self, entry: ConversationEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation_messages (
                session_id,
                user_id,
                user_email,
                integration_type,
                agent_name,
                role,
                content,
                request_id,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.session_id)
        .bind(&entry.user_id)
        .bind(entry.user_email.as_deref())
        .bind(entry.integration_type.map(|integration| integration.as_str()))
        .bind(&entry.agent_name)
        .bind(entry.role.as_str())
        .bind(&entry.content)
        .bind(entry.request_id.as_deref())
        .bind(encode_timestamp(&entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn search(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT
                session_id,
                MAX(user_id) AS user_id,
                MAX(user_email) AS user_email,
                MAX(integration_type) AS integration_type,
                GROUP_CONCAT(DISTINCT agent_name) AS agent_names,
                COUNT(*) AS message_count,
                MIN(created_at) AS first_message_at,
                MAX(created_at) AS last_message_at
             FROM conversation_messages
             WHERE 1 = 1",
        );
        push_filters(&mut builder, query);
        builder.push(" GROUP BY session_id ORDER BY ");
        builder.push(if query.random_sample { "RANDOM()" } else { "last_message_at DESC" });
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(query.effective_limit()));

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut summaries = rows.into_iter().map(summary_from_row).collect::<Result<Vec<_>, _>>()?;

        if query.include_messages {
            for summary in &mut summaries {
                summary.messages = self.messages_for(query, &summary.session_id).await?;
            }
        }

        Ok(summaries)
    }
}

fn push_filters<'args>(builder: &mut QueryBuilder<'args, Sqlite>, query: &ConversationQuery) {
    if let Some(session_id) = &query.session_id {
        builder.push(" AND session_id = ").push_bind(session_id.clone());
    }
    if let Some(user_id) = &query.user_id {
        builder.push(" AND user_id = ").push_bind(user_id.clone());
    }
    if let Some(user_email) = &query.user_email {
        builder.push(" AND LOWER(user_email) = LOWER(").push_bind(user_email.clone()).push(")");
    }
    if !query.integration_types.is_empty() {
        builder.push(" AND integration_type IN (");
        let mut separated = builder.separated(", ");
        for integration in &query.integration_types {
            separated.push_bind(integration.as_str());
        }
        separated.push_unseparated(")");
    }
    if let Some(agent_id) = &query.agent_id {
        builder.push(" AND agent_name = ").push_bind(agent_id.clone());
    }
    if let Some(start) = &query.start_date {
        builder.push(" AND created_at >= ").push_bind(encode_timestamp(start));
    }
    if let Some(end) = &query.end_date {
        builder.push(" AND created_at <= ").push_bind(encode_timestamp(end));
    }
}

fn entry_from_row(row: SqliteRow) -> Result<ConversationEntry, RepositoryError> {
    let role_raw = row.try_get::<String, _>("role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message role `{role_raw}`")))?;

    Ok(ConversationEntry {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        user_email: row.try_get("user_email")?,
        integration_type: row
            .try_get::<Option<String>, _>("integration_type")?
            .map(|raw| parse_integration("integration_type", &raw))
            .transpose()?,
        agent_name: row.try_get("agent_name")?,
        role,
        content: row.try_get("content")?,
        request_id: row.try_get("request_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn summary_from_row(row: SqliteRow) -> Result<ConversationSummary, RepositoryError> {
    let mut agent_names: Vec<String> = row
        .try_get::<Option<String>, _>("agent_names")?
        .unwrap_or_default()
        .split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    agent_names.sort();
    agent_names.dedup();

    Ok(ConversationSummary {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        user_email: row.try_get("user_email")?,
        integration_type: row
            .try_get::<Option<String>, _>("integration_type")?
            .map(|raw| parse_integration("integration_type", &raw))
            .transpose()?,
        agent_names,
        message_count: parse_u64("message_count", row.try_get("message_count")?)?,
        first_message_at: parse_timestamp("first_message_at", row.try_get("first_message_at")?)?,
        last_message_at: parse_timestamp("last_message_at", row.try_get("last_message_at")?)?,
        messages: Vec::new(),
    })
}
