use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio::sync::RwLock;

use relaydesk_core::domain::conversation::{
    ConversationEntry, ConversationQuery, ConversationSummary,
};
use relaydesk_core::domain::delivery::{DeliveryAttempt, DeliveryRecord, DeliveryStatus};
use relaydesk_core::domain::request::{NormalizedRequest, RequestId};
use relaydesk_core::domain::session::{
    Session, SessionCheckpoint, SessionId, SessionName, SessionStatus,
};

use super::{
    ConversationRepository, DeliveryRepository, ProcessedEventRepository, RepositoryError,
    RequestRepository, SessionRepository,
};

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, Session>>,
    checkpoints: RwLock<HashMap<String, SessionCheckpoint>>,
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn find_active_by_user(&self, user_id: &str) -> Result<Option<Session>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .find(|session| session.user_id == user_id && session.status == SessionStatus::Active)
            .cloned())
    }

    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id.0).cloned())
    }

    async fn find_checkpoint(
        &self,
        session_name: &SessionName,
    ) -> Result<Option<SessionCheckpoint>, RepositoryError> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(&session_name.0).cloned())
    }

    async fn save(&self, session: &Session) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        let conflicting = session.status == SessionStatus::Active
            && sessions.values().any(|existing| {
                existing.user_id == session.user_id
                    && existing.status == SessionStatus::Active
                    && existing.session_id != session.session_id
            });
        if conflicting {
            return Err(RepositoryError::Conflict(format!(
                "user `{}` already has an active session",
                session.user_id
            )));
        }

        let checkpoint = session.checkpoint();
        let mut checkpoints = self.checkpoints.write().await;
        sessions.insert(session.session_id.0.clone(), session.clone());
        checkpoints.insert(checkpoint.session_name.0.clone(), checkpoint);
        Ok(())
    }

    async fn close(&self, id: &SessionId) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&id.0) {
            session.status = SessionStatus::Closed;
            session.pending_reset = false;
            session.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    entries: RwLock<Vec<ConversationEntry>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn append(&self, entry: ConversationEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(())
    }

    async fn search(
        &self,
        query: &ConversationQuery,
    ) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut grouped: BTreeMap<&str, Vec<&ConversationEntry>> = BTreeMap::new();
        for entry in entries.iter().filter(|entry| query.matches(entry)) {
            grouped.entry(entry.session_id.as_str()).or_default().push(entry);
        }

        let mut summaries: Vec<ConversationSummary> = grouped
            .into_values()
            .filter_map(|messages| summarize(&messages, query.include_messages))
            .collect();

        if query.random_sample {
            summaries.shuffle(&mut rand::thread_rng());
        } else {
            summaries.sort_by(|left, right| right.last_message_at.cmp(&left.last_message_at));
        }
        summaries.truncate(query.effective_limit() as usize);
        Ok(summaries)
    }
}

fn summarize(messages: &[&ConversationEntry], include: bool) -> Option<ConversationSummary> {
    let first = messages.first()?;
    let mut agent_names: Vec<String> =
        messages.iter().map(|message| message.agent_name.clone()).collect();
    agent_names.sort();
    agent_names.dedup();

    let first_message_at = messages.iter().map(|message| message.created_at).min()?;
    let last_message_at = messages.iter().map(|message| message.created_at).max()?;

    Some(ConversationSummary {
        session_id: first.session_id.clone(),
        user_id: first.user_id.clone(),
        user_email: messages.iter().find_map(|message| message.user_email.clone()),
        integration_type: messages.iter().find_map(|message| message.integration_type),
        agent_names,
        message_count: messages.len() as u64,
        first_message_at,
        last_message_at,
        messages: if include {
            messages.iter().map(|message| (*message).clone()).collect()
        } else {
            Vec::new()
        },
    })
}

#[derive(Default)]
pub struct InMemoryRequestRepository {
    requests: RwLock<HashMap<String, NormalizedRequest>>,
}

#[async_trait::async_trait]
impl RequestRepository for InMemoryRequestRepository {
    async fn find_by_id(
        &self,
        id: &RequestId,
    ) -> Result<Option<NormalizedRequest>, RepositoryError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn save(&self, request: &NormalizedRequest) -> Result<(), RepositoryError> {
        let mut requests = self.requests.write().await;
        requests.entry(request.request_id.0.clone()).or_insert_with(|| request.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryDeliveryRepository {
    records: RwLock<HashMap<String, DeliveryRecord>>,
    leases: RwLock<HashMap<String, DateTime<Utc>>>,
    attempts: RwLock<Vec<DeliveryAttempt>>,
}

impl InMemoryDeliveryRepository {
    async fn is_leased(&self, id: &str, now: DateTime<Utc>) -> bool {
        self.leases.read().await.get(id).is_some_and(|until| *until > now)
    }
}

fn is_due(record: &DeliveryRecord, now: DateTime<Utc>) -> bool {
    matches!(record.status, DeliveryStatus::Pending | DeliveryStatus::Retrying)
        && (record.next_attempt_at.map_or(true, |next| next <= now) || record.expires_at < now)
}

#[async_trait::async_trait]
impl DeliveryRepository for InMemoryDeliveryRepository {
    async fn find_by_request(
        &self,
        id: &RequestId,
    ) -> Result<Option<DeliveryRecord>, RepositoryError> {
        let records = self.records.read().await;
        Ok(records.get(&id.0).cloned())
    }

    async fn create(&self, record: &DeliveryRecord) -> Result<bool, RepositoryError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.request_id.0) {
            return Ok(false);
        }
        records.insert(record.request_id.0.clone(), record.clone());
        Ok(true)
    }

    async fn claim(
        &self,
        id: &RequestId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<DeliveryRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut leases = self.leases.write().await;
        let Some(record) = records.get(&id.0).filter(|record| is_due(record, now)) else {
            return Ok(None);
        };
        if leases.get(&id.0).is_some_and(|until| *until > now) {
            return Ok(None);
        }
        leases.insert(id.0.clone(), lease_until);
        Ok(Some(record.clone()))
    }

    async fn record_attempt(
        &self,
        record: &DeliveryRecord,
        attempt: &DeliveryAttempt,
    ) -> Result<(), RepositoryError> {
        let mut records = self.records.write().await;
        let Some(stored) = records.get_mut(&record.request_id.0) else {
            return Ok(());
        };
        if stored.status.is_terminal() {
            return Ok(());
        }
        *stored = record.clone();
        self.leases.write().await.remove(&record.request_id.0);
        self.attempts.write().await.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(
        &self,
        id: &RequestId,
    ) -> Result<Vec<DeliveryAttempt>, RepositoryError> {
        let attempts = self.attempts.read().await;
        Ok(attempts.iter().filter(|attempt| attempt.request_id == *id).cloned().collect())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DeliveryRecord>, RepositoryError> {
        let records = self.records.read().await;
        let mut due = Vec::new();
        for record in records.values().filter(|record| is_due(record, now)) {
            if !self.is_leased(&record.request_id.0, now).await {
                due.push(record.clone());
            }
        }
        due.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        due.truncate(limit.max(1) as usize);
        Ok(due)
    }
}

#[derive(Default)]
pub struct InMemoryProcessedEventRepository {
    seen: RwLock<HashSet<(String, String)>>,
}

#[async_trait::async_trait]
impl ProcessedEventRepository for InMemoryProcessedEventRepository {
    async fn mark_processed(
        &self,
        event_id: &str,
        consumer: &str,
    ) -> Result<bool, RepositoryError> {
        let mut seen = self.seen.write().await;
        Ok(seen.insert((event_id.to_string(), consumer.to_string())))
    }

    async fn forget(&self, event_id: &str, consumer: &str) -> Result<(), RepositoryError> {
        self.seen.write().await.remove(&(event_id.to_string(), consumer.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::Map;

    use relaydesk_core::delivery::{DeliveryEngine, DeliveryPolicy};
    use relaydesk_core::domain::conversation::{ConversationEntry, ConversationQuery};
    use relaydesk_core::domain::request::{IntegrationType, NormalizedRequest, RequestId};
    use relaydesk_core::domain::session::Session;
    use relaydesk_core::flows::Role;

    use crate::repositories::{
        ConversationRepository, DeliveryRepository, InMemoryConversationRepository,
        InMemoryDeliveryRepository, InMemorySessionRepository, RepositoryError, SessionRepository,
    };

    #[tokio::test]
    async fn in_memory_session_repo_enforces_one_active_session_per_user() {
        let repo = InMemorySessionRepository::default();
        let first = Session::open("U1", "routing-agent", None);
        repo.save(&first).await.expect("save first");

        let second = Session::open("U1", "routing-agent", None);
        let conflict = repo.save(&second).await;
        assert!(matches!(conflict, Err(RepositoryError::Conflict(_))));

        repo.close(&first.session_id).await.expect("close");
        repo.save(&second).await.expect("save second");
        let active = repo.find_active_by_user("U1").await.expect("find");
        assert_eq!(active.map(|session| session.session_id), Some(second.session_id));
    }

    #[tokio::test]
    async fn in_memory_conversation_search_orders_newest_first_and_caps_limit() {
        let repo = InMemoryConversationRepository::default();
        let start = Utc::now();
        for index in 0..5 {
            repo.append(ConversationEntry {
                session_id: format!("s-{index}"),
                user_id: "U1".to_string(),
                user_email: None,
                integration_type: Some(IntegrationType::Cli),
                agent_name: "routing-agent".to_string(),
                role: Role::User,
                content: "hi".to_string(),
                request_id: None,
                created_at: start + Duration::seconds(index),
            })
            .await
            .expect("append");
        }

        let page = repo
            .search(&ConversationQuery { limit: Some(2), ..ConversationQuery::default() })
            .await
            .expect("search");
        let ids: Vec<&str> = page.iter().map(|summary| summary.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s-4", "s-3"]);

        let sampled = repo
            .search(&ConversationQuery { random_sample: true, ..ConversationQuery::default() })
            .await
            .expect("sample");
        assert_eq!(sampled.len(), 5);
    }

    #[tokio::test]
    async fn in_memory_delivery_lease_expires_for_a_crashed_caller() {
        let repo = InMemoryDeliveryRepository::default();
        let now = Utc::now();
        let request = NormalizedRequest {
            request_id: RequestId("R-1".to_string()),
            session_id: "s-1".to_string(),
            user_id: "U1".to_string(),
            integration_type: IntegrationType::Cli,
            content: "hello".to_string(),
            integration_context: Map::new(),
            user_context: Map::new(),
            target_agent_id: None,
            requires_routing: true,
            created_at: now,
        };
        let engine = DeliveryEngine::new(DeliveryPolicy::default());
        let record = engine.create_record(&request, "a", now);
        repo.create(&record).await.expect("create");

        let lease_until = now + Duration::seconds(35);
        assert!(repo.claim(&record.request_id, now, lease_until).await.expect("claim").is_some());
        assert!(repo.claim(&record.request_id, now, lease_until).await.expect("held").is_none());
        assert!(repo.list_due(now, 10).await.expect("due while leased").is_empty());

        let after = lease_until + Duration::seconds(1);
        assert_eq!(repo.list_due(after, 10).await.expect("due after lease").len(), 1);
        let reclaimed = repo
            .claim(&record.request_id, after, after + Duration::seconds(35))
            .await
            .expect("reclaim");
        assert_eq!(reclaimed, Some(record));
    }
}
