use super::codec::encode_timestamp;
use super::{ProcessedEventRepository, RepositoryError};
use crate::DbPool;

pub struct SqlProcessedEventRepository {
    pool: DbPool,
}

impl SqlProcessedEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProcessedEventRepository for SqlProcessedEventRepository {
    async fn mark_processed(
        &self,
        event_id: &str,
        consumer: &str,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO processed_events (event_id, consumer, processed_at)
             VALUES (?, ?, ?)
             ON CONFLICT(event_id, consumer) DO NOTHING",
        )
        .bind(event_id)
        .bind(consumer)
        .bind(encode_timestamp(&chrono::Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn forget(&self, event_id: &str, consumer: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM processed_events WHERE event_id = ? AND consumer = ?")
            .bind(event_id)
            .bind(consumer)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SqlProcessedEventRepository;
    use crate::repositories::ProcessedEventRepository;
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn duplicate_events_are_reported_once_per_consumer() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let repo = SqlProcessedEventRepository::new(pool.clone());

        assert!(repo.mark_processed("evt-1", "request-worker").await.expect("first"));
        assert!(!repo.mark_processed("evt-1", "request-worker").await.expect("duplicate"));
        assert!(repo.mark_processed("evt-1", "delivery-worker").await.expect("other consumer"));

        repo.forget("evt-1", "request-worker").await.expect("forget");
        assert!(repo.mark_processed("evt-1", "request-worker").await.expect("after forget"));
        assert!(!repo.mark_processed("evt-1", "delivery-worker").await.expect("still marked"));

        pool.close().await;
    }
}
