use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{get_json, invalidate_patterns, set_json, Cache};
use crate::errors::EngineError;
use crate::models::{PoolFilter, Question};
use crate::resilience::RetryPolicy;

/// Source of question records.
#[async_trait]
pub trait QuestionStore: Send + Sync {
    /// Active questions matching `filter` whose provenance tag is `provenance`.
    async fn list_active_questions(&self, filter: &PoolFilter, provenance: &str) -> anyhow::Result<Vec<Question>>;
}

pub fn pool_key(filter: &PoolFilter) -> String {
    fn part(id: Option<Uuid>) -> String {
        id.map(|id| id.to_string()).unwrap_or_else(|| "*".to_string())
    }
    format!("pool:{}:{}:{}", filter.subject_id, part(filter.topic_id), part(filter.subtopic_id))
}

/// Draw `count` distinct questions uniformly at random, in random order.
pub fn sample_questions(pool: &[Question], count: usize) -> Vec<Question> {
    let mut candidates = pool.to_vec();
    let mut rng = rand::thread_rng();
    let (drawn, _) = candidates.partial_shuffle(&mut rng, count);
    drawn.to_vec()
}

/// Filtered set of eligible questions, cached per filter.
#[derive(Clone)]
pub struct QuestionPool {
    store: Arc<dyn QuestionStore>,
    cache: Arc<dyn Cache>,
    retry: RetryPolicy,
    ttl: Duration,
    provenance: String,
}

impl QuestionPool {
    pub fn new(
        store: Arc<dyn QuestionStore>,
        cache: Arc<dyn Cache>,
        retry: RetryPolicy,
        ttl: Duration,
        provenance: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            retry,
            ttl,
            provenance: provenance.into(),
        }
    }

    /// Cache failures fall through to the store; only a failed store read
    /// fails the call.
    pub async fn get_pool(&self, filter: &PoolFilter) -> Result<Vec<Question>, EngineError> {
        let key = pool_key(filter);

        match get_json::<Vec<Question>>(self.cache.as_ref(), &key).await {
            Ok(Some(questions)) => {
                debug!(key = %key, count = questions.len(), "Question pool served from cache");
                return Ok(questions);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Question pool cache read failed"),
        }

        let questions = self
            .retry
            .run("list_active_questions", || {
                self.store.list_active_questions(filter, &self.provenance)
            })
            .await?;

        if let Err(e) = set_json(self.cache.as_ref(), &key, &questions, self.ttl).await {
            warn!(key = %key, error = %e, "Failed to cache question pool");
        }

        info!(key = %key, count = questions.len(), "Question pool loaded from store");
        Ok(questions)
    }

    /// Drop every cached pool for a subject.
    pub async fn invalidate(&self, subject_id: Uuid) {
        invalidate_patterns(self.cache.as_ref(), &[format!("pool:{}:*", subject_id)]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCache};
    use crate::models::QuestionKind;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        questions: Vec<Question>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QuestionStore for CountingStore {
        async fn list_active_questions(&self, filter: &PoolFilter, provenance: &str) -> anyhow::Result<Vec<Question>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .questions
                .iter()
                .filter(|q| q.subject_id == filter.subject_id && q.provenance == provenance)
                .cloned()
                .collect())
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<usize, CacheError> {
            Err(CacheError::Backend("connection refused".to_string()))
        }
    }

    fn question(subject_id: Uuid, provenance: &str) -> Question {
        Question {
            id: Uuid::new_v4(),
            kind: QuestionKind::MultipleChoice,
            subject_id,
            topic_id: None,
            subtopic_id: None,
            question_text: "q".to_string(),
            marks: 1.0,
            negative_marks: 0.0,
            details: "{}".to_string(),
            provenance: provenance.to_string(),
            is_active: true,
        }
    }

    fn store_with(subject: Uuid) -> Arc<CountingStore> {
        Arc::new(CountingStore {
            questions: vec![
                question(subject, "ai_generated"),
                question(subject, "ai_generated"),
                question(subject, "past_paper"),
            ],
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_pool_key_uses_wildcards_for_missing_levels() {
        let subject = Uuid::new_v4();
        let topic = Uuid::new_v4();
        let filter = PoolFilter { subject_id: subject, topic_id: Some(topic), subtopic_id: None };
        assert_eq!(pool_key(&filter), format!("pool:{}:{}:*", subject, topic));
    }

    #[tokio::test]
    async fn test_pool_is_cached_and_invalidated() {
        let subject = Uuid::new_v4();
        let store = store_with(subject);
        let pool = QuestionPool::new(
            store.clone(),
            Arc::new(MemoryCache::new(100)),
            RetryPolicy::default(),
            Duration::from_secs(3600),
            "ai_generated",
        );
        let filter = PoolFilter { subject_id: subject, topic_id: None, subtopic_id: None };

        assert_eq!(pool.get_pool(&filter).await.unwrap().len(), 2);
        assert_eq!(pool.get_pool(&filter).await.unwrap().len(), 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        pool.invalidate(subject).await;
        pool.get_pool(&filter).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_outage_degrades_to_store() {
        let subject = Uuid::new_v4();
        let store = store_with(subject);
        let pool = QuestionPool::new(
            store.clone(),
            Arc::new(BrokenCache),
            RetryPolicy::default(),
            Duration::from_secs(3600),
            "ai_generated",
        );
        let filter = PoolFilter { subject_id: subject, topic_id: None, subtopic_id: None };

        assert_eq!(pool.get_pool(&filter).await.unwrap().len(), 2);
        pool.invalidate(subject).await;
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sampling_is_without_replacement() {
        let subject = Uuid::new_v4();
        let pool: Vec<Question> = (0..10).map(|_| question(subject, "ai_generated")).collect();

        let drawn = sample_questions(&pool, 6);
        assert_eq!(drawn.len(), 6);
        let unique: HashSet<Uuid> = drawn.iter().map(|q| q.id).collect();
        assert_eq!(unique.len(), 6);

        assert_eq!(sample_questions(&pool, 25).len(), 10);
    }
}
