use std::collections::HashSet;
use uuid::Uuid;

use super::harness::{engine, engine_with, mc_details, test_config};
use crate::config::RateRule;
use crate::errors::EngineError;
use crate::models::*;
use crate::quota::QuotaService;

#[tokio::test]
async fn test_create_session_links_questions_and_counts_quota() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    let seeded = engine.seed_mc(5, 4.0, 1.0).await;

    let created = engine.create(user, 3).await;

    assert_eq!(created.session.total_questions, 3);
    assert_eq!(created.session.max_score, 12.0);
    assert!(!created.session.is_completed);
    assert_eq!(created.questions.iter().map(|q| q.order).collect::<Vec<_>>(), vec![1, 2, 3]);

    let seeded_ids: HashSet<Uuid> = seeded.iter().map(|q| q.id).collect();
    let drawn: HashSet<Uuid> = created.questions.iter().map(|q| q.id).collect();
    assert_eq!(drawn.len(), 3);
    assert!(drawn.is_subset(&seeded_ids));

    let links = engine.db.get_session_questions(created.session.id).await.unwrap();
    assert_eq!(links.len(), 3);
    let stored = engine.db.get_session(created.session.id, user).await.unwrap().unwrap();
    assert_eq!(stored.max_score, 12.0);

    let usage = engine.quota.usage(user).await.unwrap();
    assert_eq!(usage.tests_used_today, 1);
}

#[tokio::test]
async fn test_presented_questions_carry_no_answer_keys() {
    let engine = engine().await;
    engine.seed_mc(1, 4.0, 1.0).await;
    engine
        .seed_question(
            QuestionKind::SequenceOrdering,
            r#"{"items":[{"label":"x","text":"X"},{"label":"y","text":"Y"}],"correct_sequence":["y","x"]}"#.to_string(),
            2.0,
            0.0,
        )
        .await;

    let created = engine.create(Uuid::new_v4(), 2).await;
    let body = serde_json::to_string(&created.questions).unwrap();

    assert!(!body.contains("is_correct"));
    assert!(!body.contains("correct_sequence"));
    assert!(created.questions.iter().all(|q| q.details.is_some()));
}

#[tokio::test]
async fn test_insufficient_inventory_leaves_no_trace() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(2, 4.0, 1.0).await;

    let result = engine.state.sessions.create_session(user, engine.request(5)).await;

    assert!(matches!(
        result,
        Err(EngineError::InsufficientInventory { requested: 5, available: 2 })
    ));
    assert_eq!(engine.db.count_sessions_for_user(user).await.unwrap(), 0);
    assert_eq!(engine.quota.usage(user).await.unwrap().tests_used_today, 0);
}

#[tokio::test]
async fn test_quota_denial_creates_nothing() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(3, 4.0, 1.0).await;
    engine
        .quota
        .set_state(
            user,
            &QuotaState {
                subscription_tier: "free".to_string(),
                tests_used_today: 3,
                tests_used_total: 3,
                limit_per_day: 3,
            },
        )
        .await
        .unwrap();

    let result = engine.state.sessions.create_session(user, engine.request(1)).await;

    match result {
        Err(EngineError::QuotaExceeded { reason }) => assert_eq!(reason, "daily_limit_reached"),
        other => panic!("expected QuotaExceeded, got {:?}", other.map(|c| c.session.id)),
    }
    assert_eq!(engine.db.count_sessions_for_user(user).await.unwrap(), 0);
    assert_eq!(engine.quota.usage(user).await.unwrap().tests_used_today, 3);
}

#[tokio::test]
async fn test_question_count_bounds() {
    let engine = engine().await;
    engine.seed_mc(1, 1.0, 0.0).await;

    for count in [0, 201] {
        let result = engine.state.sessions.create_session(Uuid::new_v4(), engine.request(count)).await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))), "count {}", count);
    }
}

#[tokio::test]
async fn test_pool_respects_provenance_and_topic() {
    let engine = engine().await;
    engine.seed_mc(1, 1.0, 0.0).await;
    engine
        .db
        .insert_question(NewQuestion {
            kind: QuestionKind::MultipleChoice,
            subject_id: engine.subject_id,
            topic_id: Some(engine.topic_id),
            subtopic_id: None,
            question_text: "Past paper question".to_string(),
            marks: 1.0,
            negative_marks: 0.0,
            details: mc_details("a"),
            provenance: "past_paper".to_string(),
        })
        .await
        .unwrap();

    let result = engine.state.sessions.create_session(Uuid::new_v4(), engine.request(2)).await;
    assert!(matches!(
        result,
        Err(EngineError::InsufficientInventory { requested: 2, available: 1 })
    ));
}

#[tokio::test]
async fn test_create_session_is_rate_limited() {
    let mut config = test_config();
    config.rate_limits.create_session = RateRule { max_requests: 2, window_secs: 60 };
    let engine = engine_with(config).await;
    let user = Uuid::new_v4();
    engine.seed_mc(3, 1.0, 0.0).await;

    engine.create(user, 1).await;
    engine.create(user, 1).await;
    let third = engine.state.sessions.create_session(user, engine.request(1)).await;

    assert!(matches!(third, Err(EngineError::RateLimited { .. })));
    assert_eq!(engine.db.count_sessions_for_user(user).await.unwrap(), 2);
}

#[tokio::test]
async fn test_session_list_cache_is_invalidated_on_create() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(2, 1.0, 0.0).await;

    let empty = engine.state.sessions.list_sessions(user, 20).await;
    assert_eq!(empty.source, DataSource::Database);
    assert!(empty.data.is_empty());
    assert_eq!(engine.state.sessions.list_sessions(user, 20).await.source, DataSource::Cache);

    let created = engine.create(user, 1).await;

    let listed = engine.state.sessions.list_sessions(user, 20).await;
    assert_eq!(listed.source, DataSource::Database);
    assert_eq!(listed.data.len(), 1);
    assert_eq!(listed.data[0].id, created.session.id);
}

#[tokio::test]
async fn test_get_session_is_owner_scoped() {
    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(2, 1.0, 0.0).await;
    let created = engine.create(user, 2).await;

    let detail = engine.state.sessions.get_session(user, created.session.id).await.unwrap();
    assert_eq!(detail.questions.len(), 2);

    let stranger = engine.state.sessions.get_session(Uuid::new_v4(), created.session.id).await;
    assert!(matches!(stranger, Err(EngineError::NotFound(_))));
}

/// Admits everyone but cannot count usage.
struct UncountedQuota;

#[async_trait::async_trait]
impl QuotaService for UncountedQuota {
    async fn check_limit(&self, _user_id: Uuid) -> anyhow::Result<QuotaDecision> {
        Ok(QuotaDecision { allowed: true, reason: None })
    }

    async fn increment_usage(&self, _user_id: Uuid) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("subscription service rejected the increment"))
    }

    async fn usage(&self, _user_id: Uuid) -> anyhow::Result<QuotaState> {
        Ok(QuotaState::free_tier_default(3))
    }
}

#[tokio::test]
async fn test_session_survives_failed_usage_increment() {
    use crate::cache::Cache;
    use crate::question_pool::QuestionPool;
    use crate::quota::QuotaGate;
    use crate::resilience::{RateLimiter, ReadTtls, RetryPolicy};
    use crate::session_service::SessionManager;
    use std::sync::Arc;
    use std::time::Duration;

    let engine = engine().await;
    let user = Uuid::new_v4();
    engine.seed_mc(2, 4.0, 1.0).await;

    let config = test_config();
    let cache: Arc<dyn Cache> = engine.cache.clone();
    let retry = RetryPolicy::from_config(&config.retry);
    let ttls = ReadTtls::from_config(&config.cache);
    let sessions = SessionManager::new(
        engine.db.clone(),
        QuestionPool::new(
            Arc::new(engine.db.clone()),
            cache.clone(),
            retry.clone(),
            Duration::from_secs(60),
            config.session.provenance_tag.clone(),
        ),
        QuotaGate::new(Arc::new(UncountedQuota), cache.clone(), retry.clone(), ttls, 3),
        RateLimiter::new(cache.clone(), config.rate_limits.clone()),
        cache,
        retry,
        ttls,
        config.session.max_question_count,
    );

    let created = sessions.create_session(user, engine.request(2)).await.unwrap();

    let links = engine.db.get_session_questions(created.session.id).await.unwrap();
    assert_eq!(links.len(), 2);
    assert_eq!(engine.db.count_sessions_for_user(user).await.unwrap(), 1);
}
