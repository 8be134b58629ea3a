use std::sync::Arc;
use uuid::Uuid;

use crate::api::AppState;
use crate::cache::{Cache, MemoryCache};
use crate::config::{Config, RateLimitConfig, RateRule, RetryConfig};
use crate::database::Database;
use crate::models::*;
use crate::quota::DatabaseQuotaService;

pub struct TestEngine {
    pub db: Database,
    pub cache: Arc<MemoryCache>,
    pub state: AppState,
    pub quota: DatabaseQuotaService,
    pub subject_id: Uuid,
    pub topic_id: Uuid,
}

pub fn test_config() -> Config {
    Config {
        retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
            attempt_timeout_ms: 5_000,
        },
        rate_limits: RateLimitConfig {
            create_session: RateRule { max_requests: 100, window_secs: 60 },
            submit_session: RateRule { max_requests: 100, window_secs: 60 },
        },
        ..Config::default()
    }
}

pub async fn engine() -> TestEngine {
    engine_with(test_config()).await
}

pub async fn engine_with(config: Config) -> TestEngine {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let cache = Arc::new(MemoryCache::new(1_000));
    let shared: Arc<dyn Cache> = cache.clone();
    let state = AppState::new(db.clone(), shared, &config);

    TestEngine {
        quota: DatabaseQuotaService::new(db.clone(), config.quota.free_daily_limit),
        db,
        cache,
        state,
        subject_id: Uuid::new_v4(),
        topic_id: Uuid::new_v4(),
    }
}

/// Multiple-choice details with options "a" and "b"; `correct` is flagged.
pub fn mc_details(correct: &str) -> String {
    serde_json::json!({
        "options": [
            {"id": "a", "text": "First", "is_correct": correct == "a"},
            {"id": "b", "text": "Second", "is_correct": correct == "b"}
        ]
    })
    .to_string()
}

impl TestEngine {
    pub async fn seed_question(&self, kind: QuestionKind, details: String, marks: f64, negative: f64) -> Question {
        self.db
            .insert_question(NewQuestion {
                kind,
                subject_id: self.subject_id,
                topic_id: Some(self.topic_id),
                subtopic_id: None,
                question_text: format!("{} question", kind),
                marks,
                negative_marks: negative,
                details,
                provenance: "ai_generated".to_string(),
            })
            .await
            .unwrap()
    }

    /// `count` multiple-choice questions whose correct option is "a".
    pub async fn seed_mc(&self, count: usize, marks: f64, negative: f64) -> Vec<Question> {
        let mut questions = Vec::with_capacity(count);
        for _ in 0..count {
            questions.push(
                self.seed_question(QuestionKind::MultipleChoice, mc_details("a"), marks, negative)
                    .await,
            );
        }
        questions
    }

    pub fn request(&self, question_count: u32) -> CreateSessionRequest {
        CreateSessionRequest {
            subject_id: self.subject_id,
            topic_id: Some(self.topic_id),
            subtopic_id: None,
            session_type: SessionType::Practice,
            question_count,
        }
    }

    pub async fn create(&self, user_id: Uuid, question_count: u32) -> CreatedSession {
        self.state
            .sessions
            .create_session(user_id, self.request(question_count))
            .await
            .unwrap()
    }
}
