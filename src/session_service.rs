use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::{get_json, invalidate_patterns, set_json, Cache};
use crate::database::Database;
use crate::errors::EngineError;
use crate::models::*;
use crate::question_pool::{sample_questions, QuestionPool};
use crate::quota::QuotaGate;
use crate::resilience::{read_with_fallback, RateLimiter, ReadTtls, RetryPolicy, CREATE_SESSION};
use crate::{log_service_error, log_service_start, log_service_success, log_validation};

/// Log code for a created session whose quota usage was not counted.
pub const QUOTA_USAGE_UNRECORDED: &str = "quota_usage_unrecorded";

pub fn session_list_key(user_id: Uuid, limit: i64) -> String {
    format!("sessions:{}:list:{}", user_id, limit)
}

pub fn session_detail_key(user_id: Uuid, session_id: Uuid) -> String {
    format!("session:{}:{}:detail", user_id, session_id)
}

/// Creates practice sessions and serves the session read paths.
#[derive(Clone)]
pub struct SessionManager {
    db: Database,
    pool: QuestionPool,
    quota: QuotaGate,
    rate_limiter: RateLimiter,
    cache: Arc<dyn Cache>,
    retry: RetryPolicy,
    ttls: ReadTtls,
    max_question_count: u32,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        pool: QuestionPool,
        quota: QuotaGate,
        rate_limiter: RateLimiter,
        cache: Arc<dyn Cache>,
        retry: RetryPolicy,
        ttls: ReadTtls,
        max_question_count: u32,
    ) -> Self {
        Self {
            db,
            pool,
            quota,
            rate_limiter,
            cache,
            retry,
            ttls,
            max_question_count,
        }
    }

    /// Create a session of `question_count` questions drawn from the
    /// requested pool. Either the session and all of its question links
    /// exist afterwards, or nothing does.
    pub async fn create_session(&self, user_id: Uuid, request: CreateSessionRequest) -> Result<CreatedSession, EngineError> {
        let start = Instant::now();
        log_service_start!("session_manager", "create_session", user_id = user_id);

        self.rate_limiter.check(user_id, CREATE_SESSION, None).await?;

        if request.question_count == 0 || request.question_count > self.max_question_count {
            let message = format!(
                "question_count must be between 1 and {}, got {}",
                self.max_question_count, request.question_count
            );
            log_validation!(failure, "create_session_request", error = message);
            return Err(EngineError::InvalidRequest(message));
        }

        self.quota.check(user_id).await?;

        let mut session = Session {
            id: Uuid::new_v4(),
            user_id,
            subject_id: request.subject_id,
            topic_id: request.topic_id,
            subtopic_id: request.subtopic_id,
            session_type: request.session_type,
            start_time: Utc::now(),
            end_time: None,
            duration: None,
            total_questions: request.question_count as i64,
            questions_attempted: 0,
            questions_correct: 0,
            score: 0.0,
            max_score: 0.0,
            is_completed: false,
        };

        self.retry
            .run("insert_session", || self.db.insert_session(&session))
            .await?;

        let questions = match self.assign_questions(&session, &request).await {
            Ok(questions) => questions,
            Err(e) => {
                self.discard_session(session.id).await;
                return Err(e);
            }
        };

        session.max_score = questions.iter().map(|q| q.marks).sum();

        if let Err(e) = self.quota.record_usage(user_id).await {
            error!(
                code = QUOTA_USAGE_UNRECORDED,
                user_id = %user_id,
                session_id = %session.id,
                error = %e,
                "Failed to record quota usage for created session"
            );
        }

        invalidate_patterns(
            self.cache.as_ref(),
            &[format!("sessions:{}:*", user_id), format!("quota:{}:*", user_id)],
        )
        .await;

        log_service_success!(
            "session_manager",
            "create_session",
            session_id = session.id,
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(CreatedSession { session, questions })
    }

    async fn assign_questions(&self, session: &Session, request: &CreateSessionRequest) -> Result<Vec<QuestionView>, EngineError> {
        let filter = PoolFilter {
            subject_id: request.subject_id,
            topic_id: request.topic_id,
            subtopic_id: request.subtopic_id,
        };
        let pool = self.pool.get_pool(&filter).await?;

        let requested = request.question_count as usize;
        if pool.len() < requested {
            return Err(EngineError::InsufficientInventory {
                requested,
                available: pool.len(),
            });
        }

        let drawn = sample_questions(&pool, requested);
        let links = self
            .retry
            .run("insert_session_questions", || self.db.insert_session_questions(session.id, &drawn))
            .await?;

        Ok(drawn
            .iter()
            .zip(links.iter())
            .map(|(question, link)| present(question, link.question_order))
            .collect())
    }

    async fn discard_session(&self, session_id: Uuid) {
        match self.retry.run("delete_session", || self.db.delete_session(session_id)).await {
            Ok(()) => debug!(session_id = %session_id, "Rolled back partially created session"),
            Err(e) => {
                log_service_error!("session_manager", "discard_session", session_id = session_id, error = e);
            }
        }
    }

    /// Most recent sessions first, with stale fallback.
    pub async fn list_sessions(&self, user_id: Uuid, limit: i64) -> Sourced<Vec<Session>> {
        read_with_fallback(
            self.cache.as_ref(),
            &session_list_key(user_id, limit),
            self.ttls,
            || self.retry.run("list_sessions", || self.db.list_sessions(user_id, limit)),
            Vec::new,
        )
        .await
    }

    pub async fn get_session(&self, user_id: Uuid, session_id: Uuid) -> Result<SessionDetail, EngineError> {
        let key = session_detail_key(user_id, session_id);
        match get_json::<SessionDetail>(self.cache.as_ref(), &key).await {
            Ok(Some(detail)) => return Ok(detail),
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Session detail cache read failed"),
        }

        let session = self
            .retry
            .run("get_session", || self.db.get_session(session_id, user_id))
            .await?
            .ok_or_else(|| EngineError::session_not_found(session_id))?;
        let questions = self
            .retry
            .run("get_session_questions", || self.db.get_session_questions(session_id))
            .await?;

        let detail = SessionDetail { session, questions };
        if let Err(e) = set_json(self.cache.as_ref(), &key, &detail, self.ttls.fresh).await {
            warn!(key = %key, error = %e, "Failed to cache session detail");
        }
        Ok(detail)
    }
}

/// Client view of a drawn question; answer keys never leave the server.
fn present(question: &Question, order: i64) -> QuestionView {
    let details = match question.parse_details() {
        Ok(details) => Some(details.redacted()),
        Err(e) => {
            warn!(question_id = %question.id, error = %e, "Question details could not be parsed for presentation");
            None
        }
    };

    QuestionView {
        id: question.id,
        kind: question.kind,
        question_text: question.question_text.clone(),
        topic_id: question.topic_id,
        marks: question.marks,
        negative_marks: question.negative_marks,
        order,
        details,
    }
}
