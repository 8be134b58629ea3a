use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{invalidate_patterns, Cache};
use crate::database::Database;
use crate::errors::EngineError;
use crate::evaluator::{evaluate, marks_awarded};
use crate::mastery::TopicMasteryUpdater;
use crate::models::*;
use crate::resilience::{RateLimiter, RetryPolicy, SUBMIT_SESSION};
use crate::{log_performance, log_service_start, log_service_success, log_validation};

pub const ALREADY_COMPLETED: &str = "Session already completed";
pub const SUBMITTED: &str = "Answers submitted successfully";

/// Evaluates, scores and persists one submission of answers for a session.
#[derive(Clone)]
pub struct SubmissionPipeline {
    db: Database,
    mastery: TopicMasteryUpdater,
    rate_limiter: RateLimiter,
    cache: Arc<dyn Cache>,
    retry: RetryPolicy,
}

impl SubmissionPipeline {
    pub fn new(
        db: Database,
        mastery: TopicMasteryUpdater,
        rate_limiter: RateLimiter,
        cache: Arc<dyn Cache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            mastery,
            rate_limiter,
            cache,
            retry,
        }
    }

    /// The body is taken raw so that a completed session answers with its
    /// stored result even when the body would not validate.
    pub async fn submit_answers(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        body: serde_json::Value,
    ) -> Result<SubmissionResult, EngineError> {
        let start = Instant::now();
        let scope = session_id.to_string();
        self.rate_limiter.check(user_id, SUBMIT_SESSION, Some(&scope)).await?;

        let session = self
            .retry
            .run("get_session", || self.db.get_session(session_id, user_id))
            .await?
            .ok_or_else(|| EngineError::session_not_found(session_id))?;

        if session.is_completed {
            debug!(session_id = %session_id, "Submission for completed session, returning stored result");
            return Ok(summarize(&session, ALREADY_COMPLETED, Vec::new(), Vec::new()));
        }

        let request = parse_request(body)?;
        log_service_start!("submission", "submit_answers", session_id = session_id, answer_count = request.answers.len());

        let question_ids: Vec<Uuid> = request.answers.keys().copied().collect();
        let (assigned, attempted) = tokio::join!(
            self.retry.run("get_assigned_questions", || self.db.get_assigned_questions(session_id, &question_ids)),
            self.retry.run("get_attempted_question_ids", || self.db.get_attempted_question_ids(session_id, &question_ids)),
        );
        let assigned = assigned.map_err(EngineError::Transient)?;
        let attempted = attempted.map_err(EngineError::Transient)?;

        let in_session: HashSet<Uuid> = assigned.iter().map(|a| a.question.id).collect();
        for id in question_ids.iter().filter(|id| !in_session.contains(id)) {
            warn!(session_id = %session_id, question_id = %id, "Ignoring answer for question outside the session");
        }

        let staged = stage_attempts(user_id, session_id, &request, &assigned, &attempted);
        log_performance!("evaluate_answers", duration_ms = start.elapsed().as_millis() as u64, items = assigned.len());

        let inserted: HashSet<Uuid> = if staged.attempts.is_empty() {
            HashSet::new()
        } else {
            self.retry
                .run("persist_attempts", || self.db.persist_attempts(&staged.attempts))
                .await?
                .into_iter()
                .collect()
        };

        if inserted.len() < staged.attempts.len() {
            warn!(
                session_id = %session_id,
                lost = staged.attempts.len() - inserted.len(),
                "Attempts already recorded by a concurrent submission were dropped"
            );
        }

        let results: Vec<QuestionResult> = staged
            .results
            .into_iter()
            .filter(|r| inserted.contains(&r.question_id))
            .collect();
        let mastery_deltas: Vec<(Uuid, bool)> = staged
            .mastery
            .into_iter()
            .filter(|(question_id, _, _)| inserted.contains(question_id))
            .map(|(_, topic_id, is_correct)| (topic_id, is_correct))
            .collect();

        let (aggregates, applied) = tokio::join!(
            self.retry.run("recompute_session_aggregates", || self.db.recompute_session_aggregates(session_id)),
            self.mastery.update_batch(user_id, &mastery_deltas),
        );
        aggregates?;
        debug!(session_id = %session_id, applied, total = mastery_deltas.len(), "Mastery updates applied");

        let duration = request
            .timing_data
            .as_ref()
            .and_then(|t| t.total_duration)
            .map(i64::from);
        let completed = self
            .retry
            .run("complete_session", || self.db.complete_session(session_id, user_id, duration))
            .await?
            .ok_or_else(|| EngineError::session_not_found(session_id))?;

        invalidate_patterns(
            self.cache.as_ref(),
            &[
                format!("session:{}:{}:*", user_id, session_id),
                format!("sessions:{}:*", user_id),
            ],
        )
        .await;

        log_service_success!(
            "submission",
            "submit_answers",
            session_id = session_id,
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(summarize(&completed, SUBMITTED, results, staged.skipped))
    }
}

#[derive(Debug, Default)]
struct Staged {
    attempts: Vec<QuestionAttempt>,
    results: Vec<QuestionResult>,
    // (question, topic, correct)
    mastery: Vec<(Uuid, Uuid, bool)>,
    skipped: Vec<Uuid>,
}

/// Evaluate every submitted answer that belongs to the session and has no
/// attempt yet, in presentation order.
fn stage_attempts(
    user_id: Uuid,
    session_id: Uuid,
    request: &SubmitAnswersRequest,
    assigned: &[AssignedQuestion],
    attempted: &HashSet<Uuid>,
) -> Staged {
    let now = Utc::now();
    let question_times: HashMap<Uuid, u32> = request
        .timing_data
        .as_ref()
        .map(|t| t.question_times.clone())
        .unwrap_or_default();
    let mut staged = Staged::default();

    for AssignedQuestion { session_question, question } in assigned {
        let Some(answer) = request.answers.get(&question.id) else {
            continue;
        };
        if attempted.contains(&question.id) {
            debug!(session_id = %session_id, question_id = %question.id, "Question already attempted, skipping");
            continue;
        }

        let is_correct = match evaluate(question, answer) {
            Ok(is_correct) => is_correct,
            Err(e) => {
                warn!(session_id = %session_id, question_id = %question.id, error = %e, "Skipping unevaluable answer");
                staged.skipped.push(question.id);
                continue;
            }
        };
        let marks = marks_awarded(question, is_correct);

        staged.attempts.push(QuestionAttempt {
            id: Uuid::new_v4(),
            session_id,
            session_question_id: session_question.id,
            question_id: question.id,
            user_id,
            user_answer: answer.clone(),
            is_correct,
            marks_awarded: marks,
            time_taken: question_times.get(&question.id).map(|&secs| i64::from(secs)),
            created_at: now,
        });
        staged.results.push(QuestionResult {
            question_id: question.id,
            is_correct,
            marks_awarded: marks,
        });
        if let Some(topic_id) = question.topic_id {
            staged.mastery.push((question.id, topic_id, is_correct));
        }
    }

    staged
}

fn summarize(
    session: &Session,
    message: &str,
    results: Vec<QuestionResult>,
    skipped_question_ids: Vec<Uuid>,
) -> SubmissionResult {
    SubmissionResult {
        session_id: session.id,
        message: message.to_string(),
        is_completed: session.is_completed,
        total_questions: session.total_questions,
        total_attempted: session.questions_attempted,
        total_correct: session.questions_correct,
        score: session.score,
        max_score: session.max_score,
        results,
        skipped_question_ids,
    }
}

/// Shape and content checks on a submission body.
pub fn parse_request(body: serde_json::Value) -> Result<SubmitAnswersRequest, EngineError> {
    let request: SubmitAnswersRequest = serde_json::from_value(body).map_err(|e| {
        log_validation!(failure, "submit_request", error = e);
        EngineError::InvalidRequest(format!("Malformed submission: {}", e))
    })?;

    if request.answers.is_empty() {
        log_validation!(failure, "submit_request", error = "no answers");
        return Err(EngineError::InvalidRequest("Submission contains no answers".to_string()));
    }

    for (question_id, answer) in &request.answers {
        if let Err(problem) = check_answer(answer) {
            log_validation!(failure, "submit_request", error = problem);
            return Err(EngineError::InvalidRequest(format!(
                "Invalid answer for question {}: {}",
                question_id, problem
            )));
        }
    }

    log_validation!(success, "submit_request", format!("{} answers", request.answers.len()));
    Ok(request)
}

fn check_answer(answer: &UserAnswer) -> Result<(), String> {
    match answer {
        UserAnswer::MultipleChoice { selected_option }
        | UserAnswer::AssertionReason { selected_option }
        | UserAnswer::DiagramBased { selected_option } => non_empty(selected_option),
        UserAnswer::MultipleCorrectStatements { selected_options } => distinct_ids(selected_options),
        UserAnswer::SequenceOrdering { sequence } => {
            if sequence.is_empty() {
                return Err("sequence is empty".to_string());
            }
            distinct_ids(sequence)
        }
        UserAnswer::Matching { pairs } => pairs
            .iter()
            .try_for_each(|(left, right)| non_empty(left).and_then(|_| non_empty(right))),
    }
}

fn non_empty(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        Err("option id is empty".to_string())
    } else {
        Ok(())
    }
}

fn distinct_ids(ids: &[String]) -> Result<(), String> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        non_empty(id)?;
        if !seen.insert(id.as_str()) {
            return Err(format!("duplicate option id '{}'", id));
        }
    }
    Ok(())
}
