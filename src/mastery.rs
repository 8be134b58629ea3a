use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::errors::EngineError;
use crate::models::{MasteryLevel, TopicMastery};
use crate::resilience::RetryPolicy;
use crate::log_service_warn;

/// `round(correct / attempted * 100)`, halves rounding up. Zero attempts is 0%.
pub fn accuracy_percentage(correct: i64, attempted: i64) -> i64 {
    if attempted <= 0 {
        return 0;
    }
    (correct as f64 / attempted as f64 * 100.0).round() as i64
}

/// Mastery level from attempt volume and accuracy; the first matching band wins.
pub fn level_for(attempted: i64, accuracy: i64) -> MasteryLevel {
    match (attempted, accuracy) {
        (a, acc) if a >= 20 && acc >= 90 => MasteryLevel::Mastered,
        (a, acc) if a >= 20 && acc >= 75 => MasteryLevel::Advanced,
        (a, acc) if a >= 20 && acc >= 60 => MasteryLevel::Intermediate,
        (a, _) if a >= 20 => MasteryLevel::Beginner,
        (a, acc) if a >= 10 && acc >= 80 => MasteryLevel::Advanced,
        (a, acc) if a >= 10 && acc >= 60 => MasteryLevel::Intermediate,
        (a, _) if a >= 10 => MasteryLevel::Beginner,
        (a, acc) if a >= 5 && acc >= 70 => MasteryLevel::Intermediate,
        _ => MasteryLevel::Beginner,
    }
}

#[derive(Clone)]
pub struct TopicMasteryUpdater {
    db: Database,
    retry: RetryPolicy,
}

impl TopicMasteryUpdater {
    pub fn new(db: Database, retry: RetryPolicy) -> Self {
        Self { db, retry }
    }

    /// Apply one attempt to the (user, topic) row in a single transaction.
    pub async fn update(&self, user_id: Uuid, topic_id: Uuid, is_correct: bool) -> Result<TopicMastery> {
        let mastery = self
            .retry
            .run("apply_mastery_attempt", || self.db.apply_mastery_attempt(user_id, topic_id, is_correct))
            .await?;

        debug!(
            user_id = %user_id,
            topic_id = %topic_id,
            attempted = mastery.questions_attempted,
            accuracy = mastery.accuracy_percentage,
            level = mastery.mastery_level.as_str(),
            "Topic mastery updated"
        );
        Ok(mastery)
    }

    /// One independent update per entry, never merged per topic. Failures
    /// are logged; returns how many updates were applied.
    pub async fn update_batch(&self, user_id: Uuid, deltas: &[(Uuid, bool)]) -> usize {
        let mut applied = 0;
        for &(topic_id, is_correct) in deltas {
            match self.update(user_id, topic_id, is_correct).await {
                Ok(_) => applied += 1,
                Err(e) => {
                    warn!(user_id = %user_id, topic_id = %topic_id, error = %e, "Topic mastery update failed");
                }
            }
        }
        if applied < deltas.len() {
            log_service_warn!(
                "mastery",
                "update_batch",
                format!("applied {} of {} mastery updates", applied, deltas.len())
            );
        }
        applied
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<TopicMastery>, EngineError> {
        let rows = self
            .retry
            .run("list_topic_mastery", || self.db.list_topic_mastery(user_id))
            .await?;
        Ok(rows)
    }
}
