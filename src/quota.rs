use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{invalidate_patterns, Cache};
use crate::database::Database;
use crate::errors::EngineError;
use crate::models::{QuotaDecision, QuotaState, Sourced};
use crate::resilience::{read_with_fallback, ReadTtls, RetryPolicy};

pub const DAILY_LIMIT_REACHED: &str = "daily_limit_reached";

/// Subscription-backed allowance of practice sessions.
#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn check_limit(&self, user_id: Uuid) -> Result<QuotaDecision>;

    async fn increment_usage(&self, user_id: Uuid) -> Result<()>;

    async fn usage(&self, user_id: Uuid) -> Result<QuotaState>;
}

fn usage_day() -> String {
    Utc::now().date_naive().to_string()
}

/// Quota rows in the `user_quotas` table. Users without a row are on the
/// free tier with `free_daily_limit`; the daily counter resets on the first
/// read or write of a new UTC day.
#[derive(Clone)]
pub struct DatabaseQuotaService {
    db: Database,
    free_daily_limit: i64,
}

impl DatabaseQuotaService {
    pub fn new(db: Database, free_daily_limit: i64) -> Self {
        Self { db, free_daily_limit }
    }

    /// Record a subscription change for the user.
    pub async fn set_state(&self, user_id: Uuid, state: &QuotaState) -> Result<()> {
        self.db.set_quota(user_id, state, &usage_day()).await
    }
}

#[async_trait]
impl QuotaService for DatabaseQuotaService {
    async fn check_limit(&self, user_id: Uuid) -> Result<QuotaDecision> {
        let state = self.usage(user_id).await?;
        if state.tests_used_today >= state.limit_per_day {
            return Ok(QuotaDecision {
                allowed: false,
                reason: Some(DAILY_LIMIT_REACHED.to_string()),
            });
        }
        Ok(QuotaDecision { allowed: true, reason: None })
    }

    async fn increment_usage(&self, user_id: Uuid) -> Result<()> {
        self.db
            .increment_quota_usage(user_id, self.free_daily_limit, &usage_day())
            .await
    }

    async fn usage(&self, user_id: Uuid) -> Result<QuotaState> {
        Ok(self
            .db
            .get_quota(user_id, &usage_day())
            .await?
            .unwrap_or_else(|| QuotaState::free_tier_default(self.free_daily_limit)))
    }
}

pub fn quota_status_key(user_id: Uuid) -> String {
    format!("quota:{}:status", user_id)
}

/// Gate in front of the quota service, consulted before and after session
/// creation.
#[derive(Clone)]
pub struct QuotaGate {
    service: Arc<dyn QuotaService>,
    cache: Arc<dyn Cache>,
    retry: RetryPolicy,
    ttls: ReadTtls,
    free_daily_limit: i64,
}

impl QuotaGate {
    pub fn new(
        service: Arc<dyn QuotaService>,
        cache: Arc<dyn Cache>,
        retry: RetryPolicy,
        ttls: ReadTtls,
        free_daily_limit: i64,
    ) -> Self {
        Self {
            service,
            cache,
            retry,
            ttls,
            free_daily_limit,
        }
    }

    /// `QuotaExceeded` when the user may not start another session.
    pub async fn check(&self, user_id: Uuid) -> Result<(), EngineError> {
        let decision = self
            .retry
            .run("quota_check_limit", || self.service.check_limit(user_id))
            .await?;

        if decision.allowed {
            debug!(user_id = %user_id, "Quota check passed");
            return Ok(());
        }

        let reason = decision.reason.unwrap_or_else(|| DAILY_LIMIT_REACHED.to_string());
        warn!(user_id = %user_id, reason = %reason, "Quota exceeded");
        Err(EngineError::QuotaExceeded { reason })
    }

    /// Count one created session against the user's quota.
    pub async fn record_usage(&self, user_id: Uuid) -> Result<(), EngineError> {
        self.retry
            .run("quota_increment_usage", || self.service.increment_usage(user_id))
            .await?;
        invalidate_patterns(self.cache.as_ref(), &[format!("quota:{}:*", user_id)]).await;
        Ok(())
    }

    /// Quota status with stale fallback; defaults to the free tier with no
    /// usage when nothing is known.
    pub async fn status(&self, user_id: Uuid) -> Sourced<QuotaState> {
        let free_limit = self.free_daily_limit;
        read_with_fallback(
            self.cache.as_ref(),
            &quota_status_key(user_id),
            self.ttls,
            || self.retry.run("quota_usage", || self.service.usage(user_id)),
            || QuotaState::free_tier_default(free_limit),
        )
        .await
    }
}
