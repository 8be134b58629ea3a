//! Retry-with-backoff for store calls, per-user rate limiting and the
//! stale-cache fallback used by read paths.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{get_json, set_json, Cache};
use crate::config::{CacheConfig, RateLimitConfig, RetryConfig};
use crate::errors::EngineError;
use crate::models::{DataSource, Sourced};

pub const CREATE_SESSION: &str = "create-session";
pub const SUBMIT_SESSION: &str = "submit-session";

// SQLITE_BUSY, SQLITE_LOCKED and their extended codes
const TRANSIENT_SQLITE_CODES: &[&str] = &["5", "6", "261", "262", "517"];

#[derive(Debug, thiserror::Error)]
#[error("operation '{operation}' timed out after {after:?}")]
pub struct AttemptTimedOut {
    pub operation: String,
    pub after: Duration,
}

/// Whether an error is worth retrying: connection trouble, lock contention
/// or an attempt timeout. Constraint violations and decode errors are not.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<AttemptTimedOut>().is_some() {
            return true;
        }
        match cause.downcast_ref::<sqlx::Error>() {
            Some(sqlx_err) => is_transient_sqlx(sqlx_err),
            None => false,
        }
    })
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            let code_matches = db_err
                .code()
                .map(|code| TRANSIENT_SQLITE_CODES.contains(&&*code))
                .unwrap_or(false);
            code_matches || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }

    /// Delay before retry number `retry` (zero-based): `base * 2^retry`,
    /// capped at `max_delay`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent. Each attempt is bounded by `attempt_timeout`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::Error::new(AttemptTimedOut {
                    operation: operation.to_string(),
                    after: self.attempt_timeout,
                })),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = operation, attempts = attempt, "Store operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts && is_transient(&e) => {
                    let delay = self.backoff_delay(attempt - 1);
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if is_transient(&e) {
                        error!(operation = operation, attempts = attempt, error = %e, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct RateWindow {
    count: u32,
    window_start: i64,
}

/// Fixed-window request counter per (user, action[, scope]), stored in the cache.
#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    rules: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, rules: RateLimitConfig) -> Self {
        Self { cache, rules }
    }

    fn key(user_id: Uuid, action: &str, scope: Option<&str>) -> String {
        match scope {
            Some(scope) => format!("ratelimit:{}:{}:{}", action, user_id, scope),
            None => format!("ratelimit:{}:{}", action, user_id),
        }
    }

    /// Count one request. Cache failures let the request through.
    pub async fn check(&self, user_id: Uuid, action: &str, scope: Option<&str>) -> Result<(), EngineError> {
        let Some(rule) = self.rules.rule_for(action) else {
            return Ok(());
        };
        let window_secs = rule.window_secs.max(1) as i64;
        let key = Self::key(user_id, action, scope);
        let now = Utc::now().timestamp();

        let current = match get_json::<RateWindow>(self.cache.as_ref(), &key).await {
            Ok(window) => window.filter(|w| now < w.window_start + window_secs),
            Err(e) => {
                warn!(action = action, user_id = %user_id, error = %e, "Rate limiter unavailable, allowing request");
                return Ok(());
            }
        };

        let next = match current {
            Some(window) if window.count >= rule.max_requests => {
                let retry_after_secs = (window.window_start + window_secs - now).max(1) as u64;
                debug!(action = action, user_id = %user_id, count = window.count, "Rate limit exceeded");
                return Err(EngineError::RateLimited {
                    action: action.to_string(),
                    retry_after_secs,
                });
            }
            Some(window) => RateWindow { count: window.count + 1, ..window },
            None => RateWindow { count: 1, window_start: now },
        };

        let remaining = (next.window_start + window_secs - now).max(1) as u64;
        if let Err(e) = set_json(self.cache.as_ref(), &key, &next, Duration::from_secs(remaining)).await {
            warn!(action = action, user_id = %user_id, error = %e, "Failed to record rate limit window");
        }
        Ok(())
    }
}

/// TTLs of the fresh and stale copies kept by [`read_with_fallback`].
#[derive(Debug, Clone, Copy)]
pub struct ReadTtls {
    pub fresh: Duration,
    pub stale: Duration,
}

impl ReadTtls {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            fresh: Duration::from_secs(config.read_ttl_secs),
            stale: Duration::from_secs(config.stale_ttl_secs),
        }
    }
}

pub fn stale_key(key: &str) -> String {
    format!("stale:{}", key)
}

/// Cached read with provenance: fresh cache, then the store, then the last
/// known value, then `default`.
pub async fn read_with_fallback<T, F, Fut, D>(
    cache: &dyn Cache,
    key: &str,
    ttls: ReadTtls,
    fetch: F,
    default: D,
) -> Sourced<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    D: FnOnce() -> T,
{
    match get_json::<T>(cache, key).await {
        Ok(Some(data)) => return Sourced { data, source: DataSource::Cache },
        Ok(None) => {}
        Err(e) => warn!(key = %key, error = %e, "Cache read failed, reading from store"),
    }

    match fetch().await {
        Ok(data) => {
            if let Err(e) = set_json(cache, key, &data, ttls.fresh).await {
                warn!(key = %key, error = %e, "Failed to cache fresh value");
            }
            if let Err(e) = set_json(cache, &stale_key(key), &data, ttls.stale).await {
                warn!(key = %key, error = %e, "Failed to cache fallback value");
            }
            Sourced { data, source: DataSource::Database }
        }
        Err(fetch_err) => match get_json::<T>(cache, &stale_key(key)).await {
            Ok(Some(data)) => {
                warn!(key = %key, error = %fetch_err, "Store read failed, serving stale value");
                Sourced { data, source: DataSource::Stale }
            }
            other => {
                if let Err(cache_err) = other {
                    warn!(key = %key, error = %cache_err, "Fallback cache read failed");
                }
                error!(key = %key, error = %fetch_err, "Store read failed with no fallback, serving default");
                Sourced { data: default(), source: DataSource::ErrorDefault }
            }
        },
    }
}
