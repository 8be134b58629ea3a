use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Key/value cache with per-entry TTL and glob-pattern deletion.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Delete every key matching `pattern` (`*` and `?` wildcards). Returns
    /// the number of removed entries.
    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError>;
}

pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<Option<T>, CacheError> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize + ?Sized>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, raw, ttl).await
}

/// Delete a set of patterns, logging failures instead of returning them.
/// Every write path invalidates this way.
pub async fn invalidate_patterns(cache: &dyn Cache, patterns: &[String]) {
    for pattern in patterns {
        match cache.delete_pattern(pattern).await {
            Ok(removed) => debug!(pattern = %pattern, removed, "Invalidated cache entries"),
            Err(e) => warn!(pattern = %pattern, error = %e, "Cache invalidation failed"),
        }
    }
}

/// Translate a glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    inserted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// In-memory cache with TTL support and oldest-first eviction
#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
        }
    }

    fn cleanup_expired_entries(entries: &mut HashMap<String, CacheEntry>, now: DateTime<Utc>) {
        entries.retain(|_, entry| entry.expires_at > now);
    }

    fn evict_oldest(entries: &mut HashMap<String, CacheEntry>) {
        if let Some(oldest_key) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(key, _)| key.clone())
        {
            entries.remove(&oldest_key);
            debug!(key = %oldest_key, "Evicted oldest cache entry");
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.write().await;
        let now = Utc::now();

        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                debug!(key = %key, "Cache hit");
                return Ok(Some(entry.value.clone()));
            }
            entries.remove(key);
        }

        debug!(key = %key, "Cache miss");
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));

        let mut entries = self.entries.write().await;
        Self::cleanup_expired_entries(&mut entries, now);

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            Self::evict_oldest(&mut entries);
        }

        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let matcher = glob_to_regex(pattern)?;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !matcher.is_match(key));
        Ok(before - entries.len())
    }
}
