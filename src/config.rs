use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

use crate::resilience::{CREATE_SESSION, SUBMIT_SESSION};

// Import logging macros
use crate::{log_system_event, log_validation};

/// Complete application configuration loaded from environment variables
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub rate_limits: RateLimitConfig,
    pub session: SessionConfig,
    pub quota: QuotaConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

/// Logging system configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
    pub console_enabled: bool,
    pub log_directory: String,
}

/// Cache sizing and TTLs
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Question pool entries
    pub pool_ttl_secs: u64,
    /// Fresh copies on read paths (session lists, quota status)
    pub read_ttl_secs: u64,
    /// Last-known-good copies served when the store is unavailable
    pub stale_ttl_secs: u64,
}

/// Retry wrapper settings shared by every store call
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub create_session: RateRule,
    pub submit_session: RateRule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub max_question_count: u32,
    /// Only questions with this provenance are drawn into sessions
    pub provenance_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    pub free_daily_limit: i64,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Result<Self> {
        log_system_event!(config, "Loading application configuration from environment variables");

        let config = Config {
            database: DatabaseConfig::from_env()?,
            server: ServerConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            rate_limits: RateLimitConfig::from_env()?,
            session: SessionConfig::from_env()?,
            quota: QuotaConfig::from_env()?,
        };

        log_system_event!(config, "Configuration loaded successfully");
        config.log_configuration_summary();

        Ok(config)
    }

    /// Log a summary of loaded configuration (without sensitive data)
    fn log_configuration_summary(&self) {
        info!(
            database_url_masked = %mask_sensitive_data(&self.database.url),
            server_address = %format!("{}:{}", self.server.host, self.server.port),
            log_level = %self.logging.level,
            pool_ttl_secs = self.cache.pool_ttl_secs,
            retry_attempts = self.retry.max_attempts,
            provenance_tag = %self.session.provenance_tag,
            free_daily_limit = self.quota.free_daily_limit,
            "Configuration summary"
        );
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.database.url.starts_with("sqlite:") {
            return Err(anyhow!("DATABASE_URL must start with 'sqlite:'"));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        if self.server.port == 0 {
            return Err(anyhow!("Server port must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow!("RETRY_MAX_ATTEMPTS must be at least 1"));
        }

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS"));
        }

        if self.retry.attempt_timeout_ms == 0 {
            return Err(anyhow!("RETRY_ATTEMPT_TIMEOUT_MS must be greater than 0"));
        }

        for (name, rule) in [
            (CREATE_SESSION, self.rate_limits.create_session),
            (SUBMIT_SESSION, self.rate_limits.submit_session),
        ] {
            if rule.max_requests == 0 || rule.window_secs == 0 {
                return Err(anyhow!("Rate limit for '{}' needs a positive quota and window", name));
            }
        }

        if self.session.max_question_count == 0 {
            return Err(anyhow!("SESSION_MAX_QUESTION_COUNT must be greater than 0"));
        }

        if self.session.provenance_tag.trim().is_empty() {
            return Err(anyhow!("QUESTION_PROVENANCE_TAG must not be empty"));
        }

        if self.quota.free_daily_limit < 0 {
            return Err(anyhow!("FREE_DAILY_TEST_LIMIT must not be negative"));
        }

        if self.cache.stale_ttl_secs < self.cache.read_ttl_secs {
            warn!("CACHE_STALE_TTL_SECS is shorter than CACHE_READ_TTL_SECS - stale fallback will rarely apply");
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.to_lowercase().as_str()) {
            // Directive strings like "info,practice_engine=debug" are still valid filters
            info!(level = %self.logging.level, "Using custom log filter directive");
        }

        log_validation!(success, "configuration", "Configuration validation completed successfully");
        Ok(())
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| anyhow!("Invalid {} value: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:practice_engine.db".to_string(),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:practice_engine.db".to_string());
        let max_connections = env_or("DATABASE_MAX_CONNECTIONS", 5)?;

        Ok(DatabaseConfig { url, max_connections })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        let port_str = env::var("PORT").unwrap_or_else(|_| "3000".to_string());

        let port = port_str
            .parse::<u16>()
            .map_err(|_| anyhow!("Invalid PORT value: '{}'. Must be a number between 1-65535", port_str))?;

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        Ok(ServerConfig { port, host })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,practice_engine=debug".to_string(),
            file_enabled: true,
            console_enabled: true,
            log_directory: "logs".to_string(),
        }
    }
}

impl LoggingConfig {
    fn from_env() -> Result<Self> {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info,practice_engine=debug".to_string());

        let file_enabled = env::var("LOG_FILE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let console_enabled = env::var("LOG_CONSOLE_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let log_directory = env::var("LOG_DIRECTORY").unwrap_or_else(|_| "logs".to_string());

        Ok(LoggingConfig {
            level,
            file_enabled,
            console_enabled,
            log_directory,
        })
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            pool_ttl_secs: 3600,
            read_ttl_secs: 60,
            stale_ttl_secs: 86_400,
        }
    }
}

impl CacheConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(CacheConfig {
            max_entries: env_or("CACHE_MAX_ENTRIES", defaults.max_entries)?,
            pool_ttl_secs: env_or("CACHE_POOL_TTL_SECS", defaults.pool_ttl_secs)?,
            read_ttl_secs: env_or("CACHE_READ_TTL_SECS", defaults.read_ttl_secs)?,
            stale_ttl_secs: env_or("CACHE_STALE_TTL_SECS", defaults.stale_ttl_secs)?,
        })
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl RetryConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(RetryConfig {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay_ms: env_or("RETRY_BASE_DELAY_MS", defaults.base_delay_ms)?,
            max_delay_ms: env_or("RETRY_MAX_DELAY_MS", defaults.max_delay_ms)?,
            attempt_timeout_ms: env_or("RETRY_ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout_ms)?,
        })
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            create_session: RateRule { max_requests: 10, window_secs: 60 },
            submit_session: RateRule { max_requests: 5, window_secs: 60 },
        }
    }
}

impl RateLimitConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(RateLimitConfig {
            create_session: RateRule {
                max_requests: env_or("RATE_LIMIT_CREATE_SESSION_MAX", defaults.create_session.max_requests)?,
                window_secs: env_or("RATE_LIMIT_CREATE_SESSION_WINDOW_SECS", defaults.create_session.window_secs)?,
            },
            submit_session: RateRule {
                max_requests: env_or("RATE_LIMIT_SUBMIT_SESSION_MAX", defaults.submit_session.max_requests)?,
                window_secs: env_or("RATE_LIMIT_SUBMIT_SESSION_WINDOW_SECS", defaults.submit_session.window_secs)?,
            },
        })
    }

    pub fn rule_for(&self, action: &str) -> Option<RateRule> {
        match action {
            CREATE_SESSION => Some(self.create_session),
            SUBMIT_SESSION => Some(self.submit_session),
            _ => None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_question_count: 200,
            provenance_tag: "ai_generated".to_string(),
        }
    }
}

impl SessionConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(SessionConfig {
            max_question_count: env_or("SESSION_MAX_QUESTION_COUNT", defaults.max_question_count)?,
            provenance_tag: env::var("QUESTION_PROVENANCE_TAG").unwrap_or(defaults.provenance_tag),
        })
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { free_daily_limit: 3 }
    }
}

impl QuotaConfig {
    fn from_env() -> Result<Self> {
        Ok(QuotaConfig {
            free_daily_limit: env_or("FREE_DAILY_TEST_LIMIT", Self::default().free_daily_limit)?,
        })
    }
}

/// Mask sensitive data in configuration for safe logging
fn mask_sensitive_data(data: &str) -> String {
    if data.len() <= 8 {
        "*".repeat(data.len())
    } else {
        format!("{}***{}", &data[..4], &data[data.len() - 4..])
    }
}
