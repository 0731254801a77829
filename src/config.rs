//! Configuration types.
//!
//! Every section has a `Default` and a `from_env()` reader. Durations are
//! read as whole seconds unless the variable name ends in `_MS`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claimed task stays hidden from other workers.
    pub visibility_timeout: Duration,
    /// Default `max_attempts` for tasks submitted without one.
    pub default_max_attempts: u32,
    /// How long terminal tasks are kept before being purged.
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300), // 5 minutes
            default_max_attempts: 3,
            retention: Duration::from_secs(86_400), // 1 day
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            visibility_timeout: env_secs("ARQ_VISIBILITY_TIMEOUT_SECS", d.visibility_timeout)?,
            default_max_attempts: env_or("ARQ_DEFAULT_MAX_ATTEMPTS", d.default_max_attempts)?,
            retention: env_secs("ARQ_RETENTION_SECS", d.retention)?,
        })
    }
}

/// Retry backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry. Doubles on each following attempt.
    pub base_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            base_backoff: env_millis("ARQ_RETRY_BASE_MS", d.base_backoff)?,
            max_backoff: env_millis("ARQ_RETRY_MAX_MS", d.max_backoff)?,
        })
    }
}

/// Consumer pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// How long an idle worker waits for new work before polling again.
    pub poll_interval: Duration,
    /// Maximum time `shutdown()` waits for in-flight work.
    pub shutdown_grace: Duration,
    /// Interval between lease-reclaim and retention sweeps.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let worker_count: usize = env_or("ARQ_WORKERS", d.worker_count)?;
        if worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ARQ_WORKERS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(Self {
            worker_count,
            poll_interval: env_millis("ARQ_POLL_INTERVAL_MS", d.poll_interval)?,
            shutdown_grace: env_secs("ARQ_SHUTDOWN_GRACE_SECS", d.shutdown_grace)?,
            sweep_interval: env_secs("ARQ_SWEEP_INTERVAL_SECS", d.sweep_interval)?,
        })
    }
}

/// Circuit breaker configuration, shared by every per-service breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Consecutive half-open successes needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            failure_threshold: env_or("ARQ_BREAKER_FAILURES", d.failure_threshold)?,
            timeout: env_secs("ARQ_BREAKER_TIMEOUT_SECS", d.timeout)?,
            success_threshold: env_or("ARQ_BREAKER_SUCCESSES", d.success_threshold)?,
        })
    }
}

/// Per-client rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per client within one window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_requests: env_or("ARQ_RATE_LIMIT_MAX", d.max_requests)?,
            window: env_secs("ARQ_RATE_LIMIT_WINDOW_SECS", d.window)?,
        })
    }
}

/// Workflow engine configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Step timeout used when a step does not declare `timeout_ms`.
    pub default_step_timeout: Duration,
    /// Priority given to `workflow-step` tasks.
    pub step_priority: i64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(60),
            step_priority: 5,
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            default_step_timeout: env_secs("ARQ_STEP_TIMEOUT_SECS", d.default_step_timeout)?,
            step_priority: env_or("ARQ_STEP_PRIORITY", d.step_priority)?,
        })
    }
}

/// HTTP server and storage configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("./data/arq.db"),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            port: env_or("ARQ_PORT", d.port)?,
            db_path: std::env::var("ARQ_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.db_path),
        })
    }
}

/// Full process configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub workflow: WorkflowConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Build the configuration from `ARQ_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            queue: QueueConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            pool: PoolConfig::from_env()?,
            breaker: BreakerConfig::from_env()?,
            rate_limit: RateLimitConfig::from_env()?,
            workflow: WorkflowConfig::from_env()?,
            server: ServerConfig::from_env()?,
        };
        config.check_step_timeout()?;
        Ok(config)
    }

    /// A step must finish inside the lease of the task that carries it.
    fn check_step_timeout(&self) -> Result<(), ConfigError> {
        if self.workflow.default_step_timeout >= self.queue.visibility_timeout {
            return Err(ConfigError::InvalidValue {
                key: "ARQ_STEP_TIMEOUT_SECS".into(),
                message: format!(
                    "{:?} must be shorter than the {:?} visibility timeout",
                    self.workflow.default_step_timeout, self.queue.visibility_timeout
                ),
            });
        }
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn env_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_or(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}': {e}"),
    })
}
