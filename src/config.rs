//! Environment-driven configuration for the tunables this crate owns:
//! rate-limit policies, lock/processing timeouts, dispatcher pool sizes, and
//! the webhook retry/rate-limit tables. Exposes a
//! `Config::load()` / `load_from_file()` / `load_from_env()` triad.

use eyre::{Result, WrapErr};
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub dispatcher: DispatcherConfig,
    pub lifecycle: LifecycleConfig,
    pub rate_limiter: RateLimiterConfig,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub global_concurrency: usize,
    pub per_tenant_concurrency: usize,
    pub allow_concurrent_team_processing: bool,
    pub team_limit_deadline: Duration,
    pub retry_sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub lock_timeout: Duration,
    pub processing_timeout: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub sweep_interval: Duration,
    pub sweep_grace: chrono::Duration,
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_worker_count() -> usize {
    num_cpus_or_default()
}

fn num_cpus_or_default() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn default_global_concurrency() -> usize {
    2 * default_worker_count()
}

fn default_per_tenant_concurrency() -> usize {
    5
}

fn default_team_limit_deadline_ms() -> u64 {
    100
}

fn default_retry_sweep_interval_secs() -> u64 {
    10
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_processing_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_retry_delay_ms() -> u64 {
    100
}

fn default_rate_limiter_sweep_interval_secs() -> u64 {
    60
}

fn default_rate_limiter_sweep_grace_secs() -> i64 {
    300
}

impl Config {
    /// Load `.env` if present, then read from the environment.
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("failed to load .env file from {path}"))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let worker_count = env::var("DISPATCHER_WORKER_COUNT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_worker_count);

        let dispatcher = DispatcherConfig {
            queue_capacity: env::var("DISPATCHER_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_queue_capacity),
            worker_count,
            global_concurrency: env::var("DISPATCHER_GLOBAL_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2 * worker_count),
            per_tenant_concurrency: env::var("DISPATCHER_PER_TENANT_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_per_tenant_concurrency),
            allow_concurrent_team_processing: env::var("DISPATCHER_ALLOW_CONCURRENT_TEAM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            team_limit_deadline: Duration::from_millis(
                env::var("DISPATCHER_TEAM_LIMIT_DEADLINE_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_team_limit_deadline_ms),
            ),
            retry_sweep_interval: Duration::from_secs(
                env::var("DISPATCHER_RETRY_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_retry_sweep_interval_secs),
            ),
        };

        let lifecycle = LifecycleConfig {
            lock_timeout: Duration::from_secs(
                env::var("LIFECYCLE_LOCK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_lock_timeout_secs),
            ),
            processing_timeout: Duration::from_secs(
                env::var("LIFECYCLE_PROCESSING_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_processing_timeout_secs),
            ),
            max_retries: env::var("LIFECYCLE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_retries),
            base_retry_delay: Duration::from_millis(
                env::var("LIFECYCLE_BASE_RETRY_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_base_retry_delay_ms),
            ),
        };

        let rate_limiter = RateLimiterConfig {
            sweep_interval: Duration::from_secs(
                env::var("RATE_LIMITER_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_rate_limiter_sweep_interval_secs),
            ),
            sweep_grace: chrono::Duration::seconds(
                env::var("RATE_LIMITER_SWEEP_GRACE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_rate_limiter_sweep_grace_secs),
            ),
        };

        Ok(Config {
            dispatcher,
            lifecycle,
            rate_limiter,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        let worker_count = default_worker_count();
        Config {
            dispatcher: DispatcherConfig {
                queue_capacity: default_queue_capacity(),
                worker_count,
                global_concurrency: 2 * worker_count,
                per_tenant_concurrency: default_per_tenant_concurrency(),
                allow_concurrent_team_processing: false,
                team_limit_deadline: Duration::from_millis(default_team_limit_deadline_ms()),
                retry_sweep_interval: Duration::from_secs(default_retry_sweep_interval_secs()),
            },
            lifecycle: LifecycleConfig {
                lock_timeout: Duration::from_secs(default_lock_timeout_secs()),
                processing_timeout: Duration::from_secs(default_processing_timeout_secs()),
                max_retries: default_max_retries(),
                base_retry_delay: Duration::from_millis(default_base_retry_delay_ms()),
            },
            rate_limiter: RateLimiterConfig {
                sweep_interval: Duration::from_secs(default_rate_limiter_sweep_interval_secs()),
                sweep_grace: chrono::Duration::seconds(default_rate_limiter_sweep_grace_secs()),
            },
        }
    }
}
