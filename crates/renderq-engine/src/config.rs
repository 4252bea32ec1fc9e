//! Engine configuration.

use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry budget applied when the submission does not override it
    pub default_max_retries: u32,
    /// Lease duration granted on acquire and renew
    pub lease_ttl: Duration,
    /// How often the reaper scans for expired, unrenewed leases
    pub reaper_interval: Duration,
    /// Base delay for retry backoff (doubles per attempt)
    pub retry_base: Duration,
    /// Upper bound on the retry delay before jitter
    pub retry_cap: Duration,
    /// Minimum interval between progress events per task
    pub progress_interval: Duration,
    /// Base delay between terminal-event redelivery attempts
    pub event_retry_delay: Duration,
    /// Upper bound on the redelivery delay
    pub event_retry_cap: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            lease_ttl: Duration::from_secs(600), // 10 minutes
            reaper_interval: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(300),
            progress_interval: Duration::from_millis(500),
            event_retry_delay: Duration::from_millis(500),
            event_retry_cap: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_max_retries: env_parse("ENGINE_MAX_RETRIES", defaults.default_max_retries),
            lease_ttl: Duration::from_secs(env_parse(
                "ENGINE_LEASE_TTL_SECS",
                defaults.lease_ttl.as_secs(),
            )),
            reaper_interval: Duration::from_secs(env_parse(
                "ENGINE_REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )),
            retry_base: Duration::from_millis(env_parse(
                "ENGINE_RETRY_BASE_MS",
                defaults.retry_base.as_millis() as u64,
            )),
            retry_cap: Duration::from_secs(env_parse(
                "ENGINE_RETRY_CAP_SECS",
                defaults.retry_cap.as_secs(),
            )),
            progress_interval: Duration::from_millis(env_parse(
                "ENGINE_PROGRESS_INTERVAL_MS",
                defaults.progress_interval.as_millis() as u64,
            )),
            event_retry_delay: Duration::from_millis(env_parse(
                "ENGINE_EVENT_RETRY_MS",
                defaults.event_retry_delay.as_millis() as u64,
            )),
            event_retry_cap: Duration::from_secs(env_parse(
                "ENGINE_EVENT_RETRY_CAP_SECS",
                defaults.event_retry_cap.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
