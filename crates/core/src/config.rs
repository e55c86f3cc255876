use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

// ── Throttle config ───────────────────────────────────────────

/// Admission-control settings for the shared inference backend.
///
/// Every field has a serde default so partial TOML files are valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Executing requests (all tiers) at which throttleable work is deferred.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Width of the shared critical section for throttleable execution.
    #[serde(default = "default_background_permits")]
    pub background_permits: usize,
    /// Seconds after protected-tier activity during which background work is paused.
    #[serde(default = "default_pause_window")]
    pub pause_window_secs: u64,
    /// Activity records older than this are purged.
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_secs: u64,
    /// Freshness required by protected-tier cache lookups.
    #[serde(default = "default_protected_ttl")]
    pub protected_cache_ttl_secs: u64,
    /// Freshness required by throttleable-tier cache lookups.
    #[serde(default = "default_background_ttl")]
    pub background_cache_ttl_secs: u64,
    /// Maximum number of cache entries (LRU bound).
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Backoff before a capacity-deferred request is re-examined.
    #[serde(default = "default_defer_backoff")]
    pub defer_backoff_ms: u64,
    /// Timeout budget used when a submission does not name one.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Period of the activity/cache cleanup loop.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Pause taken by the dispatch loop after a failed iteration.
    #[serde(default = "default_dispatch_error_pause")]
    pub dispatch_error_pause_ms: u64,
}

fn default_max_concurrent() -> usize { 5 }
fn default_background_permits() -> usize { 1 }
fn default_pause_window() -> u64 { 30 }
fn default_activity_timeout() -> u64 { 300 }
fn default_protected_ttl() -> u64 { 30 }
fn default_background_ttl() -> u64 { 300 }
fn default_cache_capacity() -> usize { 10_000 }
fn default_defer_backoff() -> u64 { 250 }
fn default_timeout() -> u64 { 30 }
fn default_cleanup_interval() -> u64 { 60 }
fn default_dispatch_error_pause() -> u64 { 100 }

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            background_permits: default_background_permits(),
            pause_window_secs: default_pause_window(),
            activity_timeout_secs: default_activity_timeout(),
            protected_cache_ttl_secs: default_protected_ttl(),
            background_cache_ttl_secs: default_background_ttl(),
            cache_capacity: default_cache_capacity(),
            defer_backoff_ms: default_defer_backoff(),
            default_timeout_secs: default_timeout(),
            cleanup_interval_secs: default_cleanup_interval(),
            dispatch_error_pause_ms: default_dispatch_error_pause(),
        }
    }
}

impl ThrottleConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `THROTTLE_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("THROTTLE_PROFILE", "").to_uppercase();
        let mut config = Self::default();
        config.apply_env_overrides(&profile);
        config
    }

    /// Parse config from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let mut config: Self = toml::from_str(toml_str)?;
        let profile = env_or("THROTTLE_PROFILE", "").to_uppercase();
        config.apply_env_overrides(&profile);
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `THROTTLE_<FIELD>` overrides `<field>`, e.g.
    /// `THROTTLE_MAX_CONCURRENT` -> `max_concurrent`. Unparseable values are ignored.
    fn apply_env_overrides(&mut self, p: &str) {
        if let Some(v) = profiled_env_parse(p, "THROTTLE_MAX_CONCURRENT") {
            self.max_concurrent = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_BACKGROUND_PERMITS") {
            self.background_permits = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_PAUSE_WINDOW_SECS") {
            self.pause_window_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_ACTIVITY_TIMEOUT_SECS") {
            self.activity_timeout_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_PROTECTED_CACHE_TTL_SECS") {
            self.protected_cache_ttl_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_BACKGROUND_CACHE_TTL_SECS") {
            self.background_cache_ttl_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_CACHE_CAPACITY") {
            self.cache_capacity = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_DEFER_BACKOFF_MS") {
            self.defer_backoff_ms = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_DEFAULT_TIMEOUT_SECS") {
            self.default_timeout_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "THROTTLE_DISPATCH_ERROR_PAUSE_MS") {
            self.dispatch_error_pause_ms = v;
        }
    }

    /// Reject settings the scheduler cannot honor.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent == 0 {
            return Err(CoreError::InvalidConfig("max_concurrent must be > 0".into()));
        }
        if self.background_permits == 0 {
            return Err(CoreError::InvalidConfig("background_permits must be > 0".into()));
        }
        if self.background_permits > self.max_concurrent {
            return Err(CoreError::InvalidConfig(format!(
                "background_permits ({}) exceeds max_concurrent ({})",
                self.background_permits, self.max_concurrent
            )));
        }
        if self.cache_capacity == 0 {
            return Err(CoreError::InvalidConfig("cache_capacity must be > 0".into()));
        }
        if self.protected_cache_ttl_secs > self.background_cache_ttl_secs {
            return Err(CoreError::InvalidConfig(
                "protected cache TTL must not exceed background cache TTL".into(),
            ));
        }
        Ok(())
    }

    pub fn pause_window(&self) -> Duration {
        Duration::from_secs(self.pause_window_secs)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs)
    }

    pub fn protected_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.protected_cache_ttl_secs)
    }

    pub fn background_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.background_cache_ttl_secs)
    }

    pub fn defer_backoff(&self) -> Duration {
        Duration::from_millis(self.defer_backoff_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn dispatch_error_pause(&self) -> Duration {
        Duration::from_millis(self.dispatch_error_pause_ms)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Throttle config loaded:");
        tracing::info!(
            "  admission:  max_concurrent={}, background_permits={}",
            self.max_concurrent,
            self.background_permits
        );
        tracing::info!(
            "  activity:   pause_window={}s, timeout={}s",
            self.pause_window_secs,
            self.activity_timeout_secs
        );
        tracing::info!(
            "  cache:      protected_ttl={}s, background_ttl={}s, capacity={}",
            self.protected_cache_ttl_secs,
            self.background_cache_ttl_secs,
            self.cache_capacity
        );
        tracing::info!(
            "  dispatch:   backoff={}ms, default_timeout={}s, cleanup_every={}s",
            self.defer_backoff_ms,
            self.default_timeout_secs,
            self.cleanup_interval_secs
        );
    }
}
