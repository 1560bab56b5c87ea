use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TallyError;

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

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).as_deref() {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    pub processing: ProcessingConfig,
    pub rules: RulesConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub escalation: EscalationConfig,
    pub aggregation: AggregationConfig,
}

impl TallyConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TALLY_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TALLY_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            processing: ProcessingConfig::from_env_profiled(p),
            rules: RulesConfig::from_env_profiled(p),
            retry: RetryConfig::from_env_profiled(p),
            circuit_breaker: CircuitBreakerConfig::from_env_profiled(p),
            escalation: EscalationConfig::from_env_profiled(p),
            aggregation: AggregationConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), TallyError> {
        let bad = |msg: &str| Err(TallyError::Config(msg.to_string()));

        if self.processing.max_batch_size == 0 {
            return bad("max_batch_size must be at least 1");
        }
        if self.processing.concurrency == 0 {
            return bad("concurrency must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.processing.error_tolerance) {
            return bad("error_tolerance must be within [0, 1]");
        }
        if self.rules.entity_id_digits == 0 {
            return bad("entity_id_digits must be at least 1");
        }
        if self.rules.max_errors == 0 {
            return bad("max_validation_errors must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return bad("retry max_attempts must be at least 1");
        }
        if self.retry.backoff_factor < 1.0 {
            return bad("retry backoff_factor must be >= 1.0");
        }
        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            return bad("retry jitter_factor must be within [0, 1)");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return bad("retry max_delay_ms must be >= initial_delay_ms");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return bad("circuit breaker failure_threshold must be at least 1");
        }
        if self.circuit_breaker.half_open_max_attempts == 0 {
            return bad("circuit breaker half_open_max_attempts must be at least 1");
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        for line in self.summary_lines() {
            tracing::info!("{line}");
        }
    }

    /// One line per config section, in the order they are logged.
    pub fn summary_lines(&self) -> Vec<String> {
        vec![
            format!(
                "  processing:  batch={}, concurrency={}, tolerance={}, optimistic={}",
                self.processing.max_batch_size,
                self.processing.concurrency,
                self.processing.error_tolerance,
                self.processing.optimistic_updates
            ),
            format!(
                "  rules:       id={}{{{}}}, max_increment={}, reject_zero={}",
                self.rules.entity_id_prefix,
                self.rules.entity_id_digits,
                self.rules.max_increment,
                self.rules.reject_zero_increments
            ),
            format!(
                "  retry:       attempts={}, delay={}..{}ms, factor={}, jitter={}",
                self.retry.max_attempts,
                self.retry.initial_delay_ms,
                self.retry.max_delay_ms,
                self.retry.backoff_factor,
                self.retry.jitter_factor
            ),
            format!(
                "  breaker:     threshold={}, reset={}ms, half_open={}",
                self.circuit_breaker.failure_threshold,
                self.circuit_breaker.reset_timeout_ms,
                self.circuit_breaker.half_open_max_attempts
            ),
            format!(
                "  escalation:  streak={}, gap={}ms, window={}s",
                self.escalation.streak_threshold,
                self.escalation.inter_arrival_ms,
                self.escalation.window_secs
            ),
            format!(
                "  aggregation: review={}%, critical={}%, dominant={}%, min_throughput={}/s",
                self.aggregation.review_error_rate,
                self.aggregation.critical_error_rate,
                self.aggregation.dominant_error_share,
                self.aggregation.min_throughput
            ),
        ]
    }

    /// Config as JSON, safe for output (no secrets are held).
    pub fn summary(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ── Processing ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum items accepted in one chunk.
    pub max_batch_size: usize,
    /// Item pipelines allowed in flight at once.
    pub concurrency: usize,
    /// Chunk error ratio above which a warning is logged.
    pub error_tolerance: f64,
    /// Write with a version precondition instead of last-write-wins.
    pub optimistic_updates: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            concurrency: 5,
            error_tolerance: 0.05,
            optimistic_updates: false,
        }
    }
}

impl ProcessingConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_batch_size: profiled_env_parse(p, "TALLY_MAX_BATCH_SIZE", d.max_batch_size),
            concurrency: profiled_env_parse(p, "TALLY_CONCURRENCY", d.concurrency),
            error_tolerance: profiled_env_parse(p, "TALLY_ERROR_TOLERANCE", d.error_tolerance),
            optimistic_updates: profiled_env_bool(p, "TALLY_OPTIMISTIC_UPDATES", d.optimistic_updates),
        }
    }
}

// ── Business rules ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Column holding the entity identifier.
    pub entity_id_column: String,
    /// Counter columns that carry increments.
    pub counter_columns: Vec<String>,
    pub entity_id_prefix: String,
    pub entity_id_digits: usize,
    /// Sanity ceiling for a single increment.
    pub max_increment: u64,
    /// Increments above this are accepted but reported as warnings.
    pub warn_increment: u64,
    /// Reject records whose increments are all zero.
    pub reject_zero_increments: bool,
    /// Validation stops collecting individual errors after this many.
    pub max_errors: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            entity_id_column: "entityId".to_string(),
            counter_columns: vec!["counterA".to_string(), "counterB".to_string()],
            entity_id_prefix: "U".to_string(),
            entity_id_digits: 5,
            max_increment: 10_000,
            warn_increment: 1_000,
            reject_zero_increments: true,
            max_errors: 100,
        }
    }
}

impl RulesConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        let counter_columns = profiled_env_opt(p, "TALLY_COUNTER_COLUMNS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(d.counter_columns);
        Self {
            entity_id_column: profiled_env_or(p, "TALLY_ENTITY_ID_COLUMN", &d.entity_id_column),
            counter_columns,
            entity_id_prefix: profiled_env_or(p, "TALLY_ENTITY_ID_PREFIX", &d.entity_id_prefix),
            entity_id_digits: profiled_env_parse(p, "TALLY_ENTITY_ID_DIGITS", d.entity_id_digits),
            max_increment: profiled_env_parse(p, "TALLY_MAX_INCREMENT", d.max_increment),
            warn_increment: profiled_env_parse(p, "TALLY_WARN_INCREMENT", d.warn_increment),
            reject_zero_increments: profiled_env_bool(
                p,
                "TALLY_REJECT_ZERO_INCREMENTS",
                d.reject_zero_increments,
            ),
            max_errors: profiled_env_parse(p, "TALLY_MAX_VALIDATION_ERRORS", d.max_errors),
        }
    }
}

// ── Retry ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Relative jitter applied to every delay, e.g. `0.1` = ±10%.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            max_attempts: profiled_env_parse(p, "TALLY_RETRY_MAX_ATTEMPTS", d.max_attempts),
            initial_delay_ms: profiled_env_parse(p, "TALLY_RETRY_INITIAL_DELAY_MS", d.initial_delay_ms),
            max_delay_ms: profiled_env_parse(p, "TALLY_RETRY_MAX_DELAY_MS", d.max_delay_ms),
            backoff_factor: profiled_env_parse(p, "TALLY_RETRY_BACKOFF_FACTOR", d.backoff_factor),
            jitter_factor: profiled_env_parse(p, "TALLY_RETRY_JITTER", d.jitter_factor),
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ── Circuit breaker ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max_attempts: 1,
        }
    }
}

impl CircuitBreakerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            failure_threshold: profiled_env_parse(p, "TALLY_CB_FAILURE_THRESHOLD", d.failure_threshold),
            reset_timeout_ms: profiled_env_parse(p, "TALLY_CB_RESET_TIMEOUT_MS", d.reset_timeout_ms),
            half_open_max_attempts: profiled_env_parse(
                p,
                "TALLY_CB_HALF_OPEN_MAX_ATTEMPTS",
                d.half_open_max_attempts,
            ),
        }
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

// ── Escalation ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Escalate once a consecutive streak exceeds this length.
    pub streak_threshold: u32,
    /// Failures closer together than this count as consecutive.
    pub inter_arrival_ms: u64,
    /// Length of the rolling failure window.
    pub window_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            streak_threshold: 5,
            inter_arrival_ms: 5_000,
            window_secs: 300,
        }
    }
}

impl EscalationConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            streak_threshold: profiled_env_parse(p, "TALLY_ESCALATION_STREAK", d.streak_threshold),
            inter_arrival_ms: profiled_env_parse(p, "TALLY_ESCALATION_INTER_ARRIVAL_MS", d.inter_arrival_ms),
            window_secs: profiled_env_parse(p, "TALLY_ESCALATION_WINDOW_SECS", d.window_secs),
        }
    }

    pub fn inter_arrival(&self) -> Duration {
        Duration::from_millis(self.inter_arrival_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// ── Aggregation ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Error rate (percent) above which a review is recommended.
    pub review_error_rate: f64,
    /// Error rate (percent) above which the run is flagged critical.
    pub critical_error_rate: f64,
    /// Share (percent) of all errors above which a single type is named.
    pub dominant_error_share: f64,
    /// Records per second below which tuning is recommended.
    pub min_throughput: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            review_error_rate: 5.0,
            critical_error_rate: 10.0,
            dominant_error_share: 50.0,
            min_throughput: 10.0,
        }
    }
}

impl AggregationConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            review_error_rate: profiled_env_parse(p, "TALLY_REVIEW_ERROR_RATE", d.review_error_rate),
            critical_error_rate: profiled_env_parse(p, "TALLY_CRITICAL_ERROR_RATE", d.critical_error_rate),
            dominant_error_share: profiled_env_parse(p, "TALLY_DOMINANT_ERROR_SHARE", d.dominant_error_share),
            min_throughput: profiled_env_parse(p, "TALLY_MIN_THROUGHPUT", d.min_throughput),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TallyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.processing.max_batch_size, 25);
        assert_eq!(config.processing.concurrency, 5);
        assert_eq!(config.rules.max_increment, 10_000);
        assert_eq!(config.profile_label(), "default");
    }

    #[test]
    fn summary_covers_every_section() {
        let lines = TallyConfig::default().summary_lines();
        let sections: Vec<&str> = lines
            .iter()
            .filter_map(|l| l.trim_start().split(':').next())
            .collect();
        assert_eq!(
            sections,
            ["processing", "rules", "retry", "breaker", "escalation", "aggregation"]
        );
        assert!(lines[5].contains("critical=10%"));
    }

    #[test]
    fn profiled_lookup_prefers_prefixed_key() {
        // Unique key names so parallel tests do not interfere.
        env::set_var("TALLY_TEST_PROFILED_KEY", "base");
        env::set_var("QA_TALLY_TEST_PROFILED_KEY", "qa");
        assert_eq!(profiled_env_or("QA", "TALLY_TEST_PROFILED_KEY", "x"), "qa");
        assert_eq!(profiled_env_or("", "TALLY_TEST_PROFILED_KEY", "x"), "base");
        assert_eq!(profiled_env_or("QA", "TALLY_TEST_MISSING_KEY", "x"), "x");
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = TallyConfig::default();
        config.processing.concurrency = 0;
        assert!(matches!(config.validate(), Err(TallyError::Config(_))));
    }

    #[test]
    fn rejects_bad_retry_settings() {
        let mut config = TallyConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = TallyConfig::default();
        config.retry.max_delay_ms = 10;
        config.retry.initial_delay_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_is_json_object() {
        let summary = TallyConfig::default().summary();
        assert_eq!(summary["processing"]["max_batch_size"], 25);
    }
}
