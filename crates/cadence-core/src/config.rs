//! Engine configuration.
//!
//! An explicit record with defaults applied once at construction. Every
//! field can be overridden from the environment; construction fails on
//! unparseable values, validation fails on nonsensical ones.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use cadence_api::SystemEnvironment;

/// Model selection and sampling parameters.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub model: String,
    pub temperature: f32,
    pub max_retries: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.2,
            max_retries: 2,
        }
    }
}

/// Endpoint execution limits.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Global cap on endpoint concurrency, regardless of what a plan asks for.
    pub max_concurrency: usize,
    /// Per-plan concurrency when the planner does not suggest one.
    pub default_concurrency_limit: usize,
    pub default_timeout_ms: u64,
    pub max_endpoint_retries: u32,
    /// Attempt number at which retry delays double (and escalation warns).
    pub warn_threshold_attempt: Option<u32>,
    /// Attempt number at which transient failures escalate instead of retrying.
    pub critical_threshold_attempt: Option<u32>,
    pub allow_cancellation: bool,
    pub response_content_length_limit: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_concurrency_limit: 2,
            default_timeout_ms: 30_000,
            max_endpoint_retries: 3,
            warn_threshold_attempt: None,
            critical_threshold_attempt: None,
            allow_cancellation: true,
            response_content_length_limit: 10_000,
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Cycle pacing and leasing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    pub processing_interval_ms: u64,
    pub stale_lock_threshold_ms: u64,
    pub job_processing_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            processing_interval_ms: 60_000,
            stale_lock_threshold_ms: 300_000,
            job_processing_concurrency: 1,
        }
    }
}

/// Prompt-context trimming.
#[derive(Debug, Clone)]
pub struct PromptConfig {
    pub enabled: bool,
    pub max_messages: usize,
    pub min_recent_messages: usize,
    pub max_endpoint_usage_entries: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: 10,
            min_recent_messages: 3,
            max_endpoint_usage_entries: 5,
        }
    }
}

/// Failure-ratio thresholds driving escalation.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub warn_failure_ratio: f64,
    pub critical_failure_ratio: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            warn_failure_ratio: 0.25,
            critical_failure_ratio: 0.5,
        }
    }
}

/// Semantic validation and the one-shot rescue prompt.
#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub validate_semantics: bool,
    /// When set, semantic violations raise instead of being salvaged.
    pub semantic_strict: bool,
    pub repair_malformed_responses: bool,
    pub max_repair_attempts: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            validate_semantics: true,
            semantic_strict: false,
            repair_malformed_responses: true,
            max_repair_attempts: 1,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub environment: SystemEnvironment,
    pub ai: AiConfig,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub prompt: PromptConfig,
    pub recovery: RecoveryConfig,
    pub repair: RepairConfig,
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults, and
    /// validate it.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(model) = read_env("AI_MODEL")? {
            config.ai.model = model;
        }
        if let Some(t) = read_env("AI_TEMPERATURE")? {
            config.ai.temperature = t;
        }
        if let Some(r) = read_env("AI_MAX_RETRIES")? {
            config.ai.max_retries = r;
        }

        if let Some(v) = read_env("MAX_CONCURRENCY")? {
            config.execution.max_concurrency = v;
        }
        if let Some(v) = read_env("DEFAULT_CONCURRENCY_LIMIT")? {
            config.execution.default_concurrency_limit = v;
        }
        if let Some(v) = read_env("DEFAULT_TIMEOUT_MS")? {
            config.execution.default_timeout_ms = v;
        }
        if let Some(v) = read_env("MAX_ENDPOINT_RETRIES")? {
            config.execution.max_endpoint_retries = v;
        }
        config.execution.warn_threshold_attempt = read_env("WARN_THRESHOLD_ATTEMPT")?;
        config.execution.critical_threshold_attempt = read_env("CRITICAL_THRESHOLD_ATTEMPT")?;
        if let Some(v) = read_env_bool("ALLOW_CANCELLATION")? {
            config.execution.allow_cancellation = v;
        }
        if let Some(v) = read_env("RESPONSE_CONTENT_LENGTH_LIMIT")? {
            config.execution.response_content_length_limit = v;
        }

        if let Some(v) = read_env("MAX_BATCH_SIZE")? {
            config.scheduler.max_batch_size = v;
        }
        if let Some(v) = read_env("PROCESSING_INTERVAL_MS")? {
            config.scheduler.processing_interval_ms = v;
        }
        if let Some(v) = read_env("STALE_LOCK_THRESHOLD_MS")? {
            config.scheduler.stale_lock_threshold_ms = v;
        }
        if let Some(v) = read_env("JOB_PROCESSING_CONCURRENCY")? {
            config.scheduler.job_processing_concurrency = v;
        }

        if let Some(v) = read_env_bool("PROMPT_OPT_ENABLED")? {
            config.prompt.enabled = v;
        }
        if let Some(v) = read_env("PROMPT_OPT_MAX_MESSAGES")? {
            config.prompt.max_messages = v;
        }
        if let Some(v) = read_env("PROMPT_OPT_MIN_RECENT")? {
            config.prompt.min_recent_messages = v;
        }
        if let Some(v) = read_env("PROMPT_OPT_MAX_USAGE")? {
            config.prompt.max_endpoint_usage_entries = v;
        }

        if let Some(v) = read_env("WARN_FAILURE_RATIO")? {
            config.recovery.warn_failure_ratio = v;
        }
        if let Some(v) = read_env("CRITICAL_FAILURE_RATIO")? {
            config.recovery.critical_failure_ratio = v;
        }

        if let Some(v) = read_env_bool("VALIDATE_SEMANTICS")? {
            config.repair.validate_semantics = v;
        }
        if let Some(v) = read_env_bool("SEMANTIC_STRICT")? {
            config.repair.semantic_strict = v;
        }
        if let Some(v) = read_env_bool("REPAIR_MALFORMED_RESPONSES")? {
            config.repair.repair_malformed_responses = v;
        }
        if let Some(v) = read_env("MAX_REPAIR_ATTEMPTS")? {
            config.repair.max_repair_attempts = v;
        }

        if let Ok(raw) = std::env::var("ENVIRONMENT") {
            config.environment = raw
                .parse()
                .with_context(|| format!("invalid ENVIRONMENT value {raw:?}"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ai.temperature) {
            bail!(
                "AI_TEMPERATURE must be within [0, 1], got {}",
                self.ai.temperature
            );
        }
        if self.execution.max_concurrency == 0 {
            bail!("MAX_CONCURRENCY must be at least 1");
        }
        if self.execution.default_concurrency_limit == 0 {
            bail!("DEFAULT_CONCURRENCY_LIMIT must be at least 1");
        }
        if self.execution.default_timeout_ms == 0 {
            bail!("DEFAULT_TIMEOUT_MS must be positive");
        }
        if self.scheduler.max_batch_size == 0 {
            bail!("MAX_BATCH_SIZE must be at least 1");
        }
        if self.scheduler.processing_interval_ms == 0 {
            bail!("PROCESSING_INTERVAL_MS must be positive");
        }
        if self.scheduler.stale_lock_threshold_ms == 0 {
            bail!("STALE_LOCK_THRESHOLD_MS must be positive");
        }
        if self.scheduler.job_processing_concurrency == 0 {
            bail!("JOB_PROCESSING_CONCURRENCY must be at least 1");
        }
        let warn = self.recovery.warn_failure_ratio;
        let critical = self.recovery.critical_failure_ratio;
        if !(0.0 < warn && warn <= 1.0) || !(0.0 < critical && critical <= 1.0) {
            bail!("failure ratios must be within (0, 1], got warn={warn} critical={critical}");
        }
        if warn >= critical {
            bail!("WARN_FAILURE_RATIO ({warn}) must be below CRITICAL_FAILURE_RATIO ({critical})");
        }
        Ok(())
    }
}

/// Read and parse an env var, erroring on malformed values.
fn read_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {key} value {raw:?}: {e}"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

/// Booleans accept true/false/1/0 (case-insensitive).
fn read_env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            other => bail!("invalid {key} value {other:?}: expected true/false"),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    // Env-var tests mutate process state; serialize them.
    fn lock_env() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    const ALL_KEYS: &[&str] = &[
        "AI_MODEL",
        "AI_TEMPERATURE",
        "AI_MAX_RETRIES",
        "MAX_CONCURRENCY",
        "DEFAULT_CONCURRENCY_LIMIT",
        "DEFAULT_TIMEOUT_MS",
        "MAX_ENDPOINT_RETRIES",
        "WARN_THRESHOLD_ATTEMPT",
        "CRITICAL_THRESHOLD_ATTEMPT",
        "ALLOW_CANCELLATION",
        "RESPONSE_CONTENT_LENGTH_LIMIT",
        "MAX_BATCH_SIZE",
        "PROCESSING_INTERVAL_MS",
        "STALE_LOCK_THRESHOLD_MS",
        "JOB_PROCESSING_CONCURRENCY",
        "PROMPT_OPT_ENABLED",
        "PROMPT_OPT_MAX_MESSAGES",
        "PROMPT_OPT_MIN_RECENT",
        "PROMPT_OPT_MAX_USAGE",
        "WARN_FAILURE_RATIO",
        "CRITICAL_FAILURE_RATIO",
        "VALIDATE_SEMANTICS",
        "SEMANTIC_STRICT",
        "REPAIR_MALFORMED_RESPONSES",
        "MAX_REPAIR_ATTEMPTS",
        "ENVIRONMENT",
    ];

    fn clear_env() {
        for key in ALL_KEYS {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let _lock = lock_env();
        clear_env();

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.ai.model, "gpt-4o");
        assert_eq!(config.ai.temperature, 0.2);
        assert_eq!(config.ai.max_retries, 2);
        assert_eq!(config.execution.max_concurrency, 5);
        assert_eq!(config.execution.default_timeout_ms, 30_000);
        assert_eq!(config.execution.max_endpoint_retries, 3);
        assert_eq!(config.execution.response_content_length_limit, 10_000);
        assert_eq!(config.scheduler.max_batch_size, 20);
        assert_eq!(config.scheduler.processing_interval_ms, 60_000);
        assert_eq!(config.scheduler.stale_lock_threshold_ms, 300_000);
        assert_eq!(config.scheduler.job_processing_concurrency, 1);
        assert!(config.prompt.enabled);
        assert_eq!(config.prompt.max_messages, 10);
        assert_eq!(config.prompt.min_recent_messages, 3);
        assert_eq!(config.prompt.max_endpoint_usage_entries, 5);
        assert_eq!(config.recovery.warn_failure_ratio, 0.25);
        assert_eq!(config.recovery.critical_failure_ratio, 0.5);
        assert!(config.repair.validate_semantics);
        assert!(!config.repair.semantic_strict);
        assert!(config.repair.repair_malformed_responses);
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = lock_env();
        clear_env();

        unsafe {
            std::env::set_var("AI_MODEL", "gpt-4o-mini");
            std::env::set_var("MAX_BATCH_SIZE", "7");
            std::env::set_var("PROMPT_OPT_ENABLED", "false");
            std::env::set_var("ENVIRONMENT", "test");
        }

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.ai.model, "gpt-4o-mini");
        assert_eq!(config.scheduler.max_batch_size, 7);
        assert!(!config.prompt.enabled);
        assert_eq!(config.environment, SystemEnvironment::Test);

        clear_env();
    }

    #[test]
    fn unparseable_value_is_an_error() {
        let _lock = lock_env();
        clear_env();

        unsafe { std::env::set_var("MAX_BATCH_SIZE", "twenty") };
        let err = EngineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("MAX_BATCH_SIZE"));

        clear_env();
    }

    #[test]
    fn validation_rejects_zero_batch_size() {
        let mut config = EngineConfig::default();
        config.scheduler.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_temperature() {
        let mut config = EngineConfig::default();
        config.ai.temperature = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_inverted_failure_ratios() {
        let mut config = EngineConfig::default();
        config.recovery.warn_failure_ratio = 0.6;
        config.recovery.critical_failure_ratio = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bool_parsing_accepts_numeric_forms() {
        let _lock = lock_env();
        clear_env();

        unsafe { std::env::set_var("SEMANTIC_STRICT", "1") };
        let config = EngineConfig::from_env().unwrap();
        assert!(config.repair.semantic_strict);

        unsafe { std::env::set_var("SEMANTIC_STRICT", "maybe") };
        assert!(EngineConfig::from_env().is_err());

        clear_env();
    }
}
