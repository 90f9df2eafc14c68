//! Pipeline configuration.
//! Loaded from a JSON file; every field has a default so a partial (or empty)
//! file is valid. Validation runs before any job is dispatched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub concurrency: ConcurrencyConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub format: FormatConfig,
    /// Neighbouring lines on each side used as translation context.
    pub context_window: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            format: FormatConfig::default(),
            context_window: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file for the persistent tier. `None` runs memory-only.
    pub db_path: Option<PathBuf>,
    pub max_memory_entries: usize,
    pub trigger_ratio: f64,
    pub keep_ratio: f64,
    /// Persistent rows untouched for longer than this are purged at open,
    /// at most once a day.
    pub max_age_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: Some(PathBuf::from("data/translation_cache.db")),
            max_memory_entries: 1000,
            trigger_ratio: 1.2,
            keep_ratio: 0.7,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub min_limit: usize,
    pub max_limit: usize,
    pub initial_limit: usize,
    /// EMA smoothing factor in (0, 1].
    pub alpha: f64,
    pub fast_threshold_secs: f64,
    pub slow_threshold_secs: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            min_limit: 2,
            max_limit: 10,
            initial_limit: 3,
            alpha: 0.3,
            fast_threshold_secs: 0.5,
            slow_threshold_secs: 1.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_calls: usize,
    /// Optional ceiling on estimated tokens per window.
    pub max_tokens: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_calls: 3500,
            max_tokens: Some(180_000),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per segment, first call included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunctuationStyle {
    /// Full-width CJK punctuation and 「」 quotes.
    FullWidth,
    /// Leave punctuation untouched; only line constraints apply.
    Preserve,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub max_chars_per_line: usize,
    pub max_lines: usize,
    pub punctuation: PunctuationStyle,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            max_chars_per_line: 16,
            max_lines: 2,
            punctuation: PunctuationStyle::FullWidth,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl PipelineConfig {
    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.concurrency;
        if c.min_limit == 0 {
            return Err(ConfigError::Invalid("concurrency.min_limit must be >= 1".into()));
        }
        if c.min_limit > c.max_limit {
            return Err(ConfigError::Invalid(format!(
                "concurrency.min_limit ({}) exceeds max_limit ({})",
                c.min_limit, c.max_limit
            )));
        }
        if !(c.alpha > 0.0 && c.alpha <= 1.0) {
            return Err(ConfigError::Invalid("concurrency.alpha must be in (0, 1]".into()));
        }
        if c.fast_threshold_secs >= c.slow_threshold_secs {
            return Err(ConfigError::Invalid(
                "concurrency.fast_threshold_secs must be below slow_threshold_secs".into(),
            ));
        }

        let cache = &self.cache;
        if cache.max_memory_entries == 0 {
            return Err(ConfigError::Invalid("cache.max_memory_entries must be >= 1".into()));
        }
        if !(cache.keep_ratio > 0.0 && cache.keep_ratio < cache.trigger_ratio) {
            return Err(ConfigError::Invalid(
                "cache.keep_ratio must be positive and below trigger_ratio".into(),
            ));
        }

        if self.rate_limit.max_calls == 0 || self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_calls and window_secs must be >= 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        if self.format.max_chars_per_line == 0 || self.format.max_lines == 0 {
            return Err(ConfigError::Invalid(
                "format.max_chars_per_line and max_lines must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
