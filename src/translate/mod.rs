//! Translation backend seam.
//! `Translator` is the single-call capability the dispatcher drives; every
//! failure it returns is classifiable as transient or fatal.

pub mod cache;
pub mod normalize;
pub mod openai;
pub mod sqlite_cache;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One backend call: translate `text` with surrounding `context`.
#[derive(Debug, Clone, Serialize)]
pub struct TranslateRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub context: Vec<String>,
    pub content_type: ContentType,
    pub style: TranslationStyle,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    General,
    Anime,
    Movie,
    Drama,
    Documentary,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::General => "general",
            ContentType::Anime => "anime",
            ContentType::Movie => "movie",
            ContentType::Drama => "drama",
            ContentType::Documentary => "documentary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStyle {
    #[default]
    Standard,
    Literal,
    Localized,
    Specialized,
}

impl TranslationStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            TranslationStyle::Standard => "standard",
            TranslationStyle::Literal => "literal",
            TranslationStyle::Localized => "localized",
            TranslationStyle::Specialized => "specialized",
        }
    }
}

/// Text-in/text-out translation capability (one implementation per backend family).
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, request: &TranslateRequest) -> Result<String, TranslateError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Whether retrying the same call can plausibly succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Fatal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    Timeout,
    RateLimited { retry_after_ms: Option<u64> },
    Server { status: u16, message: String },
    Connection(String),
    EmptyResponse,
    Unauthorized(String),
    InvalidRequest(String),
    ContentFiltered(String),
    Cancelled,
}

impl TranslateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TranslateError::Timeout
            | TranslateError::RateLimited { .. }
            | TranslateError::Server { .. }
            | TranslateError::Connection(_)
            | TranslateError::EmptyResponse => FailureKind::Transient,
            TranslateError::Unauthorized(_)
            | TranslateError::InvalidRequest(_)
            | TranslateError::ContentFiltered(_)
            | TranslateError::Cancelled => FailureKind::Fatal,
        }
    }

    /// Backend-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TranslateError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::Timeout => write!(f, "translation timeout"),
            TranslateError::RateLimited { retry_after_ms } => match retry_after_ms {
                Some(ms) => write!(f, "rate limited, retry after {ms}ms"),
                None => write!(f, "rate limited"),
            },
            TranslateError::Server { status, message } => {
                write!(f, "server error {status}: {message}")
            }
            TranslateError::Connection(msg) => write!(f, "connection error: {msg}"),
            TranslateError::EmptyResponse => write!(f, "backend returned empty translation"),
            TranslateError::Unauthorized(msg) => write!(f, "authentication failed: {msg}"),
            TranslateError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            TranslateError::ContentFiltered(msg) => write!(f, "content filtered: {msg}"),
            TranslateError::Cancelled => write!(f, "translation cancelled"),
        }
    }
}

impl std::error::Error for TranslateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert_eq!(TranslateError::Timeout.kind(), FailureKind::Transient);
        assert_eq!(
            TranslateError::RateLimited { retry_after_ms: None }.kind(),
            FailureKind::Transient
        );
        assert_eq!(
            TranslateError::Server { status: 503, message: String::new() }.kind(),
            FailureKind::Transient
        );
        assert_eq!(TranslateError::EmptyResponse.kind(), FailureKind::Transient);
    }

    #[test]
    fn auth_and_bad_requests_are_fatal() {
        assert_eq!(TranslateError::Unauthorized("key".into()).kind(), FailureKind::Fatal);
        assert_eq!(TranslateError::InvalidRequest("bad".into()).kind(), FailureKind::Fatal);
        assert_eq!(TranslateError::ContentFiltered("x".into()).kind(), FailureKind::Fatal);
    }

    #[test]
    fn retry_after_hint_is_exposed() {
        let err = TranslateError::RateLimited { retry_after_ms: Some(1500) };
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(TranslateError::Timeout.retry_after(), None);
    }
}
