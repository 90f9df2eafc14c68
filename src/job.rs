//! Job model: ordered segments in, ordered per-segment results out.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::formatter::FormatWarning;
use crate::metrics::MetricSummary;
use crate::state_machine::TransitionError;
use crate::translate::{ContentType, FailureKind, TranslateError, TranslateRequest, TranslationStyle};

/// One translatable line with its fixed position in the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub source_text: String,
    pub context: Vec<String>,
}

/// Ordered batch of segments; indices are positions, assigned on construction.
#[derive(Debug, Clone, Default)]
pub struct Job {
    segments: Vec<Segment>,
}

impl Job {
    /// Build from explicit (text, context) pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        let segments = pairs
            .into_iter()
            .enumerate()
            .map(|(index, (text, context))| Segment {
                index,
                source_text: text.into(),
                context,
            })
            .collect();
        Self { segments }
    }

    /// Build from consecutive lines; each segment's context is up to
    /// `context_window` neighbours on each side, in order, excluding itself.
    pub fn from_lines<S: AsRef<str>>(lines: &[S], context_window: usize) -> Self {
        let segments = (0..lines.len())
            .map(|index| {
                let start = index.saturating_sub(context_window);
                let end = (index + context_window + 1).min(lines.len());
                let context = (start..end)
                    .filter(|&i| i != index)
                    .map(|i| lines[i].as_ref().to_string())
                    .collect();
                Segment {
                    index,
                    source_text: lines[index].as_ref().to_string(),
                    context,
                }
            })
            .collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Language pair, model and prompt flavour shared by every segment of a job.
#[derive(Debug, Clone)]
pub struct TranslationParams {
    pub source_lang: String,
    pub target_lang: String,
    pub model: String,
    pub content_type: ContentType,
    pub style: TranslationStyle,
}

impl TranslationParams {
    pub fn new(
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            model: model.into(),
            content_type: ContentType::default(),
            style: TranslationStyle::default(),
        }
    }

    /// Cache scope: the model, qualified by target language.
    pub fn model_identifier(&self) -> String {
        format!("{}/{}", self.model.trim(), self.target_lang.trim())
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.model.trim().is_empty() {
            return Err(DispatchError::InvalidParams("model must not be empty".into()));
        }
        if self.target_lang.trim().is_empty() {
            return Err(DispatchError::InvalidParams(
                "target language must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn request_for(&self, segment: &Segment) -> TranslateRequest {
        TranslateRequest {
            text: segment.source_text.clone(),
            source_lang: self.source_lang.clone(),
            target_lang: self.target_lang.clone(),
            context: segment.context.clone(),
            content_type: self.content_type,
            style: self.style,
            model: self.model.clone(),
        }
    }
}

/// Where a successful result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Backend,
    /// Whitespace-only input; nothing to translate.
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translated {
    /// Formatted text, lines joined with `\n`.
    pub text: String,
    pub lines: Vec<String>,
    /// Backend output before formatting.
    pub raw: String,
    pub source: ResultSource,
    /// Backend calls made for this segment (0 for cache hits).
    pub attempts: u32,
    pub format_warnings: Vec<FormatWarning>,
}

/// Terminal per-segment failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    Failed {
        kind: FailureKind,
        attempts: u32,
        cause: TranslateError,
    },
    Cancelled,
    /// The retry state machine rejected a transition; the segment is abandoned.
    InvalidState(TransitionError),
}

impl From<TransitionError> for SegmentError {
    fn from(err: TransitionError) -> Self {
        SegmentError::InvalidState(err)
    }
}

impl SegmentError {
    /// Transient failures are worth resubmitting; fatal and cancelled are not
    /// retried automatically but a cancelled segment can be run again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SegmentError::Failed {
                kind: FailureKind::Transient,
                ..
            } | SegmentError::Cancelled
        )
    }
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentError::Failed {
                kind,
                attempts,
                cause,
            } => write!(f, "{kind} failure after {attempts} attempt(s): {cause}"),
            SegmentError::Cancelled => write!(f, "cancelled"),
            SegmentError::InvalidState(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SegmentError {}

#[derive(Debug, Clone)]
pub struct SegmentResult {
    pub index: usize,
    pub outcome: Result<Translated, SegmentError>,
}

impl SegmentResult {
    pub fn text(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|t| t.text.as_str())
    }
}

/// Job-level rejection before any dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    InvalidParams(String),
    /// Pipeline configuration failed validation when building a dispatcher.
    InvalidConfig(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::InvalidParams(msg) => write!(f, "invalid translation parameters: {msg}"),
            DispatchError::InvalidConfig(msg) => write!(f, "invalid pipeline configuration: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobWarning {
    /// The persistent cache tier failed; results were cached in memory only.
    CacheDegraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub translated: usize,
    pub from_cache: usize,
    pub blank: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Backend calls beyond the first per segment.
    pub retries: u32,
    pub backend_calls: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    /// One entry per segment, in index order.
    pub results: Vec<SegmentResult>,
    pub stats: JobStats,
    pub warnings: Vec<JobWarning>,
    pub metrics: HashMap<String, MetricSummary>,
}

impl JobReport {
    /// Indices of segments that did not produce a translation.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_err())
            .map(|r| r.index)
            .collect()
    }

    /// Formatted texts in order; `None` where the segment failed.
    pub fn texts(&self) -> Vec<Option<&str>> {
        self.results.iter().map(SegmentResult::text).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Cached,
    Translated,
    Failed,
    Cancelled,
}

/// Completion notice for one segment; `completed` counts resolved segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub index: usize,
    pub status: ProgressStatus,
    pub completed: usize,
    pub total: usize,
}
