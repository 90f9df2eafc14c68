//! Batch dispatcher: cache pass, then a worker pool sized by the adaptive
//! concurrency limit drives misses through rate limiting, the pause gate and
//! the retry state machine. Results are collected by index and only returned
//! once the whole job has resolved.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as cb;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancellation::{JobControl, PauseGate};
use crate::config::{FormatConfig, PipelineConfig, RetryConfig};
use crate::controller::ConcurrencyController;
use crate::formatter::LineFormatter;
use crate::job::{
    DispatchError, Job, JobReport, JobStats, JobWarning, ProgressEvent, ProgressStatus,
    ResultSource, Segment, SegmentError, SegmentResult, Translated, TranslationParams,
};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::rate_limit::{estimate_tokens, RateLimiter};
use crate::state_machine::{RetryDecision, RetryTracker};
use crate::translate::cache::{CacheEntry, Fingerprint, FingerprintCache};
use crate::translate::{TranslateRequest, Translator};

/// Delay before retry number `attempt` (1-based): `base × 2^(attempt-1)`,
/// capped at `max_delay`. A larger backend hint wins.
pub fn backoff_delay(retry: &RetryConfig, attempt: u32, hint: Option<Duration>) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let base = retry.base_delay_ms.saturating_mul(1u64 << exp);
    let delay = Duration::from_millis(base.min(retry.max_delay_ms));
    match hint {
        Some(hint) if hint > delay => hint,
        _ => delay,
    }
}

/// Wait out a pause, recording the time spent. False once `token` is cancelled.
async fn hold_while_paused(
    gate: &mut PauseGate,
    token: &CancellationToken,
    metrics: &MetricsRegistry,
) -> bool {
    if !gate.is_paused() {
        return !token.is_cancelled();
    }
    let waited = Instant::now();
    let ready = gate.wait_ready(token).await;
    if ready {
        metrics.record_duration(metric_names::PAUSE_WAIT, waited.elapsed());
    }
    ready
}

fn cancelled(tracker: &mut RetryTracker) -> Result<String, SegmentError> {
    tracker.cancel()?;
    Err(SegmentError::Cancelled)
}

/// A cache miss waiting for a worker.
struct PendingSegment {
    index: usize,
    fingerprint: Fingerprint,
    request: TranslateRequest,
    cost: u64,
}

struct SegmentOutcome {
    index: usize,
    fingerprint: Fingerprint,
    result: Result<String, SegmentError>,
    calls: u32,
}

/// Mutable bookkeeping for one run; lives on the coordinating task only.
struct RunState {
    job_id: Uuid,
    outcomes: Vec<Option<Result<Translated, SegmentError>>>,
    stats: JobStats,
    completed: usize,
}

/// Drives one `Translator` with an owned cache, controller and limiter.
pub struct BatchDispatcher<T: Translator> {
    translator: Arc<T>,
    cache: Arc<FingerprintCache>,
    controller: Arc<ConcurrencyController>,
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    format: FormatConfig,
    formatter: LineFormatter,
    control: Arc<JobControl>,
    metrics: Arc<MetricsRegistry>,
    progress: Option<cb::Sender<ProgressEvent>>,
}

impl<T: Translator> BatchDispatcher<T> {
    /// Fails with `DispatchError::InvalidConfig` if `config` does not validate.
    pub fn new(
        translator: Arc<T>,
        cache: Arc<FingerprintCache>,
        config: &PipelineConfig,
    ) -> Result<Self, DispatchError> {
        config
            .validate()
            .map_err(|e| DispatchError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            translator,
            cache,
            controller: Arc::new(ConcurrencyController::new(&config.concurrency)),
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            retry: config.retry.clone(),
            format: config.format.clone(),
            formatter: LineFormatter::new(config.format.punctuation),
            control: Arc::new(JobControl::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            progress: None,
        })
    }

    /// Send a `ProgressEvent` for every resolved segment.
    pub fn with_progress(mut self, tx: cb::Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    /// Cancel the running job; unresolved segments come back as cancelled.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn control(&self) -> &Arc<JobControl> {
        &self.control
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    /// Totals across every job this dispatcher has run.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Translate every segment of `job`. Per-segment failures are reported in
    /// the result list; only invalid parameters abort before dispatch.
    pub async fn run(&self, job: Job, params: &TranslationParams) -> Result<JobReport, DispatchError> {
        params.validate()?;

        let (token, generation) = self.control.child_token();
        let started = Instant::now();
        let total = job.len();
        let model_identifier = params.model_identifier();
        let metrics = self.metrics.scoped();
        let mut state = RunState {
            job_id: Uuid::new_v4(),
            outcomes: (0..total).map(|_| None).collect(),
            stats: JobStats {
                total,
                ..JobStats::default()
            },
            completed: 0,
        };
        info!(
            job_id = %state.job_id,
            generation,
            total,
            model = %model_identifier,
            translator = self.translator.name(),
            "job_started"
        );

        // Cache pass. Repeated misses within the job wait on their first
        // occurrence instead of calling the backend again.
        let mut pending = VecDeque::new();
        let mut leaders: HashMap<Fingerprint, usize> = HashMap::new();
        let mut followers: HashMap<usize, Vec<usize>> = HashMap::new();
        for segment in job.into_segments() {
            let index = segment.index;
            if segment.source_text.trim().is_empty() {
                let done = self.finish(String::new(), ResultSource::Blank, 0, &metrics);
                self.resolve(&mut state, index, Ok(done));
                continue;
            }
            let fingerprint =
                Fingerprint::compute(&segment.source_text, &segment.context, &model_identifier);
            if let Some(&leader) = leaders.get(&fingerprint) {
                followers.entry(leader).or_default().push(index);
                continue;
            }

            let span = metrics.span(metric_names::CACHE_LOOKUP);
            let hit = self.cache.lookup(&fingerprint);
            span.finish();
            match hit {
                Some(text) => {
                    let done = self.finish(text, ResultSource::Cache, 0, &metrics);
                    self.resolve(&mut state, index, Ok(done));
                }
                None => {
                    leaders.insert(fingerprint, index);
                    pending.push_back(self.pending_segment(&segment, fingerprint, params));
                }
            }
        }
        debug!(job_id = %state.job_id, misses = pending.len(), "cache pass done");

        let mut in_flight = FuturesUnordered::new();
        loop {
            while !token.is_cancelled() && in_flight.len() < self.controller.permit_limit() {
                let Some(next) = pending.pop_front() else {
                    break;
                };
                in_flight.push(self.process_segment(
                    next,
                    &model_identifier,
                    token.clone(),
                    self.control.pause_gate(),
                    Arc::clone(&metrics),
                ));
            }
            let Some(outcome) = in_flight.next().await else {
                break;
            };
            self.collect(&mut state, outcome, &mut followers, &metrics);
        }

        // Whatever never reached a worker was cancelled.
        for segment in pending {
            let mut indices = vec![segment.index];
            indices.extend(followers.remove(&segment.index).unwrap_or_default());
            for index in indices {
                self.resolve(&mut state, index, Err(SegmentError::Cancelled));
            }
        }

        let mut warnings = Vec::new();
        if self.cache.is_degraded() {
            warn!(job_id = %state.job_id, "job finished with persistent cache degraded");
            warnings.push(JobWarning::CacheDegraded);
        }

        let elapsed = started.elapsed();
        metrics.record_duration(metric_names::JOB_TOTAL, elapsed);
        state.stats.elapsed = elapsed;
        let stats = state.stats;
        info!(
            job_id = %state.job_id,
            translated = stats.translated,
            from_cache = stats.from_cache,
            failed = stats.failed,
            cancelled = stats.cancelled,
            backend_calls = stats.backend_calls,
            retries = stats.retries,
            elapsed_ms = elapsed.as_millis() as u64,
            "job_finished"
        );

        let results = state
            .outcomes
            .into_iter()
            .enumerate()
            .map(|(index, outcome)| SegmentResult {
                index,
                outcome: outcome.unwrap_or(Err(SegmentError::Cancelled)),
            })
            .collect();

        Ok(JobReport {
            job_id: state.job_id,
            results,
            stats,
            warnings,
            metrics: metrics.summary(),
        })
    }

    fn pending_segment(
        &self,
        segment: &Segment,
        fingerprint: Fingerprint,
        params: &TranslationParams,
    ) -> PendingSegment {
        let request = params.request_for(segment);
        let prompt_chars: String = request.context.concat() + &request.text;
        PendingSegment {
            index: segment.index,
            fingerprint,
            cost: estimate_tokens(&prompt_chars),
            request,
        }
    }

    /// One segment from first attempt to a terminal state.
    async fn process_segment(
        &self,
        pending: PendingSegment,
        model_identifier: &str,
        token: CancellationToken,
        mut gate: PauseGate,
        metrics: Arc<MetricsRegistry>,
    ) -> SegmentOutcome {
        let PendingSegment {
            index,
            fingerprint,
            request,
            cost,
        } = pending;
        let mut tracker = RetryTracker::new(index, self.retry.max_attempts);
        let result = self
            .drive(&mut tracker, &request, cost, model_identifier, &token, &mut gate, &metrics)
            .await;
        if let Err(SegmentError::InvalidState(e)) = &result {
            warn!(index, error = %e, "segment abandoned");
        }
        SegmentOutcome {
            index,
            fingerprint,
            result,
            calls: tracker.attempts(),
        }
    }

    /// Attempt loop; every state change goes through `tracker`.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        tracker: &mut RetryTracker,
        request: &TranslateRequest,
        cost: u64,
        model_identifier: &str,
        token: &CancellationToken,
        gate: &mut PauseGate,
        metrics: &MetricsRegistry,
    ) -> Result<String, SegmentError> {
        let index = tracker.index();
        loop {
            if !hold_while_paused(gate, token, metrics).await {
                return cancelled(tracker);
            }

            let waited = Instant::now();
            if !self.limiter.acquire(cost, token).await {
                return cancelled(tracker);
            }
            metrics.record_duration(metric_names::RATE_LIMIT_WAIT, waited.elapsed());

            // A pause or cancel may have landed while waiting for the window.
            if !hold_while_paused(gate, token, metrics).await {
                return cancelled(tracker);
            }

            let attempt = tracker.start_attempt()?;
            let call_started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                r = self.translator.translate(request) => Some(r),
            };
            let Some(result) = result else {
                return cancelled(tracker);
            };

            let latency = call_started.elapsed();
            self.controller.record_latency(latency.as_secs_f64());
            metrics.record_duration(metric_names::BACKEND_CALL, latency);

            let e = match result {
                Ok(text) => {
                    // A call that finished after cancellation is discarded.
                    if token.is_cancelled() {
                        return cancelled(tracker);
                    }
                    self.store(CacheEntry::new(
                        &request.text,
                        &request.context,
                        model_identifier,
                        &text,
                    ))
                    .await;
                    tracker.succeed()?;
                    return Ok(text);
                }
                Err(e) => e,
            };

            match tracker.fail(e.kind())? {
                RetryDecision::Retry { failed } => {
                    let delay = backoff_delay(&self.retry, failed, e.retry_after());
                    warn!(
                        index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    metrics.record_duration(metric_names::RETRY_BACKOFF, delay);
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return cancelled(tracker),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp(kind) => {
                    warn!(
                        index,
                        attempts = attempt,
                        kind = %kind,
                        state = %tracker.state(),
                        error = %e,
                        "segment failed"
                    );
                    return Err(SegmentError::Failed {
                        kind,
                        attempts: tracker.attempts(),
                        cause: e,
                    });
                }
            }
        }
    }

    /// Write-through off the async worker; the persistent tier is blocking I/O.
    async fn store(&self, entry: CacheEntry) {
        let cache = Arc::clone(&self.cache);
        if let Err(e) = tokio::task::spawn_blocking(move || cache.store(entry)).await {
            warn!(error = %e, "cache write task failed");
        }
    }

    /// Fold a worker outcome into the run, resolving any waiting duplicates.
    fn collect(
        &self,
        state: &mut RunState,
        outcome: SegmentOutcome,
        followers: &mut HashMap<usize, Vec<usize>>,
        metrics: &Arc<MetricsRegistry>,
    ) {
        state.stats.backend_calls += outcome.calls;
        state.stats.retries += outcome.calls.saturating_sub(1);
        let waiting = followers.remove(&outcome.index).unwrap_or_default();

        match outcome.result {
            Ok(raw) => {
                for &index in &waiting {
                    // Normally a cache hit; fall back to the leader's text if the
                    // entry has already been evicted from a memory-only cache.
                    let text = self
                        .cache
                        .lookup(&outcome.fingerprint)
                        .unwrap_or_else(|| raw.clone());
                    let done = self.finish(text, ResultSource::Cache, 0, metrics);
                    self.resolve(state, index, Ok(done));
                }
                let done = self.finish(raw, ResultSource::Backend, outcome.calls, metrics);
                self.resolve(state, outcome.index, Ok(done));
            }
            Err(e) => {
                for &index in &waiting {
                    self.resolve(state, index, Err(e.clone()));
                }
                self.resolve(state, outcome.index, Err(e));
            }
        }
    }

    fn finish(
        &self,
        raw: String,
        source: ResultSource,
        attempts: u32,
        metrics: &Arc<MetricsRegistry>,
    ) -> Translated {
        let span = metrics.span(metric_names::FORMAT);
        let formatted =
            self.formatter
                .format(&raw, self.format.max_chars_per_line, self.format.max_lines);
        span.finish();
        if !formatted.warnings.is_empty() {
            debug!(warnings = formatted.warnings.len(), "format warnings");
        }
        Translated {
            text: formatted.text(),
            lines: formatted.lines,
            raw,
            source,
            attempts,
            format_warnings: formatted.warnings,
        }
    }

    fn resolve(
        &self,
        state: &mut RunState,
        index: usize,
        outcome: Result<Translated, SegmentError>,
    ) {
        let status = match &outcome {
            Ok(t) => match t.source {
                ResultSource::Cache => {
                    state.stats.from_cache += 1;
                    ProgressStatus::Cached
                }
                ResultSource::Blank => {
                    state.stats.blank += 1;
                    ProgressStatus::Cached
                }
                ResultSource::Backend => {
                    state.stats.translated += 1;
                    ProgressStatus::Translated
                }
            },
            Err(SegmentError::Cancelled) => {
                state.stats.cancelled += 1;
                ProgressStatus::Cancelled
            }
            Err(SegmentError::Failed { .. } | SegmentError::InvalidState(_)) => {
                state.stats.failed += 1;
                ProgressStatus::Failed
            }
        };
        state.outcomes[index] = Some(outcome);
        state.completed += 1;

        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent {
                job_id: state.job_id,
                index,
                status,
                completed: state.completed,
                total: state.stats.total,
            });
        }
    }
}
