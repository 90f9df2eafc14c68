//! Sliding-window limiter on backend calls and estimated tokens.
//! A call that would exceed either ceiling waits until the oldest record
//! leaves the window; once admitted its timestamp and cost are recorded.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::translate::normalize::is_mostly_cjk;

/// Role and framing tokens for a system + user message pair.
const MESSAGE_OVERHEAD_TOKENS: u64 = 10;

/// Rough token count for one request carrying `text`.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as f64;
    let content = if is_mostly_cjk(text) { chars / 1.5 } else { chars / 4.0 };
    MESSAGE_OVERHEAD_TOKENS + content.floor() as u64
}

struct Window {
    /// (admitted_at, token cost), oldest first.
    calls: VecDeque<(Instant, u64)>,
    tokens: u64,
}

impl Window {
    fn prune(&mut self, now: Instant, span: Duration) {
        while let Some(&(at, cost)) = self.calls.front() {
            if now.duration_since(at) < span {
                break;
            }
            self.calls.pop_front();
            self.tokens -= cost;
        }
    }
}

pub struct RateLimiter {
    window: Mutex<Window>,
    span: Duration,
    max_calls: usize,
    max_tokens: Option<u64>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Mutex::new(Window {
                calls: VecDeque::new(),
                tokens: 0,
            }),
            span: config.window(),
            max_calls: config.max_calls.max(1),
            max_tokens: config.max_tokens,
        }
    }

    /// Admit one call of `cost` tokens, waiting for window space if needed.
    /// Returns false if `token` is cancelled while waiting.
    ///
    /// A single call costing more than the token ceiling is admitted once the
    /// window is empty, otherwise it could never run.
    pub async fn acquire(&self, cost: u64, token: &CancellationToken) -> bool {
        loop {
            let wait = match self.try_admit(cost, Instant::now()) {
                None => return true,
                Some(wait) => wait,
            };
            debug!(wait_ms = wait.as_millis() as u64, cost, "rate_limit_wait");
            tokio::select! {
                biased;
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Admit immediately or report how long until the oldest record expires.
    fn try_admit(&self, cost: u64, now: Instant) -> Option<Duration> {
        let mut w = self.window.lock();
        w.prune(now, self.span);

        let calls_ok = w.calls.len() < self.max_calls;
        let tokens_ok = match self.max_tokens {
            Some(max) => w.calls.is_empty() || w.tokens + cost <= max,
            None => true,
        };
        if calls_ok && tokens_ok {
            w.calls.push_back((now, cost));
            w.tokens += cost;
            return None;
        }

        let oldest = w.calls.front().map(|&(at, _)| at).unwrap_or(now);
        let elapsed = now.duration_since(oldest);
        Some(self.span.saturating_sub(elapsed).max(Duration::from_millis(1)))
    }

    /// (calls, tokens) currently inside the window.
    pub fn usage(&self) -> (usize, u64) {
        let mut w = self.window.lock();
        w.prune(Instant::now(), self.span);
        (w.calls.len(), w.tokens)
    }
}
