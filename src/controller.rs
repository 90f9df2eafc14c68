//! Adaptive concurrency bound driven by an EMA of backend latency.
//! Below the fast threshold the limit grows by one, above the slow threshold
//! it shrinks by one; inside the band it holds.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ConcurrencyConfig;

/// Snapshot of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConcurrencyState {
    pub current_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    /// Seconds; `None` until the first sample.
    pub smoothed_latency: Option<f64>,
    pub fast_threshold: f64,
    pub slow_threshold: f64,
}

pub struct ConcurrencyController {
    state: Mutex<ConcurrencyState>,
    alpha: f64,
}

impl ConcurrencyController {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        let min_limit = config.min_limit.max(1);
        let max_limit = config.max_limit.max(min_limit);
        Self {
            state: Mutex::new(ConcurrencyState {
                current_limit: config.initial_limit.clamp(min_limit, max_limit),
                min_limit,
                max_limit,
                smoothed_latency: None,
                fast_threshold: config.fast_threshold_secs,
                slow_threshold: config.slow_threshold_secs,
            }),
            alpha: config.alpha.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    /// Parallel backend calls currently allowed.
    pub fn permit_limit(&self) -> usize {
        self.state.lock().current_limit
    }

    /// Fold one completed call's latency into the EMA and adjust the limit.
    /// Returns the limit after adjustment.
    pub fn record_latency(&self, seconds: f64) -> usize {
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        let mut s = self.state.lock();
        let ema = match s.smoothed_latency {
            Some(prev) => self.alpha * seconds + (1.0 - self.alpha) * prev,
            None => seconds,
        };
        s.smoothed_latency = Some(ema);

        let before = s.current_limit;
        if ema < s.fast_threshold {
            s.current_limit = (s.current_limit + 1).min(s.max_limit);
        } else if ema > s.slow_threshold {
            s.current_limit = s.current_limit.saturating_sub(1).max(s.min_limit);
        }

        if s.current_limit != before {
            info!(
                from = before,
                to = s.current_limit,
                ema_secs = ema,
                "concurrency_limit_changed"
            );
        } else {
            debug!(limit = before, ema_secs = ema, latency_secs = seconds, "latency_recorded");
        }
        s.current_limit
    }

    pub fn state(&self) -> ConcurrencyState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(alpha: f64) -> ConcurrencyConfig {
        ConcurrencyConfig {
            min_limit: 2,
            max_limit: 10,
            initial_limit: 3,
            alpha,
            fast_threshold_secs: 0.5,
            slow_threshold_secs: 1.5,
        }
    }

    #[test]
    fn slow_call_then_fast_call_moves_limit_each_way() {
        // alpha = 1 makes the EMA track the last sample exactly.
        let c = ConcurrencyController::new(&config(1.0));
        assert_eq!(c.permit_limit(), 3);
        assert_eq!(c.record_latency(2.0), 2);
        assert_eq!(c.record_latency(0.2), 3);
    }

    #[test]
    fn first_sample_seeds_the_ema() {
        let c = ConcurrencyController::new(&config(0.3));
        c.record_latency(2.0);
        assert_eq!(c.state().smoothed_latency, Some(2.0));
        assert_eq!(c.permit_limit(), 2);
        c.record_latency(1.0);
        let ema = c.state().smoothed_latency.unwrap();
        assert!((ema - 1.7).abs() < 1e-9);
    }

    #[test]
    fn fast_stream_raises_monotonically_to_max() {
        let c = ConcurrencyController::new(&config(0.3));
        let mut last = c.permit_limit();
        for _ in 0..20 {
            let now = c.record_latency(0.1);
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn slow_stream_lowers_to_min() {
        let c = ConcurrencyController::new(&config(0.3));
        for _ in 0..20 {
            c.record_latency(3.0);
        }
        assert_eq!(c.permit_limit(), 2);
    }

    #[test]
    fn band_holds_limit() {
        let c = ConcurrencyController::new(&config(0.3));
        for _ in 0..10 {
            c.record_latency(1.0);
        }
        assert_eq!(c.permit_limit(), 3);
    }

    #[test]
    fn initial_limit_is_clamped() {
        let mut cfg = config(0.3);
        cfg.initial_limit = 50;
        assert_eq!(ConcurrencyController::new(&cfg).permit_limit(), 10);
        cfg.initial_limit = 0;
        assert_eq!(ConcurrencyController::new(&cfg).permit_limit(), 2);
    }

    #[test]
    fn concurrent_updates_stay_in_bounds() {
        let c = Arc::new(ConcurrencyController::new(&config(0.3)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let lat = if (t + i) % 2 == 0 { 0.05 } else { 4.0 };
                        let limit = c.record_latency(lat);
                        assert!((2..=10).contains(&limit));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = c.state();
        assert!((s.min_limit..=s.max_limit).contains(&s.current_limit));
    }
}
