//! Job lifecycle controls: cancellation generations and the pause gate.
//! Cancelling ends every run issued under the current generation; runs started
//! afterwards get a fresh token.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owns the root cancellation token and the pause signal shared by all runs of
/// one dispatcher.
pub struct JobControl {
    current_token: RwLock<CancellationToken>,
    generation: AtomicU64,
    paused_tx: watch::Sender<bool>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        let (paused_tx, _) = watch::channel(false);
        Self {
            current_token: RwLock::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
            paused_tx,
        }
    }

    /// Token for a run starting now; cancelled by the next `cancel()`.
    pub fn child_token(&self) -> (CancellationToken, u64) {
        let token_guard = self.current_token.read();
        let child = token_guard.child_token();
        let gen = self.generation.load(Ordering::SeqCst);
        (child, gen)
    }

    /// Cancel every run of the current generation and advance. A pending pause
    /// is lifted so later runs do not start blocked.
    pub fn cancel(&self) -> u64 {
        let mut token_guard = self.current_token.write();
        token_guard.cancel();
        *token_guard = CancellationToken::new();
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.paused_tx.send_replace(false);
        info!(generation = gen, "job_cancelled");
        gen
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stop issuing new backend calls. In-flight calls are unaffected.
    pub fn pause(&self) {
        if !self.paused_tx.send_replace(true) {
            info!("job_paused");
        }
    }

    pub fn resume(&self) {
        if self.paused_tx.send_replace(false) {
            info!("job_resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    pub fn pause_gate(&self) -> PauseGate {
        PauseGate {
            paused_rx: self.paused_tx.subscribe(),
        }
    }
}

/// Checked before every backend call and retry attempt.
#[derive(Clone)]
pub struct PauseGate {
    paused_rx: watch::Receiver<bool>,
}

impl PauseGate {
    /// Wait until not paused. Returns false if `token` is cancelled first.
    pub async fn wait_ready(&mut self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            res = self.paused_rx.wait_for(|paused| !*paused) => res.is_ok(),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn cancel_advances_generation_and_cancels_old_tokens() {
        let control = JobControl::new();
        let (old, gen) = control.child_token();
        assert_eq!(gen, 0);
        assert_eq!(control.cancel(), 1);
        assert!(old.is_cancelled());

        let (fresh, gen) = control.child_token();
        assert_eq!(gen, 1);
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test]
    async fn gate_passes_when_not_paused() {
        let control = JobControl::new();
        let (token, _) = control.child_token();
        let mut gate = control.pause_gate();
        assert!(gate.wait_ready(&token).await);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_blocks_until_resume() {
        let control = Arc::new(JobControl::new());
        let (token, _) = control.child_token();
        control.pause();
        assert!(control.is_paused());

        let mut gate = control.pause_gate();
        let waiter = tokio::spawn(async move { gate.wait_ready(&token).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        control.resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_releases_paused_waiters() {
        let control = Arc::new(JobControl::new());
        let (token, _) = control.child_token();
        control.pause();
        let mut gate = control.pause_gate();
        let waiter = tokio::spawn(async move { gate.wait_ready(&token).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        control.cancel();
        assert!(!waiter.await.unwrap());
        assert!(!control.is_paused());
    }
}
