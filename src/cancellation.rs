//! Shared stop flag for every long-running unit (tracker, suggestion loop,
//! conversation loop, status server).
//! Wraps a tokio-util CancellationToken so async tasks can await it while
//! OS threads poll it between sleeps.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Granularity of blocking waits. Threads observe a stop within one interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cloneable process-wide stop flag.
#[derive(Clone, Default)]
pub struct StopFlag {
    token: CancellationToken,
}

impl StopFlag {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request every unit to stop. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep for `duration` on the current thread, waking early on stop.
    /// Returns true if the flag was raised before or during the wait.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }

    /// Resolves once the flag is raised (for async tasks).
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Guard that raises the flag when dropped, including on panic unwind.
    pub fn stop_on_drop(&self) -> StopOnDrop {
        StopOnDrop(self.clone())
    }
}

/// Raises its [`StopFlag`] on drop.
pub struct StopOnDrop(StopFlag);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_early_once_stopped() {
        let flag = StopFlag::new();
        let remote = flag.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.stop();
        });

        let start = Instant::now();
        assert!(flag.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn guard_stops_on_panic() {
        let flag = StopFlag::new();
        let inner = flag.clone();
        let result = std::thread::spawn(move || {
            let _guard = inner.stop_on_drop();
            panic!("tracker crashed");
        })
        .join();
        assert!(result.is_err());
        assert!(flag.is_stopped());
    }

    #[test]
    fn sleep_runs_to_completion_without_stop() {
        let flag = StopFlag::new();
        assert!(!flag.sleep(Duration::from_millis(5)));
        assert!(!flag.is_stopped());
    }
}
