//! Speech output.
//!
//! - [`SpeakingLock`]: single-flight flag. Acquisition is a non-blocking
//!   compare-and-swap; failing to acquire is a normal branch (someone is
//!   already talking), not an error. The guard releases on drop, so an
//!   utterance that errors or panics still frees the lock.
//! - [`SpeechSink`]: blocking text → audio playback. Runs on the utterance
//!   thread, never on the tracker loop.

pub mod player;
pub mod ring_buffer;
pub mod tts;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech synthesis not configured: {0}")]
    NotConfigured(String),
    #[error("tts request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tts endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("audio decoder failed: {0}")]
    Decoder(String),
    #[error("audio output failed: {0}")]
    Output(String),
}

/// Mutual-exclusion flag for "an utterance is in flight".
#[derive(Clone, Default)]
pub struct SpeakingLock {
    held: Arc<AtomicBool>,
}

impl SpeakingLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if free. `None` means another utterance is playing.
    pub fn try_acquire(&self) -> Option<SpeakingGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SpeakingGuard {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Held for the lifetime of one utterance.
pub struct SpeakingGuard {
    held: Arc<AtomicBool>,
}

impl Drop for SpeakingGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Blocking speech output.
pub trait SpeechSink: Send + Sync {
    /// Synthesize and play `text`, returning once playback finished.
    fn speak(&self, text: &str) -> Result<(), SpeechError>;
}

/// Used when no TTS endpoint is configured: utterances only hit the log.
pub struct LogSpeaker;

impl SpeechSink for LogSpeaker {
    fn speak(&self, text: &str) -> Result<(), SpeechError> {
        info!(text, "speak (tts disabled)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_single_flight() {
        let lock = SpeakingLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());
        assert!(lock.try_acquire().is_none());
        assert!(lock.clone().try_acquire().is_none());
        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn lock_released_on_panic() {
        let lock = SpeakingLock::new();
        let inner = lock.clone();
        let result = std::thread::spawn(move || {
            let _guard = inner.try_acquire().unwrap();
            panic!("playback crashed");
        })
        .join();
        assert!(result.is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn concurrent_acquire_has_one_winner() {
        let lock = SpeakingLock::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    lock.try_acquire()
                })
            })
            .collect();
        let guards: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(guards.iter().filter(|g| g.is_some()).count(), 1);
    }
}
