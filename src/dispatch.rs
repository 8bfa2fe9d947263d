//! Greeting / suggestion dispatcher.
//! Every utterance goes through one [`SpeakingLock`]: the caller takes the lock
//! without blocking, and on success the guard moves into a short-lived
//! utterance thread that plays the text and drops the guard when done. The
//! caller never waits for playback.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancellation::StopFlag;
use crate::catalog::AssistantConfig;
use crate::config::DispatchConfig;
use crate::detect::Sex;
use crate::presence::PresenceHandle;
use crate::speech::{SpeakingGuard, SpeakingLock, SpeechSink};

const LOCK_POLL: Duration = Duration::from_millis(50);

/// Greeting framed for the synthesizer, honorific first.
pub fn greeting_text(honorific: Option<&str>, greeting: &str) -> String {
    format!("。{}　{greeting}　。", honorific.unwrap_or(""))
}

pub fn suggestion_text(suggestion: &str) -> String {
    format!("。　{suggestion}　。")
}

pub struct Dispatcher {
    lock: SpeakingLock,
    sink: Arc<dyn SpeechSink>,
    assistant: Arc<AssistantConfig>,
    cfg: DispatchConfig,
    stop: StopFlag,
    last_utterance: RwLock<Option<String>>,
}

impl Dispatcher {
    pub fn new(
        sink: Arc<dyn SpeechSink>,
        assistant: Arc<AssistantConfig>,
        cfg: DispatchConfig,
        stop: StopFlag,
    ) -> Self {
        Self {
            lock: SpeakingLock::new(),
            sink,
            assistant,
            cfg,
            stop,
            last_utterance: RwLock::new(None),
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.lock.is_held()
    }

    /// Text of the most recent utterance, for echo suppression.
    pub fn last_utterance(&self) -> Option<String> {
        self.last_utterance.read().clone()
    }

    fn honorific(&self, sex: Sex) -> Option<&str> {
        match sex {
            Sex::Male => Some(self.cfg.male_honorific.as_str()),
            Sex::Female => Some(self.cfg.female_honorific.as_str()),
            Sex::Unknown => None,
        }
    }

    /// Greet the closest visitor. Returns `true` if the greeting was
    /// dispatched; `false` if speech is busy or the kiosk is stopping.
    pub fn try_greet(&self, sex: Sex) -> bool {
        let Some(greeting) = self.assistant.pick_greeting(&mut rand::thread_rng()) else {
            return false;
        };
        let text = greeting_text(self.honorific(sex), greeting);
        self.try_speak_as(text, "greeting")
    }

    /// Speak `text` if nothing else is playing.
    pub fn try_speak(&self, text: String) -> bool {
        self.try_speak_as(text, "speech")
    }

    /// Wait up to `timeout` for the lock, then speak. Used for replies, which
    /// should not be dropped just because a suggestion is finishing.
    pub fn speak_within(&self, text: String, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stop.is_stopped() {
                return false;
            }
            if let Some(guard) = self.lock.try_acquire() {
                return self.dispatch(guard, text, "reply");
            }
            if Instant::now() >= deadline {
                debug!("speech busy, reply dropped");
                return false;
            }
            std::thread::sleep(LOCK_POLL);
        }
    }

    fn try_speak_as(&self, text: String, kind: &'static str) -> bool {
        if self.stop.is_stopped() {
            return false;
        }
        match self.lock.try_acquire() {
            Some(guard) => self.dispatch(guard, text, kind),
            None => {
                debug!(kind, "speech busy, skipped");
                false
            }
        }
    }

    /// Hand the guard and text to a fresh utterance thread.
    fn dispatch(&self, guard: SpeakingGuard, text: String, kind: &'static str) -> bool {
        let utterance_id = Uuid::new_v4();
        *self.last_utterance.write() = Some(text.clone());
        info!(%utterance_id, kind, text = %text, "utterance_start");

        let sink = Arc::clone(&self.sink);
        let spawned = std::thread::Builder::new()
            .name("utterance".into())
            .spawn(move || {
                let _guard = guard;
                let started = Instant::now();
                match sink.speak(&text) {
                    Ok(()) => info!(
                        %utterance_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "utterance_done"
                    ),
                    Err(e) => warn!(%utterance_id, error = %e, "utterance failed"),
                }
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                // the closure (and guard) was dropped with the failed spawn
                warn!(error = %e, "failed to spawn utterance thread");
                false
            }
        }
    }

    /// Offer a random suggestion every `suggest_interval_secs` while someone
    /// is present. Busy speech drops the suggestion; there is no backlog.
    pub fn spawn_suggestion_loop(
        self: &Arc<Self>,
        presence: Arc<PresenceHandle>,
    ) -> std::io::Result<JoinHandle<()>> {
        let dispatcher = Arc::clone(self);
        let interval = Duration::from_secs_f64(self.cfg.suggest_interval_secs);
        std::thread::Builder::new()
            .name("suggestion-loop".into())
            .spawn(move || {
                info!(interval_s = interval.as_secs_f64(), "suggestion loop started");
                let mut rng = rand::thread_rng();
                loop {
                    if dispatcher.stop.sleep(interval) {
                        break;
                    }
                    if !presence.is_present() {
                        continue;
                    }
                    let Some(suggestion) = dispatcher.assistant.pick_suggestion(&mut rng) else {
                        continue;
                    };
                    dispatcher.try_speak_as(suggestion_text(suggestion), "suggestion");
                }
                info!("suggestion loop stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::SpeechError;
    use parking_lot::Mutex;

    /// Records utterances; blocks each one until released.
    struct GatedSink {
        spoken: Mutex<Vec<String>>,
        gate: crossbeam_channel::Receiver<()>,
        fail: bool,
    }

    impl SpeechSink for GatedSink {
        fn speak(&self, text: &str) -> Result<(), SpeechError> {
            self.spoken.lock().push(text.to_string());
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            if self.fail {
                Err(SpeechError::Output("device gone".into()))
            } else {
                Ok(())
            }
        }
    }

    fn dispatcher(fail: bool) -> (Arc<Dispatcher>, Arc<GatedSink>, crossbeam_channel::Sender<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = Arc::new(GatedSink {
            spoken: Mutex::new(Vec::new()),
            gate: rx,
            fail,
        });
        let d = Dispatcher::new(
            sink.clone(),
            Arc::new(AssistantConfig::default()),
            DispatchConfig::default(),
            StopFlag::new(),
        );
        (Arc::new(d), sink, tx)
    }

    fn wait_idle(d: &Dispatcher) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while d.is_speaking() {
            assert!(Instant::now() < deadline, "lock never released");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn text_framing() {
        assert_eq!(greeting_text(Some("先生"), "欢迎光临"), "。先生　欢迎光临　。");
        assert_eq!(greeting_text(None, "您好"), "。　您好　。");
        assert_eq!(suggestion_text("需要推荐吗?"), "。　需要推荐吗?　。");
    }

    #[test]
    fn greeting_uses_honorific() {
        let (d, sink, gate) = dispatcher(false);
        assert!(d.try_greet(Sex::Female));
        gate.send(()).unwrap();
        wait_idle(&d);

        let spoken = sink.spoken.lock().clone();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].starts_with("。女士　"));
        assert_eq!(d.last_utterance(), Some(spoken[0].clone()));
    }

    #[test]
    fn busy_lock_drops_second_utterance() {
        let (d, sink, gate) = dispatcher(false);
        assert!(d.try_speak("first".into()));
        assert!(!d.try_greet(Sex::Male));
        assert!(!d.try_speak("second".into()));
        gate.send(()).unwrap();
        wait_idle(&d);
        assert_eq!(*sink.spoken.lock(), vec!["first".to_string()]);
    }

    #[test]
    fn failed_playback_releases_lock() {
        let (d, _sink, gate) = dispatcher(true);
        assert!(d.try_speak("boom".into()));
        gate.send(()).unwrap();
        wait_idle(&d);
        assert!(d.try_speak("again".into()));
        gate.send(()).unwrap();
        wait_idle(&d);
    }

    #[test]
    fn stop_blocks_new_utterances() {
        let (d, sink, _gate) = dispatcher(false);
        d.stop.stop();
        assert!(!d.try_greet(Sex::Unknown));
        assert!(!d.speak_within("late".into(), Duration::from_millis(100)));
        assert!(sink.spoken.lock().is_empty());
    }

    #[test]
    fn speak_within_waits_for_release() {
        let (d, sink, gate) = dispatcher(false);
        assert!(d.try_speak("suggestion".into()));

        let releaser = {
            let gate = gate.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                gate.send(()).unwrap();
            })
        };
        assert!(d.speak_within("reply".into(), Duration::from_secs(3)));
        releaser.join().unwrap();
        gate.send(()).unwrap();
        wait_idle(&d);
        assert_eq!(sink.spoken.lock().len(), 2);
    }

    #[test]
    fn speak_within_gives_up() {
        let (d, _sink, gate) = dispatcher(false);
        assert!(d.try_speak("long".into()));
        assert!(!d.speak_within("reply".into(), Duration::from_millis(120)));
        gate.send(()).unwrap();
        wait_idle(&d);
    }
}
