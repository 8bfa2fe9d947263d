//! Presence-aware kiosk assistant.
//! Watches a camera for visitors, greets each one once, offers periodic
//! suggestions while they stay, answers recognised questions through an LLM,
//! and broadcasts presence status over WebSocket.
//!
//! Threads: presence tracker (blocking camera + detector), suggestion loop,
//! conversation loop, one short-lived thread per utterance. The status server
//! runs as tokio tasks.

pub mod cancellation;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod detect;
pub mod dispatch;
pub mod metrics;
pub mod perf;
pub mod presence;
pub mod speech;
pub mod status;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{info, warn};

use cancellation::StopFlag;
use catalog::{AssistantConfig, CatalogClient};
use config::{Cli, ConfigError, KioskConfig, LlmConfig, TtsConfig};
use conversation::llm::{ChatClient, ReplyGenerator};
use conversation::ConversationLoop;
use detect::worker::VisionWorker;
use detect::Overlay;
use dispatch::Dispatcher;
use metrics::MetricsRegistry;
use perf::cpu::ProcStatSampler;
use perf::PerformanceOptimizer;
use presence::tracker::{PresenceTracker, TrackerError, TrackerIo, TrackerSinks};
use presence::PresenceHandle;
use speech::tts::TtsSpeaker;
use speech::{LogSpeaker, SpeechSink};
use status::server::{StatusError, StatusServer};
use status::StatusPublisher;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum KioskError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("presence tracker exited abnormally")]
    TrackerPanicked,
}

fn spawn_err(name: &'static str) -> impl FnOnce(std::io::Error) -> KioskError {
    move |source| KioskError::Spawn { name, source }
}

/// Install the fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("presence_kiosk=debug,info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}

async fn load_assistant(cfg: &config::CatalogConfig) -> AssistantConfig {
    let fetched = match CatalogClient::new(cfg) {
        Ok(client) => client.fetch_by_id(&cfg.machine_id).await,
        Err(e) => Err(e),
    };
    AssistantConfig::resolve(fetched)
}

fn build_speech_sink(cfg: &TtsConfig, runtime: Handle) -> Arc<dyn SpeechSink> {
    let Some(url) = cfg.url.as_deref() else {
        warn!("tts.url not set, utterances go to the log only");
        return Arc::new(LogSpeaker);
    };
    let Ok(api_key) = std::env::var("TTS_API_KEY") else {
        warn!("TTS_API_KEY not set, utterances go to the log only");
        return Arc::new(LogSpeaker);
    };
    match TtsSpeaker::new(cfg, api_key, runtime) {
        Ok(speaker) => {
            info!(url, voice = %cfg.voice, "tts speaker initialized");
            Arc::new(speaker) as Arc<dyn SpeechSink>
        }
        Err(e) => {
            warn!(error = %e, "tts init failed, utterances go to the log only");
            Arc::new(LogSpeaker)
        }
    }
}

fn build_reply_generator(
    cfg: &LlmConfig,
    runtime: Handle,
    stop: &StopFlag,
) -> Option<Arc<dyn ReplyGenerator>> {
    let api_key = match std::env::var("DASHSCOPE_API_KEY") {
        Ok(key) => key,
        Err(_) => {
            warn!("DASHSCOPE_API_KEY not set, conversation disabled");
            return None;
        }
    };
    match ChatClient::new(cfg, api_key, runtime, stop.token().clone()) {
        Ok(client) => {
            info!(model = %cfg.model, "llm client initialized");
            Some(Arc::new(client) as Arc<dyn ReplyGenerator>)
        }
        Err(e) => {
            warn!(error = %e, "llm client init failed, conversation disabled");
            None
        }
    }
}

async fn join_thread(name: &'static str, handle: JoinHandle<()>) {
    let joined = tokio::time::timeout(
        SHUTDOWN_GRACE,
        tokio::task::spawn_blocking(move || handle.join()),
    )
    .await;
    match joined {
        Ok(Ok(Ok(()))) => {}
        Ok(_) => warn!(thread = name, "thread exited abnormally"),
        Err(_) => warn!(thread = name, "thread did not stop in time"),
    }
}

type TrackerDone = tokio::sync::oneshot::Receiver<Result<(), TrackerError>>;

/// Wait for the tracker thread's result. A tracker stuck in a camera or
/// detector call past `grace` is abandoned so shutdown still completes.
async fn await_tracker(done: TrackerDone, grace: Duration) -> Result<(), KioskError> {
    match tokio::time::timeout(grace, done).await {
        Ok(Ok(result)) => result.map_err(KioskError::from),
        Ok(Err(_)) => Err(KioskError::TrackerPanicked),
        Err(_) => {
            warn!("presence tracker did not stop in time");
            Ok(())
        }
    }
}

/// Run the kiosk until Ctrl-C or until the video source is lost.
pub async fn run(cli: Cli) -> Result<(), KioskError> {
    init_tracing();
    info!(headless = cli.headless, camera = cli.camid, "presence-kiosk starting");

    let cfg = KioskConfig::load(cli.config.as_deref())?;
    let stop = StopFlag::new();
    let runtime = Handle::current();
    let metrics = Arc::new(MetricsRegistry::new());

    let assistant = Arc::new(load_assistant(&cfg.catalog).await);

    let publisher = Arc::new(StatusPublisher::new());
    let server = StatusServer::bind(cfg.status_addr()?, Arc::clone(&publisher)).await?;
    let server_task = tokio::spawn(server.serve(stop.clone()));

    let presence = Arc::new(PresenceHandle::new());
    let dispatcher = Arc::new(Dispatcher::new(
        build_speech_sink(&cfg.tts, runtime.clone()),
        Arc::clone(&assistant),
        cfg.dispatch.clone(),
        stop.clone(),
    ));
    let mut threads: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    threads.push((
        "suggestion-loop",
        dispatcher
            .spawn_suggestion_loop(Arc::clone(&presence))
            .map_err(spawn_err("suggestion-loop"))?,
    ));

    // Recognisers feed this queue; kept alive for the whole run.
    let (query_tx, query_rx) = conversation::query_channel();
    if let Some(generator) = build_reply_generator(&cfg.llm, runtime.clone(), &stop) {
        let convo = ConversationLoop::new(
            query_rx,
            Arc::clone(&dispatcher),
            Arc::clone(&presence),
            generator,
            assistant.system_prompt.clone(),
            cfg.llm.history_turns,
            stop.clone(),
        );
        threads.push(("conversation", convo.spawn().map_err(spawn_err("conversation"))?));
        if cfg.conversation.stdin_listener {
            // blocks on stdin; never joined
            conversation::spawn_stdin_listener(query_tx.clone(), stop.clone())
                .map_err(spawn_err("stdin-listener"))?;
        }
    }

    let vision = Arc::new(VisionWorker::new(&cfg.vision, cli.camid, cli.headless));
    let overlay: Option<Arc<dyn Overlay>> = if cli.headless {
        None
    } else {
        Some(vision.clone() as Arc<dyn Overlay>)
    };
    let optimizer = PerformanceOptimizer::new(Box::new(ProcStatSampler::new()), cfg.performance.clone())
        .with_metrics(Arc::clone(&metrics));
    let tracker = PresenceTracker::new(
        TrackerIo {
            source: vision.clone(),
            detector: vision.clone(),
            overlay,
        },
        TrackerSinks {
            dispatcher: Arc::clone(&dispatcher),
            publisher: Arc::clone(&publisher),
            presence: Arc::clone(&presence),
            metrics: Arc::clone(&metrics),
        },
        optimizer,
        &cfg,
        stop.clone(),
    );

    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let tracker_stop = stop.clone();
    std::thread::Builder::new()
        .name("presence-tracker".into())
        .spawn(move || {
            let _stop_guard = tracker_stop.stop_on_drop();
            if !vision.health_check() {
                warn!("vision worker not answering yet, first grab will retry");
            }
            drop(vision);
            let _ = done_tx.send(tracker.run());
        })
        .map_err(spawn_err("presence-tracker"))?;

    info!("presence-kiosk running");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "ctrl-c handler failed");
            }
            info!("shutdown requested");
        }
        _ = stop.stopped() => {}
    }
    stop.stop();

    let tracker_result = await_tracker(done_rx, SHUTDOWN_GRACE).await;
    for (name, handle) in threads {
        join_thread(name, handle).await;
    }
    drop(query_tx);
    if tokio::time::timeout(SHUTDOWN_GRACE, server_task).await.is_err() {
        warn!("status server did not stop in time");
    }

    let summary = metrics.summary();
    info!(metrics = ?summary, "presence-kiosk stopped");
    tracker_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectError;

    #[tokio::test]
    async fn stuck_tracker_does_not_block_shutdown() {
        let (_done_tx, done_rx) = tokio::sync::oneshot::channel();
        let started = std::time::Instant::now();
        let result = await_tracker(done_rx, Duration::from_millis(50)).await;
        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn tracker_outcome_is_reported() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        done_tx
            .send(Err(TrackerError::SourceLost(DetectError::SourceLost("unplugged".into()))))
            .unwrap();
        let result = await_tracker(done_rx, SHUTDOWN_GRACE).await;
        assert!(matches!(result, Err(KioskError::Tracker(_))));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<Result<(), TrackerError>>();
        drop(done_tx);
        let result = await_tracker(done_rx, SHUTDOWN_GRACE).await;
        assert!(matches!(result, Err(KioskError::TrackerPanicked)));
    }
}
