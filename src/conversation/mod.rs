//! Conversation loop: recognised user speech → LLM → spoken reply.
//! Queries arrive on a crossbeam channel from any recogniser (or the stdin
//! listener). The loop owns the chat history; replies go through the
//! dispatcher so they respect the speaking lock.

pub mod echo;
pub mod llm;

use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::cancellation::{StopFlag, POLL_INTERVAL};
use crate::catalog::NO_RESPONSE_MARKER;
use crate::dispatch::Dispatcher;
use crate::presence::PresenceHandle;
use llm::{ChatMessage, ReplyGenerator};

/// How long a reply may wait for an in-flight utterance to finish.
const REPLY_LOCK_WAIT: Duration = Duration::from_secs(10);

/// Bounded query queue; recognisers drop input when it is full.
pub fn query_channel() -> (Sender<String>, Receiver<String>) {
    crossbeam_channel::bounded(16)
}

/// What happened to one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Empty,
    UserAbsent,
    Echo,
    NoResponse,
    Failed,
    Busy,
    Spoken,
}

pub struct ConversationLoop {
    queries: Receiver<String>,
    dispatcher: Arc<Dispatcher>,
    presence: Arc<PresenceHandle>,
    generator: Arc<dyn ReplyGenerator>,
    system_prompt: String,
    history: VecDeque<ChatMessage>,
    history_turns: usize,
    stop: StopFlag,
}

impl ConversationLoop {
    pub fn new(
        queries: Receiver<String>,
        dispatcher: Arc<Dispatcher>,
        presence: Arc<PresenceHandle>,
        generator: Arc<dyn ReplyGenerator>,
        system_prompt: String,
        history_turns: usize,
        stop: StopFlag,
    ) -> Self {
        Self {
            queries,
            dispatcher,
            presence,
            generator,
            system_prompt,
            history: VecDeque::new(),
            history_turns,
            stop,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("conversation".into())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        info!("conversation loop started");
        while !self.stop.is_stopped() {
            match self.queries.recv_timeout(POLL_INTERVAL) {
                Ok(query) => {
                    let outcome = self.handle_query(&query);
                    debug!(?outcome, "query handled");
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("conversation loop stopped");
    }

    pub fn handle_query(&mut self, query: &str) -> QueryOutcome {
        let query = query.trim();
        if query.is_empty() {
            return QueryOutcome::Empty;
        }
        if !self.presence.is_present() {
            debug!(query, "user absent, query dropped");
            return QueryOutcome::UserAbsent;
        }
        if let Some(last) = self.dispatcher.last_utterance() {
            if echo::is_likely_echo(query, &last) {
                info!(query, "system echo detected, query dropped");
                return QueryOutcome::Echo;
            }
        }

        let messages = self.build_messages(query);
        let reply = match self.generator.reply(&messages) {
            Ok(reply) => reply.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "llm request failed, query dropped");
                return QueryOutcome::Failed;
            }
        };
        if reply.is_empty() || reply.contains(NO_RESPONSE_MARKER) {
            debug!(query, "no response needed");
            return QueryOutcome::NoResponse;
        }

        self.remember(query, &reply);
        info!(query, reply = %reply, "assistant_reply");
        if self.dispatcher.speak_within(reply, REPLY_LOCK_WAIT) {
            QueryOutcome::Spoken
        } else {
            QueryOutcome::Busy
        }
    }

    fn build_messages(&self, query: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(query));
        messages
    }

    fn remember(&mut self, query: &str, reply: &str) {
        self.history.push_back(ChatMessage::user(query));
        self.history.push_back(ChatMessage::assistant(reply));
        while self.history.len() > self.history_turns * 2 {
            self.history.pop_front();
        }
    }
}

/// Feed stdin lines into the query queue (keyboard stand-in for a recogniser).
pub fn spawn_stdin_listener(queries: Sender<String>, stop: StopFlag) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("stdin-listener".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if stop.is_stopped() {
                    break;
                }
                let Ok(line) = line else { break };
                if queries.try_send(line).is_err() {
                    debug!("query queue full, input dropped");
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::llm::{LlmError, Role};
    use super::*;
    use crate::catalog::AssistantConfig;
    use crate::config::DispatchConfig;
    use crate::presence::PresenceView;
    use crate::speech::{SpeechError, SpeechSink};
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<String>>);

    impl SpeechSink for Recorder {
        fn speak(&self, text: &str) -> Result<(), SpeechError> {
            self.0.lock().push(text.to_string());
            Ok(())
        }
    }

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ReplyGenerator for Scripted {
        fn reply(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.seen.lock().push(messages.to_vec());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Api("script exhausted".into())))
        }
    }

    struct Harness {
        convo: ConversationLoop,
        presence: Arc<PresenceHandle>,
        dispatcher: Arc<Dispatcher>,
        llm: Arc<Scripted>,
    }

    fn harness(replies: Vec<Result<String, LlmError>>, history_turns: usize) -> Harness {
        let (_tx, rx) = query_channel();
        let presence = Arc::new(PresenceHandle::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(Recorder(Mutex::new(Vec::new()))),
            Arc::new(AssistantConfig::default()),
            DispatchConfig::default(),
            StopFlag::new(),
        ));
        let llm = Arc::new(Scripted {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        });
        let convo = ConversationLoop::new(
            rx,
            dispatcher.clone(),
            presence.clone(),
            llm.clone(),
            "system".into(),
            history_turns,
            StopFlag::new(),
        );
        Harness {
            convo,
            presence,
            dispatcher,
            llm,
        }
    }

    fn set_present(presence: &PresenceHandle, present: bool) {
        presence.store(PresenceView {
            is_present: present,
            ..PresenceView::default()
        });
    }

    fn wait_idle(d: &Dispatcher) {
        for _ in 0..200 {
            if !d.is_speaking() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("speech never finished");
    }

    #[test]
    fn absent_user_is_ignored() {
        let mut h = harness(vec![Ok("hi".into())], 3);
        assert_eq!(h.convo.handle_query("你好"), QueryOutcome::UserAbsent);
        assert!(h.llm.seen.lock().is_empty());
    }

    #[test]
    fn reply_is_spoken_and_remembered() {
        let mut h = harness(vec![Ok("推荐拿铁".into()), Ok("好的".into())], 3);
        set_present(&h.presence, true);

        assert_eq!(h.convo.handle_query("有什么推荐"), QueryOutcome::Spoken);
        wait_idle(&h.dispatcher);
        assert_eq!(h.dispatcher.last_utterance().as_deref(), Some("推荐拿铁"));

        assert_eq!(h.convo.handle_query("我要一杯"), QueryOutcome::Spoken);
        let seen = h.llm.seen.lock();
        let second = &seen[1];
        assert_eq!(second[0].role, Role::System);
        assert_eq!(second[1], ChatMessage::user("有什么推荐"));
        assert_eq!(second[2], ChatMessage::assistant("推荐拿铁"));
        assert_eq!(second[3], ChatMessage::user("我要一杯"));
    }

    #[test]
    fn echo_of_last_utterance_is_dropped() {
        let mut h = harness(vec![Ok("需要推荐吗".into())], 3);
        set_present(&h.presence, true);
        assert!(h.dispatcher.try_speak("。　要试试我们的招牌饮品吗?　。".into()));
        wait_idle(&h.dispatcher);
        assert_eq!(h.convo.handle_query("要试试我们的招牌饮品吗"), QueryOutcome::Echo);
        assert!(h.llm.seen.lock().is_empty());
    }

    #[test]
    fn no_response_marker_is_silent() {
        let mut h = harness(vec![Ok("[NO_RESPONSE]".into())], 3);
        set_present(&h.presence, true);
        assert_eq!(h.convo.handle_query("嗯嗯"), QueryOutcome::NoResponse);
        assert_eq!(h.dispatcher.last_utterance(), None);
    }

    #[test]
    fn llm_failure_drops_query() {
        let mut h = harness(vec![Err(LlmError::Timeout)], 3);
        set_present(&h.presence, true);
        assert_eq!(h.convo.handle_query("你好"), QueryOutcome::Failed);
        assert_eq!(h.convo.handle_query("   "), QueryOutcome::Empty);
    }

    #[test]
    fn history_is_bounded() {
        let replies = (0..5).map(|i| Ok(format!("reply {i}"))).collect();
        let mut h = harness(replies, 1);
        set_present(&h.presence, true);
        for i in 0..5 {
            h.convo.handle_query(&format!("question number {i}"));
            wait_idle(&h.dispatcher);
        }
        assert_eq!(h.convo.history.len(), 2);
        assert_eq!(h.convo.history[0], ChatMessage::user("question number 4"));
    }
}
