use std::sync::Arc;

use arc_swap::ArcSwap;
use shinku_llm::{
    ChatBackend, Message, ProviderConfig, SessionConfig, SessionEvent, SessionId, StreamRequest,
    StreamingSession,
};
use snafu::{OptionExt, Snafu};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::events::PresentationEvent;
use crate::history::ConversationHistory;
use crate::monitor::SourceMonitor;
use crate::state::{TurnState, TurnTransition};

/// Session configuration published by the settings owner and read once per turn.
pub type SharedConfig = Arc<ArcSwap<SessionConfig>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoordinatorError {
    #[snafu(display("coordinator stopped before `{stage}` completed"))]
    Stopped { stage: &'static str },
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub state: TurnState,
    pub history: Vec<Message>,
}

enum CoordinatorCommand {
    Submit(String),
    ClearHistory { done: oneshot::Sender<()> },
    Status { reply: oneshot::Sender<CoordinatorStatus> },
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable control surface for a running [`SessionCoordinator`].
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    /// Starts a turn with `content` exactly as if the source had changed to it.
    pub fn submit(&self, content: impl Into<String>) -> Result<(), CoordinatorError> {
        self.send(CoordinatorCommand::Submit(content.into()), "submit")
    }

    /// Cancels any active turn, then empties the history.
    pub async fn clear_history(&self) -> Result<(), CoordinatorError> {
        let (done, done_rx) = oneshot::channel();
        self.send(CoordinatorCommand::ClearHistory { done }, "clear-history")?;
        done_rx.await.ok().context(StoppedSnafu {
            stage: "clear-history",
        })
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(CoordinatorCommand::Status { reply }, "status")?;
        reply_rx.await.ok().context(StoppedSnafu { stage: "status" })
    }

    /// Cancels any active turn and stops the coordinator loop.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (done, done_rx) = oneshot::channel();
        self.send(CoordinatorCommand::Shutdown { done }, "shutdown")?;
        done_rx.await.ok().context(StoppedSnafu { stage: "shutdown" })
    }

    fn send(&self, command: CoordinatorCommand, stage: &'static str) -> Result<(), CoordinatorError> {
        self.commands.send(command).ok().context(StoppedSnafu { stage })
    }
}

/// Holds the one session allowed to be in flight.
#[derive(Default)]
pub struct ActiveSessionSlot {
    session: Option<StreamingSession>,
}

impl ActiveSessionSlot {
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(StreamingSession::id)
    }

    pub fn is_occupied(&self) -> bool {
        self.session.is_some()
    }

    fn set(&mut self, session: StreamingSession) {
        if let Some(previous) = self.session.replace(session) {
            // Unreachable while callers settle the slot first; dropping still cancels.
            tracing::error!(session_id = %previous.id(), "active session replaced without settling");
        }
    }

    /// Resolves with the next event of the held session; pends forever while empty.
    async fn next_event(&mut self) -> (SessionId, SessionEvent) {
        let Some(session) = self.session.as_mut() else {
            return std::future::pending().await;
        };
        match session.next_event().await {
            Some(event) => (session.id(), event),
            None => std::future::pending().await,
        }
    }

    /// Cancels the held session and waits for it to terminate.
    async fn cancel_and_wait(&mut self) -> Option<SessionId> {
        let session = self.session.take()?;
        let id = session.id();
        session.cancel_and_wait().await;
        Some(id)
    }

    /// Releases a session whose terminal event has been handled.
    async fn finish(&mut self) {
        if let Some(session) = self.session.take() {
            session.finish().await;
        }
    }
}

/// Turns source changes into streaming sessions, one at a time.
///
/// The coordinator is the only writer of the conversation history and the
/// active session slot. All of its work happens on one task, so a new session
/// is started only after the previous one has fully terminated.
pub struct SessionCoordinator {
    monitor: SourceMonitor,
    history: ConversationHistory,
    active: ActiveSessionSlot,
    state: TurnState,
    config: SharedConfig,
    backend: Arc<dyn ChatBackend>,
    next_session_id: u64,
    commands: mpsc::UnboundedReceiver<CoordinatorCommand>,
    events_tx: mpsc::UnboundedSender<PresentationEvent>,
}

impl SessionCoordinator {
    pub fn new(
        monitor: SourceMonitor,
        config: SharedConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> (
        Self,
        CoordinatorHandle,
        mpsc::UnboundedReceiver<PresentationEvent>,
    ) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let coordinator = Self {
            monitor,
            history: ConversationHistory::new(),
            active: ActiveSessionSlot::default(),
            state: TurnState::Idle,
            config,
            backend,
            next_session_id: 1,
            commands,
            events_tx,
        };

        (
            coordinator,
            CoordinatorHandle {
                commands: commands_tx,
            },
            events,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until shutdown is requested or every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!(
            backend = self.backend.id(),
            poll_interval_ms = self.monitor.interval().as_millis() as u64,
            "session coordinator started"
        );

        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(CoordinatorCommand::Shutdown { done }) => {
                        shutdown_ack = Some(done);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                (session_id, event) = self.active.next_event() => {
                    self.handle_session_event(session_id, event).await;
                }
                change = self.monitor.next_change() => {
                    tracing::debug!(length = change.content.len(), "source changed");
                    self.begin_turn(change.content).await;
                }
            }
        }

        self.cancel_active().await;
        tracing::info!("session coordinator stopped");
        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Submit(content) => self.begin_turn(content).await,
            CoordinatorCommand::ClearHistory { done } => {
                self.clear_history().await;
                let _ = done.send(());
            }
            CoordinatorCommand::Status { reply } => {
                let _ = reply.send(CoordinatorStatus {
                    state: self.state,
                    history: self.history.snapshot(),
                });
            }
            CoordinatorCommand::Shutdown { done } => {
                // Handled by the run loop; answer anyway so callers never hang.
                let _ = done.send(());
            }
        }
    }

    async fn begin_turn(&mut self, content: String) {
        if content.trim().is_empty() {
            return;
        }

        self.cancel_active().await;
        self.history.append(Message::user(content.clone()));

        let session_id = SessionId::new(self.next_session_id);
        self.next_session_id = self.next_session_id.saturating_add(1);
        self.transition(TurnTransition::Start(session_id));

        let config = self.config.load_full();
        let request = StreamRequest::from_config(&config, self.history.snapshot());
        let session = StreamingSession::start(
            session_id,
            self.backend.clone(),
            ProviderConfig::from(config.as_ref()),
            request,
        );
        self.active.set(session);
        self.emit(PresentationEvent::TurnStarted {
            session_id,
            content,
        });
        tracing::info!(
            session_id = %session_id,
            history_len = self.history.len(),
            model_id = %config.model_name,
            "turn started"
        );
    }

    async fn handle_session_event(&mut self, session_id: SessionId, event: SessionEvent) {
        let transition = match &event {
            SessionEvent::Partial(_) if self.state == TurnState::Starting(session_id) => {
                self.transition(TurnTransition::Stream(session_id));
                None
            }
            SessionEvent::Partial(_) => None,
            SessionEvent::Completed(text) => {
                self.history.append(Message::assistant(text.clone()));
                tracing::info!(session_id = %session_id, length = text.len(), "turn completed");
                Some(TurnTransition::Complete(session_id))
            }
            SessionEvent::Failed(failure) if failure.is_cancelled() => {
                Some(TurnTransition::Cancel(session_id))
            }
            SessionEvent::Failed(failure) => {
                tracing::warn!(session_id = %session_id, error = %failure, "turn failed");
                Some(TurnTransition::Fail(session_id))
            }
        };

        if let Some(transition) = transition {
            self.active.finish().await;
            self.transition(transition);
        }

        if let Some(presentation) = PresentationEvent::from_session_event(session_id, event) {
            self.emit(presentation);
        }
    }

    async fn clear_history(&mut self) {
        self.cancel_active().await;
        self.history.reset();
        self.monitor.reset_snapshot();
        self.transition(TurnTransition::ResetToIdle);
        self.emit(PresentationEvent::HistoryCleared);
        tracing::info!("conversation history cleared");
    }

    /// Cancels the active session, if any, and returns once it has terminated.
    async fn cancel_active(&mut self) {
        if let Some(session_id) = self.active.cancel_and_wait().await {
            self.transition(TurnTransition::Cancel(session_id));
            tracing::debug!(session_id = %session_id, "active session superseded");
        }
    }

    fn transition(&mut self, transition: TurnTransition) {
        match self.state.apply(transition) {
            Ok(next_state) => self.state = next_state,
            Err(rejection) => {
                tracing::warn!(
                    state = ?self.state,
                    transition = ?transition,
                    rejection = ?rejection,
                    "rejected turn transition"
                );
            }
        }
    }

    fn emit(&self, event: PresentationEvent) {
        if self.events_tx.send(event).is_err() {
            tracing::trace!("presentation receiver dropped; event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shinku_llm::testing::{ScriptStep, ScriptedBackend};
    use shinku_llm::{DEFAULT_SYSTEM_PROMPT, Role};

    use super::*;
    use crate::monitor::tests::SharedSource;

    const S1: SessionId = SessionId::new(1);
    const S2: SessionId = SessionId::new(2);

    struct Harness {
        source: SharedSource,
        backend: Arc<ScriptedBackend>,
        config: SharedConfig,
        handle: CoordinatorHandle,
        events: mpsc::UnboundedReceiver<PresentationEvent>,
        task: JoinHandle<()>,
    }

    impl Harness {
        async fn start(initial: &str) -> Self {
            let source = SharedSource::with_text(initial);
            let monitor = SourceMonitor::new(Box::new(source.clone()))
                .await
                .with_interval(Duration::from_millis(100));
            let backend = Arc::new(ScriptedBackend::new());
            let config: SharedConfig = Arc::new(ArcSwap::from_pointee(SessionConfig::default()));
            let (coordinator, handle, events) =
                SessionCoordinator::new(monitor, config.clone(), backend.clone());

            Self {
                source,
                backend,
                config,
                handle,
                events,
                task: coordinator.spawn(),
            }
        }

        async fn next_event(&mut self) -> PresentationEvent {
            tokio::time::timeout(Duration::from_secs(30), self.events.recv())
                .await
                .expect("timed out waiting for a presentation event")
                .expect("coordinator dropped the event channel")
        }

        /// Collects events up to and including the next terminal one.
        async fn events_until_settled(&mut self) -> Vec<PresentationEvent> {
            let mut events = Vec::new();
            loop {
                let event = self.next_event().await;
                let settled = matches!(
                    event,
                    PresentationEvent::Completed { .. } | PresentationEvent::Error { .. }
                );
                events.push(event);
                if settled {
                    return events;
                }
            }
        }

        async fn assert_quiet_for(&mut self, duration: Duration) {
            tokio::time::sleep(duration).await;
            assert!(
                self.events.try_recv().is_err(),
                "expected no further presentation events"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_turn_is_forwarded_and_committed() {
        let mut harness = Harness::start("").await;
        harness
            .backend
            .push_script(vec![ScriptStep::fragment("Hel"), ScriptStep::fragment("lo")]);

        harness.source.set("こんにちは");

        assert_eq!(
            harness.events_until_settled().await,
            vec![
                PresentationEvent::TurnStarted {
                    session_id: S1,
                    content: "こんにちは".to_string(),
                },
                PresentationEvent::Partial {
                    session_id: S1,
                    text: "Hel".to_string(),
                },
                PresentationEvent::Partial {
                    session_id: S1,
                    text: "lo".to_string(),
                },
                PresentationEvent::Completed {
                    session_id: S1,
                    text: "Hello".to_string(),
                },
            ]
        );

        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.state, TurnState::Idle);
        assert_eq!(
            status.history,
            vec![Message::user("こんにちは"), Message::assistant("Hello")]
        );

        let requests = harness.backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages, vec![Message::user("こんにちは")]);
        assert_eq!(requests[0].preamble.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
        assert!(requests[0].extra_fields.contains_key("top_p"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_change_cancels_the_active_session_before_starting_the_next() {
        let mut harness = Harness::start("").await;
        harness
            .backend
            .push_script(vec![ScriptStep::fragment("a1"), ScriptStep::Hang]);
        harness
            .backend
            .push_script(vec![ScriptStep::fragment("b"), ScriptStep::fragment("!")]);

        harness.source.set("A");
        assert_eq!(
            harness.next_event().await,
            PresentationEvent::TurnStarted {
                session_id: S1,
                content: "A".to_string(),
            }
        );
        assert_eq!(
            harness.next_event().await,
            PresentationEvent::Partial {
                session_id: S1,
                text: "a1".to_string(),
            }
        );

        harness.source.set("B");
        let events = harness.events_until_settled().await;

        assert_eq!(
            events.first(),
            Some(&PresentationEvent::TurnStarted {
                session_id: S2,
                content: "B".to_string(),
            })
        );
        assert!(events.iter().all(|event| event.session_id() == Some(S2)));
        assert_eq!(
            events.last(),
            Some(&PresentationEvent::Completed {
                session_id: S2,
                text: "b!".to_string(),
            })
        );
        assert_eq!(harness.backend.peak_open_streams(), 1);
        assert_eq!(harness.backend.open_streams(), 0);

        let status = harness.handle.status().await.unwrap();
        assert_eq!(
            status.history,
            vec![
                Message::user("A"),
                Message::user("B"),
                Message::assistant("b!"),
            ]
        );
        assert_eq!(
            harness.backend.requests()[1].messages,
            vec![Message::user("A"), Message::user("B")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_changes_never_overlap_sessions() {
        let mut harness = Harness::start("").await;
        for index in 0..5 {
            harness.backend.push_script(vec![
                ScriptStep::Delay(Duration::from_millis(30)),
                ScriptStep::fragment(format!("part {index}")),
                ScriptStep::Delay(Duration::from_millis(500)),
                ScriptStep::fragment(" done"),
            ]);
        }

        for index in 0..5 {
            harness.source.set(&format!("line {index}"));
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        let events = harness.events_until_settled().await;

        assert_eq!(
            events.last(),
            Some(&PresentationEvent::Completed {
                session_id: SessionId::new(5),
                text: "part 4 done".to_string(),
            })
        );
        assert_eq!(harness.backend.opened_total(), 5);
        assert_eq!(harness.backend.peak_open_streams(), 1);

        let history = harness.handle.status().await.unwrap().history;
        assert_eq!(history.len(), 6);
        assert!(history[..5].iter().all(|message| message.role() == Role::User));
        assert_eq!(history[5], Message::assistant("part 4 done"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_surfaced_once_and_keeps_the_user_message() {
        let mut harness = Harness::start("").await;
        harness.backend.push_script(vec![
            ScriptStep::fragment("par"),
            ScriptStep::fail("connection reset by peer"),
        ]);

        harness.source.set("X");
        let events = harness.events_until_settled().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last(),
            Some(PresentationEvent::Error { session_id, description })
                if *session_id == S1 && description.contains("connection reset by peer")
        ));
        harness.assert_quiet_for(Duration::from_secs(1)).await;

        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.state, TurnState::Idle);
        assert_eq!(status.history, vec![Message::user("X")]);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_turns_alternate_user_and_assistant() {
        let mut harness = Harness::start("").await;

        for index in 0..3 {
            harness
                .backend
                .push_script(vec![ScriptStep::fragment(format!("reply {index}"))]);
            harness.source.set(&format!("line {index}"));
            harness.events_until_settled().await;
        }

        let history = harness.handle.status().await.unwrap().history;
        assert_eq!(history.len(), 6);
        for (index, pair) in history.chunks(2).enumerate() {
            assert_eq!(pair[0], Message::user(format!("line {index}")));
            assert_eq!(pair[1], Message::assistant(format!("reply {index}")));
        }
        assert_eq!(
            harness.backend.requests()[2].messages.len(),
            5,
            "third request carries the two earlier exchanges plus the new prompt"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_history_mid_stream_cancels_and_does_not_retrigger() {
        let mut harness = Harness::start("").await;
        harness
            .backend
            .push_script(vec![ScriptStep::fragment("a1"), ScriptStep::Hang]);

        harness.source.set("A");
        harness.next_event().await;
        harness.next_event().await;

        harness.handle.clear_history().await.unwrap();

        assert_eq!(harness.next_event().await, PresentationEvent::HistoryCleared);
        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.state, TurnState::Idle);
        assert!(status.history.is_empty());
        assert_eq!(harness.backend.open_streams(), 0);

        harness.assert_quiet_for(Duration::from_secs(2)).await;
        assert_eq!(harness.backend.opened_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_history_when_idle_is_harmless() {
        let mut harness = Harness::start("seed").await;

        harness.handle.clear_history().await.unwrap();
        harness.handle.clear_history().await.unwrap();

        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.state, TurnState::Idle);
        assert!(status.history.is_empty());
        assert_eq!(harness.next_event().await, PresentationEvent::HistoryCleared);
        assert_eq!(harness.next_event().await, PresentationEvent::HistoryCleared);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_submissions_are_ignored() {
        let mut harness = Harness::start("").await;

        harness.handle.submit("  \n ").unwrap();

        let status = harness.handle.status().await.unwrap();
        assert_eq!(status.state, TurnState::Idle);
        assert!(status.history.is_empty());
        harness.assert_quiet_for(Duration::from_millis(500)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn config_updates_apply_to_the_next_turn_only() {
        let mut harness = Harness::start("").await;
        harness
            .backend
            .push_script(vec![ScriptStep::fragment("a1"), ScriptStep::Hang]);

        harness.handle.submit("A").unwrap();
        harness.next_event().await;
        harness.next_event().await;

        harness.config.store(Arc::new(SessionConfig {
            model_name: "other-model".to_string(),
            ..SessionConfig::default()
        }));
        harness.handle.submit("B").unwrap();
        harness.events_until_settled().await;

        let requests = harness.backend.requests();
        assert_eq!(requests[0].model_id, "default");
        assert_eq!(requests[1].model_id, "other-model");
    }

    #[tokio::test(start_paused = true)]
    async fn change_while_opening_supersedes_the_pending_session() {
        let mut harness = Harness::start("").await;
        harness.backend.push_open_hang();
        harness.backend.push_script(vec![ScriptStep::fragment("b")]);

        harness.source.set("A");
        assert_eq!(
            harness.next_event().await,
            PresentationEvent::TurnStarted {
                session_id: S1,
                content: "A".to_string(),
            }
        );
        assert_eq!(
            harness.handle.status().await.unwrap().state,
            TurnState::Starting(S1)
        );

        harness.source.set("B");
        let events = harness.events_until_settled().await;

        assert!(events.iter().all(|event| event.session_id() == Some(S2)));
        assert_eq!(
            events.last(),
            Some(&PresentationEvent::Completed {
                session_id: S2,
                text: "b".to_string(),
            })
        );
        assert_eq!(harness.backend.opened_total(), 1);
        assert_eq!(harness.backend.peak_open_streams(), 1);
        assert_eq!(
            harness.handle.status().await.unwrap().history,
            vec![
                Message::user("A"),
                Message::user("B"),
                Message::assistant("b"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_fragment_moves_the_turn_to_streaming() {
        let mut harness = Harness::start("").await;
        harness
            .backend
            .push_script(vec![ScriptStep::fragment("a1"), ScriptStep::Hang]);

        harness.handle.submit("A").unwrap();
        harness.next_event().await;
        harness.next_event().await;

        assert_eq!(
            harness.handle.status().await.unwrap().state,
            TurnState::Streaming(S1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_reads_do_not_stall_commands() {
        let mut harness = Harness::start("").await;
        harness.source.set_delay(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let started = tokio::time::Instant::now();
        harness.handle.clear_history().await.unwrap();
        harness.handle.submit("A").unwrap();

        assert_eq!(harness.next_event().await, PresentationEvent::HistoryCleared);
        assert_eq!(
            harness.next_event().await,
            PresentationEvent::TurnStarted {
                session_id: S1,
                content: "A".to_string(),
            }
        );
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_the_active_session() {
        let mut harness = Harness::start("").await;
        harness
            .backend
            .push_script(vec![ScriptStep::fragment("a1"), ScriptStep::Hang]);

        harness.handle.submit("A").unwrap();
        harness.next_event().await;
        harness.next_event().await;

        harness.handle.shutdown().await.unwrap();
        harness.task.await.unwrap();

        assert_eq!(harness.backend.open_streams(), 0);
        assert!(matches!(
            harness.handle.status().await,
            Err(CoordinatorError::Stopped { .. })
        ));
    }
}
