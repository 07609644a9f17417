use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::provider::{ChatBackend, ProviderConfig, StreamRequest};

/// Identifier for one streaming session. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Why a session ended without a completed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// The owner asked the session to stop.
    Cancelled,
    /// Transport, authentication, or backend-reported error.
    Backend(String),
}

impl SessionFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("session cancelled"),
            Self::Backend(description) => f.write_str(description),
        }
    }
}

/// Ordered output of one session: zero or more partials, then exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Partial(String),
    Completed(String),
    Failed(SessionFailure),
}

impl SessionEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Partial(_))
    }
}

/// One request/response exchange running on its own task.
///
/// The worker task owns the backend stream and reports through an ordered
/// channel. Dropping the session signals cancellation to the worker.
pub struct StreamingSession {
    id: SessionId,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl StreamingSession {
    /// Spawns the worker onto the current tokio runtime.
    pub fn start(
        id: SessionId,
        backend: Arc<dyn ChatBackend>,
        provider: ProviderConfig,
        request: StreamRequest,
    ) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tracing::debug!(
            session_id = %id,
            backend = backend.id(),
            model_id = %request.model_id,
            "starting streaming session"
        );
        let worker = tokio::spawn(run_worker(id, backend, provider, request, event_tx, cancel_rx));

        Self {
            id,
            events,
            cancel_tx: Some(cancel_tx),
            worker: Some(worker),
            finished: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns the next event in backend order, or `None` once the terminal event was delivered.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.finished {
            return None;
        }

        let event = self.events.recv().await.unwrap_or_else(|| {
            SessionEvent::Failed(SessionFailure::Backend(
                "session ended before a terminal event".to_string(),
            ))
        });
        if event.is_terminal() {
            self.finished = true;
        }
        Some(event)
    }

    /// Signals the worker to stop. Returns false if the signal was already sent
    /// or the worker is gone.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    /// Cancels the session and waits until its worker has released the backend stream.
    ///
    /// Events still queued are discarded, so nothing produced by this session is
    /// observed once cancellation is requested.
    pub async fn cancel_and_wait(mut self) -> SessionFailure {
        self.cancel();
        self.events.close();
        self.join_worker().await;
        tracing::debug!(session_id = %self.id, "streaming session cancelled");
        SessionFailure::Cancelled
    }

    /// Waits for the worker of a session whose terminal event was already consumed.
    pub async fn finish(mut self) {
        self.join_worker().await;
    }

    async fn join_worker(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if let Err(error) = worker.await {
            tracing::error!(session_id = %self.id, error = %error, "streaming worker panicked");
        }
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

async fn run_worker(
    id: SessionId,
    backend: Arc<dyn ChatBackend>,
    provider: ProviderConfig,
    request: StreamRequest,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let open = backend.open_stream(provider, request);
    let mut stream = tokio::select! {
        biased;
        _ = &mut cancel_rx => {
            let _ = event_tx.send(SessionEvent::Failed(SessionFailure::Cancelled));
            return;
        }
        opened = open => match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(session_id = %id, error = %error, "failed to open backend stream");
                let _ = event_tx.send(SessionEvent::Failed(SessionFailure::Backend(error.to_string())));
                return;
            }
        }
    };

    let mut buffer = String::new();
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                // Release the connection before reporting so the owner observes a closed stream.
                drop(stream);
                let _ = event_tx.send(SessionEvent::Failed(SessionFailure::Cancelled));
                return;
            }
            next_item = stream.next() => match next_item {
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    buffer.push_str(&fragment);
                    if event_tx.send(SessionEvent::Partial(fragment)).is_err() {
                        return;
                    }
                }
                Some(Err(error)) => {
                    tracing::warn!(session_id = %id, error = %error, "backend stream failed");
                    let _ = event_tx.send(SessionEvent::Failed(SessionFailure::Backend(error.to_string())));
                    return;
                }
                None => {
                    tracing::debug!(session_id = %id, length = buffer.len(), "backend stream completed");
                    let _ = event_tx.send(SessionEvent::Completed(buffer));
                    return;
                }
            }
        }
    }
}
