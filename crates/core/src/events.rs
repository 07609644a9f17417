use shinku_llm::{SessionEvent, SessionFailure, SessionId};

/// Output of the coordinator, consumed by whatever renders the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationEvent {
    /// A new turn began; previous output should be cleared.
    TurnStarted {
        session_id: SessionId,
        content: String,
    },
    /// Incremental output for the active turn, in arrival order.
    Partial { session_id: SessionId, text: String },
    /// The active turn finished with its full response.
    Completed { session_id: SessionId, text: String },
    /// The active turn failed. Cancellations are never reported here.
    Error {
        session_id: SessionId,
        description: String,
    },
    HistoryCleared,
}

impl PresentationEvent {
    /// Maps one session event into presentation language.
    ///
    /// Cancellation returns `None` because superseding a turn is not a fault.
    pub fn from_session_event(session_id: SessionId, event: SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::Partial(text) => Some(Self::Partial { session_id, text }),
            SessionEvent::Completed(text) => Some(Self::Completed { session_id, text }),
            SessionEvent::Failed(SessionFailure::Cancelled) => None,
            SessionEvent::Failed(SessionFailure::Backend(description)) => Some(Self::Error {
                session_id,
                description,
            }),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::TurnStarted { session_id, .. }
            | Self::Partial { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Error { session_id, .. } => Some(*session_id),
            Self::HistoryCleared => None,
        }
    }
}
