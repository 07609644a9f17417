use shinku_llm::SessionId;

/// Coordinator lifecycle for one turn.
///
/// Completed, failed, and cancelled turns all settle back to `Idle`; the
/// terminal kind is carried by the transition, not kept as a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Starting(SessionId),
    Streaming(SessionId),
}

/// State transition input for the turn lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransition {
    Start(SessionId),
    Stream(SessionId),
    Complete(SessionId),
    Fail(SessionId),
    Cancel(SessionId),
    ResetToIdle,
}

/// Rejection reason for illegal turn transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnTransitionRejection {
    AlreadyActive {
        active: SessionId,
        attempted: SessionId,
    },
    NoActiveSession,
    NotStarting {
        attempted: SessionId,
    },
    SessionMismatch {
        active: SessionId,
        attempted: SessionId,
    },
}

pub type TurnTransitionResult = Result<TurnState, TurnTransitionRejection>;

impl TurnState {
    /// Returns the session that owns the turn, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        match self {
            Self::Starting(id) | Self::Streaming(id) => Some(*id),
            Self::Idle => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Applies one transition deterministically.
    ///
    /// A new turn may only start from `Idle`: the previous session must be
    /// settled first. Terminal transitions must name the active session.
    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::Start(id) => self.apply_start(id),
            TurnTransition::Stream(id) => self.apply_stream(id),
            TurnTransition::Complete(id) | TurnTransition::Fail(id) | TurnTransition::Cancel(id) => {
                self.apply_settle(id)
            }
            TurnTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, id: SessionId) -> TurnTransitionResult {
        match self {
            Self::Idle => Ok(Self::Starting(id)),
            Self::Starting(active) | Self::Streaming(active) => {
                Err(TurnTransitionRejection::AlreadyActive {
                    active: *active,
                    attempted: id,
                })
            }
        }
    }

    fn apply_stream(&self, id: SessionId) -> TurnTransitionResult {
        match self {
            Self::Starting(active) if *active == id => Ok(Self::Streaming(id)),
            Self::Starting(active) => Err(TurnTransitionRejection::SessionMismatch {
                active: *active,
                attempted: id,
            }),
            Self::Idle | Self::Streaming(_) => {
                Err(TurnTransitionRejection::NotStarting { attempted: id })
            }
        }
    }

    fn apply_settle(&self, id: SessionId) -> TurnTransitionResult {
        match self {
            Self::Starting(active) | Self::Streaming(active) if *active == id => Ok(Self::Idle),
            Self::Starting(active) | Self::Streaming(active) => {
                Err(TurnTransitionRejection::SessionMismatch {
                    active: *active,
                    attempted: id,
                })
            }
            Self::Idle => Err(TurnTransitionRejection::NoActiveSession),
        }
    }
}
