//! Source monitoring, conversation state, and turn coordination.

mod coordinator;
mod events;
mod history;
mod monitor;
mod source;
mod state;

pub use coordinator::{
    ActiveSessionSlot, CoordinatorError, CoordinatorHandle, CoordinatorStatus, SessionCoordinator,
    SharedConfig,
};
pub use events::PresentationEvent;
pub use history::ConversationHistory;
pub use monitor::{
    ChangePredicate, DEFAULT_POLL_INTERVAL, DEFAULT_READ_TIMEOUT, SourceChanged, SourceMonitor,
};
pub use source::{CommandSource, FileSource, ReadFuture, SourceError, TextSource};
pub use state::{TurnState, TurnTransition, TurnTransitionRejection, TurnTransitionResult};
