//! Chat-completion plumbing: message model, per-request configuration, backend
//! seam, and the cancellable streaming session.

use std::sync::Arc;

mod config;
mod message;
mod provider;
mod rig_adapter;
mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{
    CustomParamError, CustomParams, CustomValue, DEFAULT_API_KEY, DEFAULT_ENDPOINT,
    DEFAULT_MODEL_NAME, DEFAULT_SYSTEM_PROMPT, FREQUENCY_PENALTY_RANGE, GenerationParams,
    MAX_TOKENS_RANGE, PRESENCE_PENALTY_RANGE, SessionConfig, TEMPERATURE_RANGE, TOP_P_RANGE,
};
pub use message::{Message, Role};
pub use provider::{
    BoxFuture, ChatBackend, FragmentStream, ProviderConfig, ProviderError, ProviderResult,
    StreamRequest,
};
pub use rig_adapter::{RIG_OPENAI_BACKEND_ID, RigBackend};
pub use session::{SessionEvent, SessionFailure, SessionId, StreamingSession};

pub fn create_backend() -> Arc<dyn ChatBackend> {
    Arc::new(RigBackend::new())
}
