//! In-process backend that replays scripted responses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::provider::{
    BoxFuture, ChatBackend, FragmentStream, ProviderConfig, ProviderError, ProviderResult,
    StreamRequest,
};

pub const SCRIPTED_BACKEND_ID: &str = "scripted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Fragment(String),
    /// Waits before the next step, on tokio time.
    Delay(Duration),
    /// Yields a transport error and ends the stream.
    Fail(String),
    /// Never yields again.
    Hang,
}

impl ScriptStep {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment(text.into())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

#[derive(Debug, Clone)]
enum Script {
    Steps(Vec<ScriptStep>),
    OpenError(String),
    /// Opening waits for `delay` first, or forever when it is `None`.
    SlowOpen {
        delay: Option<Duration>,
        steps: Vec<ScriptStep>,
    },
}

#[derive(Default)]
struct StreamCounters {
    open: AtomicUsize,
    peak: AtomicUsize,
    opened_total: AtomicUsize,
}

/// Decrements the open-stream count when the stream that owns it is dropped.
struct OpenGuard(Arc<StreamCounters>);

impl OpenGuard {
    fn acquire(counters: Arc<StreamCounters>) -> Self {
        let open = counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(open, Ordering::SeqCst);
        counters.opened_total.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend whose responses are queued ahead of time, one script per request.
///
/// Requests beyond the queued scripts complete immediately with no content.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
    counters: Arc<StreamCounters>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        lock(&self.scripts).push_back(Script::Steps(steps));
    }

    pub fn push_open_error(&self, message: impl Into<String>) {
        lock(&self.scripts).push_back(Script::OpenError(message.into()));
    }

    /// The next request takes `delay` to open, then replays `steps`.
    pub fn push_delayed_open(&self, delay: Duration, steps: Vec<ScriptStep>) {
        lock(&self.scripts).push_back(Script::SlowOpen {
            delay: Some(delay),
            steps,
        });
    }

    /// The next request never finishes opening.
    pub fn push_open_hang(&self) {
        lock(&self.scripts).push_back(Script::SlowOpen {
            delay: None,
            steps: Vec::new(),
        });
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<StreamRequest> {
        lock(&self.requests).clone()
    }

    /// Streams currently open (not yet finished or dropped).
    pub fn open_streams(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Highest number of streams that were ever open at the same time.
    pub fn peak_open_streams(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn opened_total(&self) -> usize {
        self.counters.opened_total.load(Ordering::SeqCst)
    }
}

impl ChatBackend for ScriptedBackend {
    fn id(&self) -> &str {
        SCRIPTED_BACKEND_ID
    }

    fn open_stream(
        &self,
        _provider: ProviderConfig,
        request: StreamRequest,
    ) -> BoxFuture<'static, ProviderResult<FragmentStream>> {
        lock(&self.requests).push(request);
        let script = lock(&self.scripts)
            .pop_front()
            .unwrap_or(Script::Steps(Vec::new()));
        let counters = self.counters.clone();

        Box::pin(async move {
            let steps = match script {
                Script::Steps(steps) => VecDeque::from(steps),
                Script::OpenError(message) => {
                    return Err(ProviderError::Backend {
                        stage: "scripted-open",
                        message,
                    });
                }
                Script::SlowOpen { delay, steps } => {
                    match delay {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => std::future::pending::<()>().await,
                    }
                    VecDeque::from(steps)
                }
            };
            let guard = OpenGuard::acquire(counters);
            let stream: FragmentStream =
                Box::pin(futures::stream::unfold((steps, guard), replay_step));
            Ok(stream)
        })
    }
}

async fn replay_step(
    (mut steps, guard): (VecDeque<ScriptStep>, OpenGuard),
) -> Option<(ProviderResult<String>, (VecDeque<ScriptStep>, OpenGuard))> {
    loop {
        match steps.pop_front()? {
            ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
            ScriptStep::Fragment(text) => return Some((Ok(text), (steps, guard))),
            ScriptStep::Fail(message) => {
                steps.clear();
                let error = ProviderError::Backend {
                    stage: "scripted-stream",
                    message,
                };
                return Some((Err(error), (steps, guard)));
            }
            ScriptStep::Hang => std::future::pending::<()>().await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
