use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::source::TextSource;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Decides whether `current` differs from the last observed `previous` text.
pub type ChangePredicate = Box<dyn Fn(&str, &str) -> bool + Send>;

/// Emitted when the source holds new, non-blank text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChanged {
    pub content: String,
}

/// Polls a [`TextSource`] and reports changes against the last observed snapshot.
///
/// Each read runs on its own task bounded by the read timeout; a read that
/// fails or times out counts as empty.
pub struct SourceMonitor {
    source: Arc<Mutex<Box<dyn TextSource>>>,
    snapshot: String,
    interval: Duration,
    read_timeout: Duration,
    is_changed: ChangePredicate,
    ticker: Option<Interval>,
    in_flight: Option<JoinHandle<String>>,
    resync: bool,
}

impl SourceMonitor {
    /// Takes the source's current value as the initial snapshot so whatever is
    /// already there never triggers a turn.
    pub async fn new(source: Box<dyn TextSource>) -> Self {
        let mut monitor = Self {
            source: Arc::new(Mutex::new(source)),
            snapshot: String::new(),
            interval: DEFAULT_POLL_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            is_changed: Box::new(|previous: &str, current: &str| previous != current),
            ticker: None,
            in_flight: None,
            resync: true,
        };
        monitor.poll().await;
        monitor
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self.ticker = None;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_change_predicate(
        mut self,
        is_changed: impl Fn(&str, &str) -> bool + Send + 'static,
    ) -> Self {
        self.is_changed = Box::new(is_changed);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// Reads the source once. Blank reads, including failed ones, never replace
    /// the snapshot.
    pub async fn poll(&mut self) -> Option<SourceChanged> {
        let current = self.read_or_empty().await;
        if std::mem::take(&mut self.resync) {
            self.snapshot = current;
            return None;
        }
        if current.trim().is_empty() || !(self.is_changed)(&self.snapshot, &current) {
            return None;
        }

        self.snapshot.clone_from(&current);
        Some(SourceChanged { content: current })
    }

    /// Waits for the next poll tick and resolves once the source has changed.
    ///
    /// Cancel-safe: a read interrupted by dropping this future is picked up by
    /// the next call instead of being started again.
    pub async fn next_change(&mut self) -> SourceChanged {
        loop {
            if self.in_flight.is_none() {
                self.tick().await;
            }
            if let Some(change) = self.poll().await {
                return change;
            }
        }
    }

    /// Treats whatever the next read returns as already seen.
    pub fn reset_snapshot(&mut self) {
        self.resync = true;
    }

    async fn tick(&mut self) {
        let period = self.interval.max(MIN_POLL_INTERVAL);
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
    }

    async fn read_or_empty(&mut self) -> String {
        let source = self.source.clone();
        let read_timeout = self.read_timeout;
        let read = self
            .in_flight
            .get_or_insert_with(|| tokio::spawn(read_with_timeout(source, read_timeout)));
        let joined = read.await;
        self.in_flight = None;

        match joined {
            Ok(content) => content,
            Err(error) => {
                tracing::error!(error = %error, "source read task failed; treating as empty");
                String::new()
            }
        }
    }
}

impl Drop for SourceMonitor {
    fn drop(&mut self) {
        if let Some(read) = self.in_flight.take() {
            read.abort();
        }
    }
}

async fn read_with_timeout(
    source: Arc<Mutex<Box<dyn TextSource>>>,
    read_timeout: Duration,
) -> String {
    let mut source = source.lock().await;
    match tokio::time::timeout(read_timeout, source.read()).await {
        Ok(Ok(content)) => content,
        Ok(Err(error)) => {
            tracing::debug!(error = %error, "source read failed; treating as empty");
            String::new()
        }
        Err(_) => {
            tracing::debug!(
                timeout_ms = read_timeout.as_millis() as u64,
                "source read timed out; treating as empty"
            );
            String::new()
        }
    }
}
