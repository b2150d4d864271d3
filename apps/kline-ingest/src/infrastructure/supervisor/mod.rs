//! Stream Supervisor
//!
//! Owns one [`StreamConnection`] task per tracked symbol and fans their
//! messages into a single bounded channel. Each connection runs under its
//! own cancellation token and its own restart loop, so one symbol's outage
//! never blocks another.
//!
//! # Lifecycle
//!
//! ```text
//! track(symbols) ─▶ add_symbol ─▶ spawn supervise(symbol)
//!                                   │
//!                                   ├─ run() Ok        → exit
//!                                   ├─ run() Fatal     → symbol Down, exit
//!                                   └─ run() panicked  → restart after delay
//! stop() ─▶ cancel all ─▶ wait up to grace ─▶ abort stragglers
//! ```
//!
//! Every spawn gets a fresh generation. A fatal error is only recorded while
//! the symbol's slot still holds the generation that produced it, so a
//! removed or re-added symbol never picks up a stale failure.
//!
//! Removed symbols are announced as [`SeriesKey`]s on [`StreamSupervisor::removals`]
//! so the pipeline can drop their cleaner and EMA state.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_util::sync::CancellationToken;

use crate::application::ports::FeedTransport;
use crate::domain::candle::{SeriesKey, Symbol};
use crate::domain::feed::RawMessage;
use crate::infrastructure::binance::{
    ConnectionConfig, ConnectionStatus, FatalSubscriptionError, SharedState, StreamConnection,
    SubscriptionState,
};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Supervisor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// `track` called with no symbols.
    #[error("symbol set is empty")]
    EmptySymbolSet,

    /// Symbol already has a live connection.
    #[error("symbol {0} is already tracked")]
    AlreadyTracked(Symbol),

    /// Symbol is not tracked.
    #[error("symbol {0} is not tracked")]
    NotTracked(Symbol),

    /// The event stream was already handed out.
    #[error("event stream already taken")]
    EventsTaken,

    /// The removal stream was already handed out.
    #[error("removal stream already taken")]
    RemovalsTaken,

    /// Supervisor has been stopped.
    #[error("supervisor stopped")]
    Stopped,
}

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Settings shared by every connection.
    pub connection: ConnectionConfig,
    /// Fan-in channel capacity.
    pub channel_capacity: usize,
    /// Time `stop` waits for connections before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channel_capacity: 1024,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Outcome of [`StreamSupervisor::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopReport {
    /// Connections that exited within the grace period.
    pub finished: usize,
    /// Connections aborted after the grace period.
    pub aborted: usize,
}

// =============================================================================
// Supervisor
// =============================================================================

struct Tracked {
    generation: u64,
    state: SharedState,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type Connections = Arc<Mutex<BTreeMap<Symbol, Tracked>>>;
type Failures = Arc<RwLock<BTreeMap<Symbol, FatalSubscriptionError>>>;

/// One spawn's claim on its symbol's failure entry.
struct FailureSlot {
    symbol: Symbol,
    generation: u64,
    connections: Connections,
    failures: Failures,
}

impl FailureSlot {
    /// Store `fatal` if the symbol is still tracked by this generation.
    fn record(&self, fatal: FatalSubscriptionError) -> bool {
        let connections = self.connections.lock();
        let owned = connections
            .get(&self.symbol)
            .is_some_and(|tracked| tracked.generation == self.generation);
        if owned {
            self.failures.write().insert(self.symbol.clone(), fatal);
        } else {
            tracing::debug!(
                symbol = %self.symbol,
                generation = self.generation,
                "Dropping fatal error of a replaced connection"
            );
        }
        owned
    }
}

/// Fan-in owner of all symbol connections.
pub struct StreamSupervisor {
    config: SupervisorConfig,
    transport: Arc<dyn FeedTransport>,
    sender: Mutex<Option<mpsc::Sender<RawMessage>>>,
    receiver: Mutex<Option<mpsc::Receiver<RawMessage>>>,
    removed_tx: Mutex<Option<mpsc::UnboundedSender<SeriesKey>>>,
    removed_rx: Mutex<Option<mpsc::UnboundedReceiver<SeriesKey>>>,
    connections: Connections,
    failures: Failures,
    generations: AtomicU64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for StreamSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSupervisor")
            .field("symbols", &self.symbols())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StreamSupervisor {
    /// Create a supervisor. No connection is opened until symbols are tracked.
    #[must_use]
    pub fn new(config: SupervisorConfig, transport: Arc<dyn FeedTransport>) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        Self {
            config,
            transport,
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            removed_tx: Mutex::new(Some(removed_tx)),
            removed_rx: Mutex::new(Some(removed_rx)),
            connections: Arc::new(Mutex::new(BTreeMap::new())),
            failures: Arc::new(RwLock::new(BTreeMap::new())),
            generations: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Start tracking a set of symbols.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::EmptySymbolSet`] for an empty set, or the
    /// first error from [`Self::add_symbol`].
    pub fn track<I>(&self, symbols: I) -> Result<(), SupervisorError>
    where
        I: IntoIterator<Item = Symbol>,
    {
        let mut symbols = symbols.into_iter().peekable();
        if symbols.peek().is_none() {
            return Err(SupervisorError::EmptySymbolSet);
        }
        for symbol in symbols {
            match self.add_symbol(symbol) {
                Ok(()) | Err(SupervisorError::AlreadyTracked(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Open a connection for one more symbol. A symbol that went down can
    /// be added again.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyTracked`] if the symbol has a live
    /// connection, or [`SupervisorError::Stopped`] after [`Self::stop`].
    pub fn add_symbol(&self, symbol: Symbol) -> Result<(), SupervisorError> {
        let Some(tx) = self.sender.lock().clone() else {
            return Err(SupervisorError::Stopped);
        };

        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(&symbol)
            && existing.state.read().status != ConnectionStatus::Down
        {
            return Err(SupervisorError::AlreadyTracked(symbol));
        }
        if let Some(previous) = connections.remove(&symbol) {
            previous.cancel.cancel();
        }

        self.failures.write().remove(&symbol);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let state = Arc::new(RwLock::new(SubscriptionState::new(symbol.clone())));
        let cancel = self.cancel.child_token();
        let slot = FailureSlot {
            symbol: symbol.clone(),
            generation,
            connections: Arc::clone(&self.connections),
            failures: Arc::clone(&self.failures),
        };

        let task = tokio::spawn(supervise(
            self.config.connection.clone(),
            Arc::clone(&self.transport),
            tx,
            cancel.clone(),
            Arc::clone(&state),
            slot,
        ));

        tracing::info!(symbol = %symbol, generation, "Tracking symbol");
        connections.insert(
            symbol,
            Tracked {
                generation,
                state,
                cancel,
                task,
            },
        );
        Ok(())
    }

    /// Close a symbol's connection and discard its state. Other symbols are
    /// not affected. The symbol's series is announced on [`Self::removals`].
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotTracked`] for an unknown symbol.
    pub fn remove_symbol(&self, symbol: &Symbol) -> Result<(), SupervisorError> {
        let tracked = self
            .connections
            .lock()
            .remove(symbol)
            .ok_or_else(|| SupervisorError::NotTracked(symbol.clone()))?;
        tracked.cancel.cancel();
        self.failures.write().remove(symbol);

        let series = SeriesKey {
            symbol: symbol.clone(),
            interval: self.config.connection.interval,
        };
        if let Some(removed) = self.removed_tx.lock().as_ref() {
            let _ = removed.send(series);
        }
        tracing::info!(symbol = %symbol, "Stopped tracking symbol");
        Ok(())
    }

    /// Take the stream of series whose symbol was removed. Ends after
    /// [`Self::stop`].
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::RemovalsTaken`] on the second call.
    pub fn removals(&self) -> Result<UnboundedReceiverStream<SeriesKey>, SupervisorError> {
        self.removed_rx
            .lock()
            .take()
            .map(UnboundedReceiverStream::new)
            .ok_or(SupervisorError::RemovalsTaken)
    }

    /// Take the merged message stream. FIFO within a symbol, unordered
    /// across symbols. Ends after [`Self::stop`] once every connection has
    /// exited.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::EventsTaken`] on the second call.
    pub fn events(&self) -> Result<ReceiverStream<RawMessage>, SupervisorError> {
        self.receiver
            .lock()
            .take()
            .map(ReceiverStream::new)
            .ok_or(SupervisorError::EventsTaken)
    }

    /// Tracked symbols, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.connections.lock().keys().cloned().collect()
    }

    /// Point-in-time copy of every symbol's state, sorted by symbol.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SubscriptionState> {
        self.connections
            .lock()
            .values()
            .map(|tracked| tracked.state.read().clone())
            .collect()
    }

    /// Terminal errors of symbols currently down.
    #[must_use]
    pub fn failures(&self) -> Vec<FatalSubscriptionError> {
        self.failures.read().values().cloned().collect()
    }

    /// Whether [`Self::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel every connection and wait up to the grace period. Connections
    /// still running afterwards are aborted. Calling twice is harmless.
    pub async fn stop(&self) -> StopReport {
        self.cancel.cancel();
        drop(self.sender.lock().take());
        drop(self.removed_tx.lock().take());

        let tracked: Vec<Tracked> = std::mem::take(&mut *self.connections.lock())
            .into_values()
            .collect();
        if tracked.is_empty() {
            return StopReport::default();
        }

        let total = tracked.len();
        let aborts: Vec<_> = tracked.iter().map(|t| t.task.abort_handle()).collect();
        let joined = futures::future::join_all(tracked.into_iter().map(|t| t.task));

        let report = match tokio::time::timeout(self.config.shutdown_grace, joined).await {
            Ok(_) => StopReport {
                finished: total,
                aborted: 0,
            },
            Err(_) => {
                let aborted = aborts.iter().filter(|handle| !handle.is_finished()).count();
                for handle in &aborts {
                    handle.abort();
                }
                StopReport {
                    finished: total - aborted,
                    aborted,
                }
            }
        };

        tracing::info!(
            finished = report.finished,
            aborted = report.aborted,
            "Stream supervisor stopped"
        );
        report
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Restart loop around one symbol's connection.
async fn supervise(
    config: ConnectionConfig,
    transport: Arc<dyn FeedTransport>,
    output: mpsc::Sender<RawMessage>,
    cancel: CancellationToken,
    state: SharedState,
    slot: FailureSlot,
) {
    let symbol = slot.symbol.clone();
    let restart_delay = config.reconnect.initial_delay;

    loop {
        let connection = StreamConnection::new(
            symbol.clone(),
            config.clone(),
            Arc::clone(&transport),
            output.clone(),
            cancel.clone(),
        )
        .with_shared_state(Arc::clone(&state));

        match AssertUnwindSafe(connection.run()).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(fatal)) => {
                slot.record(fatal);
                return;
            }
            Err(_) => {
                tracing::error!(symbol = %symbol, "Stream connection panicked, restarting");
                metrics::record_reconnect(symbol.as_str());
                {
                    let mut state = state.write();
                    state.status = ConnectionStatus::Reconnecting;
                    state.consecutive_failures += 1;
                    state.current_backoff = restart_delay;
                }
                tokio::select! {
                    () = cancel.cancelled() => {
                        state.write().status = ConnectionStatus::Disconnected;
                        return;
                    }
                    () = tokio::time::sleep(restart_delay) => {}
                }
            }
        }
    }
}

/// Publish per-state connection counts as gauges.
pub fn publish_connection_gauges(states: &[SubscriptionState]) {
    for status in ConnectionStatus::all() {
        let count = states.iter().filter(|s| s.status == status).count();
        #[allow(clippy::cast_precision_loss)]
        metrics::set_connections(status.as_str(), count as f64);
    }
}

// =============================================================================
// Tests
// =============================================================================
