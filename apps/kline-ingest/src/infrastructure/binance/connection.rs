//! Stream Connection
//!
//! One feed connection for one symbol. The connection loop:
//!
//! 1. connects through a [`FeedTransport`],
//! 2. sends `SUBSCRIBE <symbol>@kline_<interval>` and waits for the ack,
//! 3. forwards every data frame as a [`RawMessage`] on a bounded channel,
//! 4. on failure waits an exponential backoff and starts over.
//!
//! The loop is an explicit state machine over [`ConnectionStatus`]; there is
//! no recursion on reconnect. Repeated subscription rejections, or running
//! out of reconnect attempts, end the loop with a
//! [`FatalSubscriptionError`] and leave the symbol [`ConnectionStatus::Down`].
//!
//! Backpressure: forwarding awaits channel capacity. A slow pipeline stalls
//! the receive loop instead of dropping frames.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, JsonCodec};
use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use super::messages::{FeedReply, SubscriptionRequest};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FeedSession, FeedTransport, Frame, TransportError};
use crate::domain::candle::{Interval, Symbol};
use crate::domain::feed::RawMessage;
use crate::infrastructure::metrics;

/// Default Binance raw-stream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://stream.binance.com:9443/ws";

// =============================================================================
// Error Types
// =============================================================================

/// Terminal failure of a symbol's connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalSubscriptionError {
    /// The exchange refused the subscription too many times in a row.
    #[error("subscription for {symbol} rejected {rejections} times: {reason}")]
    Rejected {
        /// Affected symbol.
        symbol: Symbol,
        /// Consecutive rejections.
        rejections: u32,
        /// Last rejection reason.
        reason: String,
    },

    /// Transport kept failing past the reconnect ceiling.
    #[error("gave up on {symbol} after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted {
        /// Affected symbol.
        symbol: Symbol,
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        last_error: String,
    },
}

impl FatalSubscriptionError {
    /// Symbol that went down.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        match self {
            Self::Rejected { symbol, .. } | Self::RetriesExhausted { symbol, .. } => symbol,
        }
    }

    /// Short label used for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "rejected",
            Self::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

/// Why one connected session ended.
#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("subscription rejected: {0}")]
    Rejected(String),

    #[error("no traffic for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl SessionError {
    fn rejection_reason(&self) -> Option<String> {
        match self {
            Self::Rejected(reason) => Some(reason.clone()),
            Self::Transport(e) if !e.is_transient() => Some(e.to_string()),
            _ => None,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transport(e) => e.retry_after(),
            _ => None,
        }
    }
}

// =============================================================================
// Subscription State
// =============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not connected (initial, or closed on request).
    Disconnected,
    /// Opening the transport or waiting for the subscription ack.
    Connecting,
    /// Ack received, data flowing.
    Subscribed,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Permanently down after a fatal error.
    Down,
}

impl ConnectionStatus {
    /// Every status, for gauges.
    #[must_use]
    pub const fn all() -> [Self; 5] {
        [
            Self::Disconnected,
            Self::Connecting,
            Self::Subscribed,
            Self::Reconnecting,
            Self::Down,
        ]
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
            Self::Down => "down",
        }
    }
}

/// Per-symbol connection state, readable as a snapshot from outside the
/// connection task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionState {
    /// Tracked symbol.
    pub symbol: Symbol,
    /// Current lifecycle status.
    pub status: ConnectionStatus,
    /// Receive time of the last data frame.
    pub last_received: Option<DateTime<Utc>>,
    /// Failures since the last stable connection.
    pub consecutive_failures: u32,
    /// Backoff currently being waited (zero when connected).
    #[serde(rename = "current_backoff_ms", serialize_with = "duration_millis")]
    pub current_backoff: Duration,
}

impl SubscriptionState {
    /// Fresh state for a newly tracked symbol.
    #[must_use]
    pub const fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            status: ConnectionStatus::Disconnected,
            last_received: None,
            consecutive_failures: 0,
            current_backoff: Duration::ZERO,
        }
    }
}

fn duration_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Shared handle to a connection's state.
pub type SharedState = Arc<RwLock<SubscriptionState>>;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for a stream connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Feed endpoint.
    pub url: String,
    /// Kline interval to subscribe to.
    pub interval: Interval,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
    /// Liveness checks.
    pub heartbeat: HeartbeatConfig,
    /// Consecutive rejections before the symbol is marked down.
    pub max_rejections: u32,
}

impl ConnectionConfig {
    /// Defaults for the given endpoint and interval.
    #[must_use]
    pub fn new(url: impl Into<String>, interval: Interval) -> Self {
        Self {
            url: url.into(),
            interval,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            max_rejections: 3,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_URL, Interval::OneMinute)
    }
}

// =============================================================================
// Stream Connection
// =============================================================================

/// Whether the receive loop keeps going after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Connection loop for one symbol.
pub struct StreamConnection {
    symbol: Symbol,
    config: ConnectionConfig,
    transport: Arc<dyn FeedTransport>,
    codec: JsonCodec,
    output: mpsc::Sender<RawMessage>,
    cancel: CancellationToken,
    state: SharedState,
    next_request_id: u64,
    rejections: u32,
    subscribed_at: Option<Instant>,
}

impl StreamConnection {
    /// Create a connection that forwards into `output`.
    #[must_use]
    pub fn new(
        symbol: Symbol,
        config: ConnectionConfig,
        transport: Arc<dyn FeedTransport>,
        output: mpsc::Sender<RawMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(RwLock::new(SubscriptionState::new(symbol.clone())));
        Self {
            symbol,
            config,
            transport,
            codec: JsonCodec::new(),
            output,
            cancel,
            state,
            next_request_id: 1,
            rejections: 0,
            subscribed_at: None,
        }
    }

    /// Spawn a connection with its own output channel.
    ///
    /// Returns the handle and the symbol's message stream.
    #[must_use]
    pub fn open(
        symbol: Symbol,
        config: ConnectionConfig,
        transport: Arc<dyn FeedTransport>,
        capacity: usize,
    ) -> (ConnectionHandle, ReceiverStream<RawMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let connection = Self::new(symbol, config, transport, tx, cancel.clone());
        let state = connection.state();
        let task = tokio::spawn(connection.run());
        (ConnectionHandle::new(state, cancel, task), ReceiverStream::new(rx))
    }

    /// Report into an existing state handle (kept across restarts).
    #[must_use]
    pub fn with_shared_state(mut self, state: SharedState) -> Self {
        self.state = state;
        self
    }

    /// Shared state handle.
    #[must_use]
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// Run until cancelled, the output channel closes, or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`FatalSubscriptionError`] when the subscription is rejected
    /// `max_rejections` times in a row or reconnect attempts run out.
    pub async fn run(mut self) -> Result<(), FatalSubscriptionError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(symbol = %self.symbol, "Stream connection cancelled");
                self.set_status(ConnectionStatus::Disconnected);
                return Ok(());
            }

            self.set_status(ConnectionStatus::Connecting);
            self.subscribed_at = None;

            let error = match self.connect_and_run().await {
                Ok(()) => {
                    tracing::info!(symbol = %self.symbol, "Stream connection closed");
                    self.set_status(ConnectionStatus::Disconnected);
                    return Ok(());
                }
                Err(e) => e,
            };

            if self
                .subscribed_at
                .is_some_and(|at| at.elapsed() >= policy.stable_after())
            {
                policy.reset();
                self.state.write().consecutive_failures = 0;
            }

            if let Some(reason) = error.rejection_reason() {
                self.rejections += 1;
                tracing::warn!(
                    symbol = %self.symbol,
                    rejections = self.rejections,
                    reason = %reason,
                    "Subscription rejected"
                );
                if self.rejections >= self.config.max_rejections.max(1) {
                    return Err(self.go_down(FatalSubscriptionError::Rejected {
                        symbol: self.symbol.clone(),
                        rejections: self.rejections,
                        reason,
                    }));
                }
            } else {
                tracing::warn!(symbol = %self.symbol, error = %error, "Stream connection error");
            }

            let Some(backoff) = policy.next_delay() else {
                return Err(self.go_down(FatalSubscriptionError::RetriesExhausted {
                    symbol: self.symbol.clone(),
                    attempts: policy.attempt_count(),
                    last_error: error.to_string(),
                }));
            };
            let delay = error.retry_after().map_or(backoff, |wait| wait.max(backoff));

            let attempt = policy.attempt_count();
            {
                let mut state = self.state.write();
                state.status = ConnectionStatus::Reconnecting;
                state.consecutive_failures += 1;
                state.current_backoff = delay;
            }
            metrics::record_reconnect(self.symbol.as_str());
            tracing::info!(
                symbol = %self.symbol,
                attempt,
                delay_ms = delay.as_millis(),
                "Reconnecting to kline stream"
            );

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!(symbol = %self.symbol, "Cancelled during reconnect delay");
                    self.set_status(ConnectionStatus::Disconnected);
                    return Ok(());
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Connect, subscribe and pump frames until error or cancellation.
    async fn connect_and_run(&mut self) -> Result<(), SessionError> {
        tracing::info!(symbol = %self.symbol, url = %self.config.url, "Connecting to kline stream");

        let cancel = self.cancel.clone();
        let mut session = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            session = self.transport.connect(&self.config.url) => session?,
        };

        let result = self.pump(session.as_mut()).await;
        session.close().await;
        result
    }

    async fn pump(&mut self, session: &mut dyn FeedSession) -> Result<(), SessionError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let topic = self.symbol.kline_topic(self.config.interval);
        let request = SubscriptionRequest::subscribe(vec![topic], request_id);
        tracing::debug!(
            symbol = %self.symbol,
            id = request_id,
            topics = ?request.params,
            "Sending subscribe request"
        );
        session.send(Frame::Text(self.codec.encode(&request)?)).await?;

        let mut heartbeat = Heartbeat::new(self.config.heartbeat.clone());
        let period = heartbeat.ping_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    match heartbeat.on_tick() {
                        HeartbeatEvent::SendPing => session.send(Frame::Ping(Vec::new())).await?,
                        HeartbeatEvent::Timeout => {
                            return Err(SessionError::HeartbeatTimeout(heartbeat.silence()));
                        }
                    }
                }
                frame = session.next_frame() => {
                    let frame = match frame {
                        Some(frame) => frame?,
                        None => return Err(TransportError::Closed.into()),
                    };
                    heartbeat.record_activity();

                    match frame {
                        Frame::Text(text) => {
                            if self.handle_text(&text, request_id).await? == Flow::Stop {
                                return Ok(());
                            }
                        }
                        Frame::Ping(payload) => session.send(Frame::Pong(payload)).await?,
                        Frame::Pong(_) => {}
                        Frame::Close => {
                            tracing::info!(symbol = %self.symbol, "Server sent close frame");
                            return Err(TransportError::Closed.into());
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(&mut self, text: &str, request_id: u64) -> Result<Flow, SessionError> {
        let reply = match self.codec.decode(text) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(symbol = %self.symbol, error = %e, "Ignoring undecodable frame");
                return Ok(Flow::Continue);
            }
        };

        match reply {
            FeedReply::Ack { id } if id == request_id => {
                tracing::info!(symbol = %self.symbol, id, "Subscribed to kline stream");
                self.rejections = 0;
                self.subscribed_at = Some(Instant::now());
                let mut state = self.state.write();
                state.status = ConnectionStatus::Subscribed;
                state.current_backoff = Duration::ZERO;
                Ok(Flow::Continue)
            }
            FeedReply::Ack { id } => {
                tracing::debug!(symbol = %self.symbol, id, "Ignoring ack for stale request");
                Ok(Flow::Continue)
            }
            FeedReply::Error { id, error } => {
                tracing::error!(
                    symbol = %self.symbol,
                    ?id,
                    code = error.code,
                    msg = %error.msg,
                    "Feed error"
                );
                Err(SessionError::Rejected(format!("{} (code {})", error.msg, error.code)))
            }
            FeedReply::Data(payload) => {
                let message = RawMessage::new(self.symbol.clone(), payload);
                self.state.write().last_received = Some(message.received_at);
                metrics::record_message_received(self.symbol.as_str());

                let cancel = self.cancel.clone();
                tokio::select! {
                    () = cancel.cancelled() => Ok(Flow::Stop),
                    sent = self.output.send(message) => {
                        if sent.is_err() {
                            tracing::debug!(symbol = %self.symbol, "Output channel closed");
                            return Ok(Flow::Stop);
                        }
                        Ok(Flow::Continue)
                    }
                }
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.write().status = status;
    }

    fn go_down(&self, error: FatalSubscriptionError) -> FatalSubscriptionError {
        tracing::error!(symbol = %self.symbol, error = %error, "Symbol marked down");
        metrics::record_fatal_subscription(self.symbol.as_str(), error.reason());
        let mut state = self.state.write();
        state.status = ConnectionStatus::Down;
        state.current_backoff = Duration::ZERO;
        error
    }
}

// =============================================================================
// Connection Handle
// =============================================================================

/// Owner's handle to a spawned connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    state: SharedState,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), FatalSubscriptionError>>>,
}

impl ConnectionHandle {
    /// Wrap a spawned connection task.
    #[must_use]
    pub const fn new(
        state: SharedState,
        cancel: CancellationToken,
        task: JoinHandle<Result<(), FatalSubscriptionError>>,
    ) -> Self {
        Self {
            state,
            cancel,
            task: Some(task),
        }
    }

    /// Snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SubscriptionState {
        self.state.read().clone()
    }

    /// Ask the connection to release its transport and exit. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the connection task to finish.
    ///
    /// Returns `Ok(())` for a clean exit, for a task already joined, and for
    /// a task that was aborted or panicked.
    ///
    /// # Errors
    ///
    /// Returns the connection's [`FatalSubscriptionError`].
    pub async fn join(&mut self) -> Result<(), FatalSubscriptionError> {
        match self.task.take() {
            Some(task) => task.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::binance::testing::{ScriptedTransport, Step, kline_frame};
    use futures::StreamExt;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://feed.test".to_string(),
            interval: Interval::OneMinute,
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts: 0,
                stable_after: Duration::from_secs(30),
            },
            heartbeat: HeartbeatConfig::default(),
            max_rejections: 2,
        }
    }

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT").unwrap()
    }

    #[tokio::test]
    async fn subscribes_then_forwards_data() {
        let transport = ScriptedTransport::new();
        transport.script(
            "BTCUSDT",
            vec![vec![
                Step::Ack,
                Step::Frame(kline_frame("BTCUSDT", 60_000, "100")),
                Step::Frame(kline_frame("BTCUSDT", 120_000, "102")),
                Step::Hold,
            ]],
        );

        let (mut handle, mut stream) =
            StreamConnection::open(btc(), fast_config(), transport.clone(), 8);

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.symbol, btc());
        assert_eq!(first.payload["k"]["c"], "100");
        assert_eq!(second.payload["k"]["c"], "102");

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Subscribed);
        assert!(snapshot.last_received.is_some());

        let sent = transport.sent_text();
        assert_eq!(
            sent[0],
            r#"{"method":"SUBSCRIBE","params":["btcusdt@kline_1m"],"id":1}"#
        );

        handle.close();
        handle.close();
        assert_eq!(handle.join().await, Ok(()));
        assert_eq!(handle.snapshot().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn reconnects_after_drop_with_new_request_id() {
        let transport = ScriptedTransport::new();
        transport.script(
            "BTCUSDT",
            vec![
                vec![Step::Ack, Step::Frame(kline_frame("BTCUSDT", 60_000, "100")), Step::Drop],
                vec![Step::Ack, Step::Frame(kline_frame("BTCUSDT", 120_000, "101")), Step::Hold],
            ],
        );

        let (mut handle, mut stream) =
            StreamConnection::open(btc(), fast_config(), transport.clone(), 8);

        assert_eq!(stream.next().await.unwrap().payload["k"]["c"], "100");
        assert_eq!(stream.next().await.unwrap().payload["k"]["c"], "101");

        let sent = transport.sent_text();
        assert!(sent[0].ends_with(r#""id":1}"#));
        assert!(sent[1].ends_with(r#""id":2}"#));
        assert_eq!(handle.snapshot().consecutive_failures, 1);

        handle.close();
        assert_eq!(handle.join().await, Ok(()));
    }

    #[tokio::test]
    async fn repeated_rejection_is_fatal() {
        let transport = ScriptedTransport::new();
        transport.script("BTCUSDT", vec![vec![Step::Reject], vec![Step::Reject]]);

        let (mut handle, _stream) = StreamConnection::open(btc(), fast_config(), transport, 8);

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, FatalSubscriptionError::Rejected { rejections: 2, .. }));
        assert_eq!(err.symbol(), &btc());
        assert_eq!(handle.snapshot().status, ConnectionStatus::Down);
    }

    #[tokio::test]
    async fn throttled_handshakes_back_off_without_counting_as_rejections() {
        let transport = ScriptedTransport::new();
        let throttled = TransportError::Throttled {
            status: 429,
            retry_after: None,
        };
        transport.refuse_connects(vec![throttled.clone(), throttled.clone(), throttled]);
        transport.script(
            "BTCUSDT",
            vec![vec![Step::Ack, Step::Frame(kline_frame("BTCUSDT", 60_000, "100")), Step::Hold]],
        );

        let (mut handle, mut stream) =
            StreamConnection::open(btc(), fast_config(), transport.clone(), 8);

        assert_eq!(stream.next().await.unwrap().payload["k"]["c"], "100");
        assert_eq!(transport.connects(), 4);
        assert_eq!(handle.snapshot().status, ConnectionStatus::Subscribed);

        handle.close();
        assert_eq!(handle.join().await, Ok(()));
    }

    #[tokio::test]
    async fn retry_after_stretches_the_backoff() {
        let transport = ScriptedTransport::new();
        let wait = Duration::from_millis(150);
        transport.refuse_connects(vec![TransportError::Throttled {
            status: 429,
            retry_after: Some(wait),
        }]);
        transport.script(
            "BTCUSDT",
            vec![vec![Step::Ack, Step::Frame(kline_frame("BTCUSDT", 60_000, "100")), Step::Hold]],
        );

        let started = Instant::now();
        let (mut handle, mut stream) = StreamConnection::open(btc(), fast_config(), transport, 8);

        let _ = stream.next().await.unwrap();
        assert!(started.elapsed() >= wait);

        handle.close();
        assert_eq!(handle.join().await, Ok(()));
    }

    #[tokio::test]
    async fn refused_handshake_counts_as_rejection() {
        let transport = ScriptedTransport::new();
        let forbidden = TransportError::Rejected {
            status: 403,
            reason: "Forbidden".to_string(),
        };
        transport.refuse_connects(vec![forbidden.clone(), forbidden]);

        let (mut handle, _stream) = StreamConnection::open(btc(), fast_config(), transport, 8);

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, FatalSubscriptionError::Rejected { rejections: 2, .. }));
    }

    #[tokio::test]
    async fn retries_exhausted_is_fatal() {
        let transport = ScriptedTransport::new();
        let mut config = fast_config();
        config.reconnect.max_attempts = 2;

        let (mut handle, _stream) = StreamConnection::open(btc(), config, transport, 8);

        let err = handle.join().await.unwrap_err();
        assert!(matches!(
            err,
            FatalSubscriptionError::RetriesExhausted { attempts: 2, .. }
        ));
        assert_eq!(handle.snapshot().status, ConnectionStatus::Down);
    }

    #[tokio::test]
    async fn answers_server_ping() {
        let transport = ScriptedTransport::new();
        transport.script(
            "BTCUSDT",
            vec![vec![
                Step::Ack,
                Step::Ping(vec![7]),
                Step::Frame(kline_frame("BTCUSDT", 60_000, "1")),
                Step::Hold,
            ]],
        );

        let (mut handle, mut stream) =
            StreamConnection::open(btc(), fast_config(), transport.clone(), 8);
        let _ = stream.next().await.unwrap();

        assert!(transport.sent_frames().contains(&Frame::Pong(vec![7])));
        handle.close();
        let _ = handle.join().await;
    }

    #[tokio::test]
    async fn stops_when_receiver_dropped() {
        let transport = ScriptedTransport::new();
        transport.script(
            "BTCUSDT",
            vec![vec![Step::Ack, Step::Frame(kline_frame("BTCUSDT", 60_000, "1")), Step::Hold]],
        );

        let (mut handle, stream) = StreamConnection::open(btc(), fast_config(), transport, 8);
        drop(stream);

        assert_eq!(handle.join().await, Ok(()));
    }

    #[test]
    fn state_serializes_backoff_in_millis() {
        let mut state = SubscriptionState::new(btc());
        state.current_backoff = Duration::from_millis(1_500);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["current_backoff_ms"], 1_500);
        assert_eq!(json["status"], "disconnected");
    }
}
