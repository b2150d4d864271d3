//! Binance Kline Adapters
//!
//! - **Stream**: one WebSocket subscription per symbol with heartbeat and
//!   reconnect (JSON codec)
//! - **REST**: paginated historical klines for backfill
//! - **Normalizer**: both payload shapes to [`CandleRecord`](crate::domain::candle::CandleRecord)

pub mod codec;
pub mod connection;
pub mod heartbeat;
pub mod history;
pub mod messages;
pub mod reconnect;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{CodecError, JsonCodec, Normalizer};
pub use connection::{
    ConnectionConfig, ConnectionHandle, ConnectionStatus, DEFAULT_STREAM_URL,
    FatalSubscriptionError, SharedState, StreamConnection, SubscriptionState,
};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
pub use history::{DEFAULT_REST_URL, HistoricalClient, HistoryError};
pub use messages::{ErrorBody, FeedReply, StreamMethod, SubscriptionRequest};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use transport::WebSocketTransport;
