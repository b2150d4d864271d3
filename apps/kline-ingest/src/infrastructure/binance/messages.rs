//! Binance WebSocket Message Types
//!
//! Wire format for the kline stream control protocol.
//!
//! # Control Messages
//!
//! ```json
//! {"method": "SUBSCRIBE", "params": ["btcusdt@kline_1m"], "id": 1}
//! {"result": null, "id": 1}
//! {"error": {"code": 2, "msg": "Invalid request: unknown variable"}, "id": 1}
//! ```
//!
//! # Kline Event
//!
//! ```json
//! {
//!   "e": "kline", "E": 1672515782136, "s": "BNBBTC",
//!   "k": {
//!     "t": 1672515780000, "T": 1672515839999, "s": "BNBBTC", "i": "1m",
//!     "o": "0.0010", "c": "0.0020", "h": "0.0025", "l": "0.0015",
//!     "v": "1000", "n": 100, "x": false, "q": "1.0000",
//!     "V": "500", "Q": "0.500"
//!   }
//! }
//! ```
//!
//! # References
//!
//! - [WebSocket Streams][streams]
//!
//! [streams]: https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams

use serde::{Deserialize, Serialize};

/// Stream control method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMethod {
    /// Start receiving topics.
    Subscribe,
}

/// Outbound subscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Control method.
    pub method: StreamMethod,
    /// Topic names, e.g. `btcusdt@kline_1m`.
    pub params: Vec<String>,
    /// Request id echoed in the reply.
    pub id: u64,
}

impl SubscriptionRequest {
    /// Subscribe request for the given topics.
    #[must_use]
    pub const fn subscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: StreamMethod::Subscribe,
            params,
            id,
        }
    }
}

/// Error body of a rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Exchange error code.
    pub code: i64,
    /// Error description.
    pub msg: String,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedReply {
    /// Request acknowledged.
    Ack {
        /// Id of the acknowledged request.
        id: u64,
    },
    /// Request refused.
    Error {
        /// Id of the refused request, when echoed.
        id: Option<u64>,
        /// Error details.
        error: ErrorBody,
    },
    /// Market data event.
    Data(serde_json::Value),
}
