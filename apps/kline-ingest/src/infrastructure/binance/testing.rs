//! Scripted in-memory feed for connection and supervisor tests.
//!
//! Each symbol gets a queue of session scripts. A session learns its symbol
//! from the SUBSCRIBE frame and then plays the next script for it. Without a
//! script the session fails as soon as it is read. Queued handshake
//! refusals are returned by `connect` before any session opens.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::application::ports::{FeedSession, FeedTransport, Frame, TransportError};

/// One scripted step of a session.
#[derive(Debug, Clone)]
pub enum Step {
    /// Acknowledge the subscribe request.
    Ack,
    /// Refuse the subscribe request.
    Reject,
    /// Deliver a text frame.
    Frame(String),
    /// Deliver a server ping.
    Ping(Vec<u8>),
    /// End the stream.
    Drop,
    /// Panic while reading.
    Panic,
    /// Never deliver anything else.
    Hold,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<String, VecDeque<Vec<Step>>>,
    refusals: VecDeque<TransportError>,
    sent: Vec<Frame>,
    connects: usize,
}

/// In-memory [`FeedTransport`].
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue session scripts for a symbol.
    pub fn script(&self, symbol: &str, sessions: Vec<Vec<Step>>) {
        self.inner
            .lock()
            .scripts
            .entry(symbol.to_uppercase())
            .or_default()
            .extend(sessions);
    }

    /// Fail the next connects with these errors, in order.
    pub fn refuse_connects(&self, errors: Vec<TransportError>) {
        self.inner.lock().refusals.extend(errors);
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        self.inner.lock().sent.clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().connects
    }
}

#[async_trait]
impl FeedTransport for ScriptedTransport {
    async fn connect(&self, _url: &str) -> Result<Box<dyn FeedSession>, TransportError> {
        let mut inner = self.inner.lock();
        inner.connects += 1;
        if let Some(error) = inner.refusals.pop_front() {
            return Err(error);
        }
        Ok(Box::new(ScriptedSession {
            inner: Arc::clone(&self.inner),
            steps: None,
            request_id: 0,
        }))
    }
}

struct ScriptedSession {
    inner: Arc<Mutex<Inner>>,
    steps: Option<VecDeque<Step>>,
    request_id: u64,
}

#[async_trait]
impl FeedSession for ScriptedSession {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if self.steps.is_none()
            && let Frame::Text(text) = &frame
            && let Ok(request) = serde_json::from_str::<serde_json::Value>(text)
        {
            self.request_id = request["id"].as_u64().unwrap_or_default();
            let symbol = request["params"][0]
                .as_str()
                .and_then(|topic| topic.split('@').next())
                .unwrap_or_default()
                .to_uppercase();
            self.steps = inner
                .scripts
                .get_mut(&symbol)
                .and_then(VecDeque::pop_front)
                .map(VecDeque::from);
        }
        inner.sent.push(frame);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        let Some(steps) = self.steps.as_mut() else {
            return Some(Err(TransportError::Io("no script".to_string())));
        };
        match steps.pop_front() {
            Some(Step::Ack) => Some(Ok(Frame::Text(
                json!({"result": null, "id": self.request_id}).to_string(),
            ))),
            Some(Step::Reject) => Some(Ok(Frame::Text(
                json!({"error": {"code": 2, "msg": "Invalid request"}, "id": self.request_id})
                    .to_string(),
            ))),
            Some(Step::Frame(text)) => Some(Ok(Frame::Text(text))),
            Some(Step::Ping(payload)) => Some(Ok(Frame::Ping(payload))),
            Some(Step::Panic) => panic!("scripted panic"),
            Some(Step::Hold) => std::future::pending().await,
            Some(Step::Drop) | None => None,
        }
    }

    async fn close(&mut self) {}
}

/// Kline event JSON for a closed 1m candle.
pub fn kline_frame(symbol: &str, start_millis: i64, close: &str) -> String {
    json!({
        "e": "kline",
        "E": start_millis + 59_999,
        "s": symbol,
        "k": {
            "t": start_millis,
            "T": start_millis + 59_999,
            "s": symbol,
            "i": "1m",
            "o": close,
            "c": close,
            "h": close,
            "l": close,
            "v": "12.345",
            "n": 10,
            "x": true,
            "V": "6.789",
            "Q": "100.005"
        }
    })
    .to_string()
}
