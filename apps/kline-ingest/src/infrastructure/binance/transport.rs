//! WebSocket Transport
//!
//! [`FeedTransport`] over `tokio-tungstenite` with rustls. Handshake refusals
//! with a 4xx status are reported as [`TransportError::Rejected`], except
//! 408 and 429 which become [`TransportError::Throttled`] and are retried
//! after at least the server's `Retry-After`. Every other failure is
//! transient.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode, header};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{FeedSession, FeedTransport, Frame, TransportError};

/// Production WebSocket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a new transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FeedTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedSession>, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(handshake_error)?;
        Ok(Box::new(WebSocketSession {
            stream,
            closed: false,
        }))
    }
}

fn handshake_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) if is_throttle(response.status()) => {
            TransportError::Throttled {
                status: response.status().as_u16(),
                retry_after: retry_after(response.headers()),
            }
        }
        tungstenite::Error::Http(response) if response.status().is_client_error() => {
            let status = response.status();
            TransportError::Rejected {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("client error").to_string(),
            }
        }
        other => TransportError::Connect(other.to_string()),
    }
}

fn is_throttle(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

/// `Retry-After` in delay-seconds form. HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn io_error(error: &tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closed
        }
        other => TransportError::Io(other.to_string()),
    }
}

struct WebSocketSession {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

#[async_trait]
impl FeedSession for WebSocketSession {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping(payload) => Message::Ping(payload.into()),
            Frame::Pong(payload) => Message::Pong(payload.into()),
            Frame::Close => Message::Close(None),
        };
        self.stream.send(message).await.map_err(|e| io_error(&e))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(io_error(&e))),
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text.as_str().to_owned()),
                Message::Ping(payload) => Frame::Ping(payload.to_vec()),
                Message::Pong(payload) => Frame::Pong(payload.to_vec()),
                Message::Close(_) => Frame::Close,
                Message::Binary(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_closed_maps_to_closed() {
        assert_eq!(io_error(&tungstenite::Error::ConnectionClosed), TransportError::Closed);
        assert!(io_error(&tungstenite::Error::ConnectionClosed).is_transient());
    }

    #[test]
    fn handshake_client_error_is_rejection() {
        let response = tungstenite::http::Response::builder()
            .status(403)
            .body(None)
            .unwrap();
        let error = handshake_error(tungstenite::Error::Http(response.into()));
        assert_eq!(
            error,
            TransportError::Rejected {
                status: 403,
                reason: "Forbidden".to_string()
            }
        );
        assert!(!error.is_transient());
    }

    #[test]
    fn handshake_rate_limit_is_retried_after_server_delay() {
        let response = tungstenite::http::Response::builder()
            .status(429)
            .header("Retry-After", "7")
            .body(None)
            .unwrap();
        let error = handshake_error(tungstenite::Error::Http(response.into()));
        assert_eq!(
            error,
            TransportError::Throttled {
                status: 429,
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(error.is_transient());
        assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn handshake_timeout_is_transient_without_retry_after() {
        let response = tungstenite::http::Response::builder()
            .status(408)
            .body(None)
            .unwrap();
        let error = handshake_error(tungstenite::Error::Http(response.into()));
        assert!(error.is_transient());
        assert_eq!(error.retry_after(), None);
    }

    #[test]
    fn http_date_retry_after_is_ignored() {
        let response = tungstenite::http::Response::builder()
            .status(429)
            .header("Retry-After", "Wed, 21 Oct 2026 07:28:00 GMT")
            .body(None)
            .unwrap();
        let error = handshake_error(tungstenite::Error::Http(response.into()));
        assert!(error.is_transient());
        assert_eq!(error.retry_after(), None);
    }

    #[test]
    fn handshake_server_error_is_transient() {
        let response = tungstenite::http::Response::builder()
            .status(503)
            .body(None)
            .unwrap();
        let error = handshake_error(tungstenite::Error::Http(response.into()));
        assert!(matches!(error, TransportError::Connect(_)));
        assert!(error.is_transient());
    }

    #[tokio::test]
    async fn unreachable_host_is_connect_error() {
        let result = WebSocketTransport::new().connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
