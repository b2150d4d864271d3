//! Historical Kline Client
//!
//! Paginated backfill from `GET /api/v3/klines`. Each page holds at most
//! `limit` rows ordered by open time; the next page starts one millisecond
//! after the last open time seen. Paging stops on a short or empty page or
//! once the window end is passed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::codec::Normalizer;
use crate::domain::candle::{CandleRecord, Interval, Symbol};
use crate::domain::feed::ParseError;

/// Default Binance klines endpoint.
pub const DEFAULT_REST_URL: &str = "https://api.binance.com/api/v3/klines";

/// Largest page the endpoint serves.
pub const MAX_PAGE_LIMIT: u16 = 1000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Historical fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// Request could not be sent or the body could not be read.
    #[error("klines request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status.
    #[error("klines request returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// Response body is not an array of rows.
    #[error("unexpected klines response: {0}")]
    UnexpectedBody(String),

    /// A row could not be normalized.
    #[error("malformed kline row: {0}")]
    Parse(#[from] ParseError),
}

/// REST client for historical klines.
#[derive(Debug, Clone)]
pub struct HistoricalClient {
    http: reqwest::Client,
    url: String,
    limit: u16,
    normalizer: Normalizer,
}

impl HistoricalClient {
    /// Create a client for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, HistoryError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: url.into(),
            limit: MAX_PAGE_LIMIT,
            normalizer: Normalizer::new(),
        })
    }

    /// Override the page size (clamped to `1..=1000`).
    #[must_use]
    pub fn with_page_limit(mut self, limit: u16) -> Self {
        self.limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    /// Fetch every candle opening in `[start, end]`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] on transport failure, a non-2xx status, or a
    /// malformed row. Rows fetched before the failure are discarded.
    pub async fn fetch(
        &self,
        symbol: &Symbol,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CandleRecord>, HistoryError> {
        let end_millis = end.timestamp_millis();
        let mut cursor = start.timestamp_millis();
        let mut records = Vec::new();

        while cursor <= end_millis {
            let rows = self.fetch_page(symbol, interval, cursor, end_millis).await?;
            let as_of = Utc::now();
            let page_len = rows.len();

            let mut last_open = None;
            for row in &rows {
                let record = self
                    .normalizer
                    .normalize_rest_row(symbol, interval, row, as_of)?;
                last_open = Some(record.timestamp.timestamp_millis());
                records.push(record);
            }

            tracing::debug!(
                symbol = %symbol,
                interval = %interval,
                start_ms = cursor,
                rows = page_len,
                "Fetched klines page"
            );

            match last_open {
                Some(last) if page_len >= usize::from(self.limit) && last >= cursor => {
                    cursor = last + 1;
                }
                _ => break,
            }
        }

        tracing::info!(
            symbol = %symbol,
            interval = %interval,
            count = records.len(),
            "Historical fetch complete"
        );
        Ok(records)
    }

    async fn fetch_page(
        &self,
        symbol: &Symbol,
        interval: Interval,
        start_millis: i64,
        end_millis: i64,
    ) -> Result<Vec<Value>, HistoryError> {
        let response = self
            .http
            .get(&self.url)
            .query(&[
                ("symbol", symbol.as_str().to_string()),
                ("interval", interval.as_str().to_string()),
                ("startTime", start_millis.to_string()),
                ("endTime", end_millis.to_string()),
                ("limit", self.limit.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        match response.json::<Value>().await? {
            Value::Array(rows) => Ok(rows),
            other => Err(HistoryError::UnexpectedBody(other.to_string())),
        }
    }
}
