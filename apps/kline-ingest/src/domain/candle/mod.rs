//! Candle Domain Types
//!
//! Canonical OHLCV record shapes shared by every pipeline stage.
//! These types are codec-agnostic: the Binance wire format lives in the
//! infrastructure layer and is converted into [`CandleRecord`] by the
//! normalizer.
//!
//! # Identity
//!
//! A record is identified by `(symbol, timestamp, interval)` ([`CandleKey`]).
//! A series of records for one symbol at one interval is a [`SeriesKey`];
//! cleaner and enricher state are both keyed by series.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised when constructing domain identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    /// Symbol is empty or contains characters other than ASCII letters/digits.
    #[error("invalid symbol: {0:?}")]
    InvalidSymbol(String),

    /// Interval is not one of the exchange's kline intervals.
    #[error("invalid interval: {0:?}")]
    InvalidInterval(String),
}

// =============================================================================
// Symbol
// =============================================================================

/// Exchange ticker, always stored uppercase (e.g. `BTCUSDT`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Parse and normalize a ticker.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidSymbol`] when the input is empty or
    /// contains anything other than ASCII alphanumerics.
    pub fn new(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::InvalidSymbol(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// The uppercase ticker.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Kline stream topic for this symbol, e.g. `btcusdt@kline_1m`.
    #[must_use]
    pub fn kline_topic(&self, interval: Interval) -> String {
        format!("{}@kline_{}", self.0.to_ascii_lowercase(), interval.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Symbol {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Symbol {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Symbol> for String {
    fn from(symbol: Symbol) -> Self {
        symbol.0
    }
}

// =============================================================================
// Interval
// =============================================================================

/// Kline interval as named by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    /// 1 second.
    OneSecond,
    /// 1 minute.
    OneMinute,
    /// 3 minutes.
    ThreeMinutes,
    /// 5 minutes.
    FiveMinutes,
    /// 15 minutes.
    FifteenMinutes,
    /// 30 minutes.
    ThirtyMinutes,
    /// 1 hour.
    OneHour,
    /// 2 hours.
    TwoHours,
    /// 4 hours.
    FourHours,
    /// 6 hours.
    SixHours,
    /// 8 hours.
    EightHours,
    /// 12 hours.
    TwelveHours,
    /// 1 day.
    OneDay,
    /// 3 days.
    ThreeDays,
    /// 1 week.
    OneWeek,
    /// 1 month.
    OneMonth,
}

impl Interval {
    /// Get all intervals in ascending order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::OneSecond,
            Self::OneMinute,
            Self::ThreeMinutes,
            Self::FiveMinutes,
            Self::FifteenMinutes,
            Self::ThirtyMinutes,
            Self::OneHour,
            Self::TwoHours,
            Self::FourHours,
            Self::SixHours,
            Self::EightHours,
            Self::TwelveHours,
            Self::OneDay,
            Self::ThreeDays,
            Self::OneWeek,
            Self::OneMonth,
        ]
    }

    /// Exchange name of the interval (`"1m"`, `"1h"`, `"1M"`, ...).
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OneSecond => "1s",
            Self::OneMinute => "1m",
            Self::ThreeMinutes => "3m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::TwoHours => "2h",
            Self::FourHours => "4h",
            Self::SixHours => "6h",
            Self::EightHours => "8h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::ThreeDays => "3d",
            Self::OneWeek => "1w",
            Self::OneMonth => "1M",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = DomainError;

    // Case matters: "1m" is a minute, "1M" is a month.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::all()
            .iter()
            .copied()
            .find(|interval| interval.as_str() == trimmed)
            .ok_or_else(|| DomainError::InvalidInterval(s.to_string()))
    }
}

impl TryFrom<String> for Interval {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.as_str().to_string()
    }
}

// =============================================================================
// Keys
// =============================================================================

/// Unique identity of a candle within a stream session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CandleKey {
    /// Exchange ticker.
    pub symbol: Symbol,
    /// Candle start time.
    pub timestamp: DateTime<Utc>,
    /// Candle interval.
    pub interval: Interval,
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}@{}",
            self.symbol,
            self.interval,
            self.timestamp.timestamp_millis()
        )
    }
}

/// One candle series: a symbol at a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Exchange ticker.
    pub symbol: Symbol,
    /// Candle interval.
    pub interval: Interval,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// =============================================================================
// Candle Record
// =============================================================================

/// Canonical OHLCV record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleRecord {
    /// Exchange ticker.
    pub symbol: Symbol,
    /// Start of the candle interval (UTC).
    pub timestamp: DateTime<Utc>,
    /// Candle interval.
    pub interval: Interval,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Base asset volume.
    pub volume: Decimal,
    /// Number of trades in the candle.
    pub trade_count: u64,
    /// Taker buy base asset volume (absent on some feed variants).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_buy_base: Option<Decimal>,
    /// Taker buy quote asset volume (absent on some feed variants).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taker_buy_quote: Option<Decimal>,
    /// Whether the candle interval has closed (final update).
    pub closed: bool,
}

impl CandleRecord {
    /// Identity of this record.
    #[must_use]
    pub fn key(&self) -> CandleKey {
        CandleKey {
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            interval: self.interval,
        }
    }

    /// Series this record belongs to.
    #[must_use]
    pub fn series(&self) -> SeriesKey {
        SeriesKey {
            symbol: self.symbol.clone(),
            interval: self.interval,
        }
    }

    /// Fields that must be strictly positive for the record to be admitted.
    #[must_use]
    pub const fn required_positive(&self) -> [(&'static str, Decimal); 5] {
        [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ]
    }
}

// =============================================================================
// Enriched Candle Record
// =============================================================================

/// Candle record plus the EMA value for each configured period.
///
/// Created by the enricher and consumed by the anonymizer and sinks. The
/// record is never mutated in place; transforms consume it and build a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedCandleRecord {
    #[serde(flatten)]
    candle: CandleRecord,
    emas: BTreeMap<u32, Decimal>,
}

impl EnrichedCandleRecord {
    /// Build an enriched record.
    #[must_use]
    pub const fn new(candle: CandleRecord, emas: BTreeMap<u32, Decimal>) -> Self {
        Self { candle, emas }
    }

    /// The underlying candle.
    #[must_use]
    pub const fn candle(&self) -> &CandleRecord {
        &self.candle
    }

    /// EMA values keyed by period.
    #[must_use]
    pub const fn emas(&self) -> &BTreeMap<u32, Decimal> {
        &self.emas
    }

    /// EMA value for a single period.
    #[must_use]
    pub fn ema(&self, period: u32) -> Option<Decimal> {
        self.emas.get(&period).copied()
    }

    /// Split into candle and EMA map.
    #[must_use]
    pub fn into_parts(self) -> (CandleRecord, BTreeMap<u32, Decimal>) {
        (self.candle, self.emas)
    }
}

// =============================================================================
// Tests
// =============================================================================
