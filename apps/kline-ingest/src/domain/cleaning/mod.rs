//! Deduplication and Cleaning
//!
//! Stateful filter enforcing the uniqueness and validity invariants of the
//! record stream before enrichment.
//!
//! # Rules
//!
//! A record is rejected when:
//! - its `(symbol, timestamp, interval)` key was already admitted (the feed
//!   redelivers candles after a reconnect);
//! - any of open/high/low/close/volume is not strictly positive;
//! - its timestamp is older than the newest admitted timestamp of its series.
//!
//! Prices are [`Decimal`]s, which cannot hold NaN or infinity; non-finite
//! numeric strings are rejected by the normalizer before they get here.
//!
//! # Memory
//!
//! [`SeenKeys`] keeps at most `retention` distinct timestamps per series and
//! evicts the oldest first. Because admitted timestamps never go backwards,
//! an evicted key can only come back as an out-of-order record, which is
//! still rejected.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::candle::{CandleKey, CandleRecord, SeriesKey};

/// Default number of distinct timestamps retained per series.
pub const DEFAULT_RETENTION: usize = 1_000;

// =============================================================================
// Errors
// =============================================================================

/// Why a record was refused by the cleaner.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Exact duplicate of an admitted record.
    #[error("duplicate candle {0}")]
    Duplicate(CandleKey),

    /// A required field is zero or negative.
    #[error("{field} must be positive, got {value}")]
    NonPositive {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: Decimal,
    },

    /// Timestamp is older than the newest admitted record of the series.
    #[error("out-of-order candle {key}: newest admitted is {newest}")]
    OutOfOrder {
        /// Rejected key.
        key: CandleKey,
        /// Newest admitted timestamp for the series.
        newest: DateTime<Utc>,
    },
}

impl ValidationError {
    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Duplicate(_) => "duplicate",
            Self::NonPositive { .. } => "non_positive",
            Self::OutOfOrder { .. } => "out_of_order",
        }
    }
}

// =============================================================================
// Seen Keys
// =============================================================================

/// Bounded set of admitted candle keys.
#[derive(Debug)]
pub struct SeenKeys {
    retention: usize,
    series: HashMap<SeriesKey, BTreeSet<DateTime<Utc>>>,
}

impl SeenKeys {
    /// Create an empty set retaining `retention` timestamps per series.
    ///
    /// A retention of zero is treated as one.
    #[must_use]
    pub fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            series: HashMap::new(),
        }
    }

    /// Whether a key has been admitted and is still retained.
    #[must_use]
    pub fn contains(&self, key: &CandleKey) -> bool {
        let series = SeriesKey {
            symbol: key.symbol.clone(),
            interval: key.interval,
        };
        self.series
            .get(&series)
            .is_some_and(|timestamps| timestamps.contains(&key.timestamp))
    }

    /// Newest admitted timestamp of a series.
    #[must_use]
    pub fn newest(&self, series: &SeriesKey) -> Option<DateTime<Utc>> {
        self.series
            .get(series)
            .and_then(|timestamps| timestamps.last().copied())
    }

    /// Record a key. Returns the number of evicted timestamps.
    pub fn insert(&mut self, key: &CandleKey) -> usize {
        let series = SeriesKey {
            symbol: key.symbol.clone(),
            interval: key.interval,
        };
        let timestamps = self.series.entry(series).or_default();
        timestamps.insert(key.timestamp);

        let mut evicted = 0;
        while timestamps.len() > self.retention {
            timestamps.pop_first();
            evicted += 1;
        }
        evicted
    }

    /// Drop all state for a series.
    pub fn forget(&mut self, series: &SeriesKey) {
        self.series.remove(series);
    }

    /// Total retained keys across all series.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.values().map(BTreeSet::len).sum()
    }

    /// Whether no keys are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.values().all(BTreeSet::is_empty)
    }
}

impl Default for SeenKeys {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

// =============================================================================
// Deduplicator / Cleaner
// =============================================================================

/// Admits each candle at most once and only when its values are valid.
///
/// Must be driven in arrival order per symbol by a single owner.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: SeenKeys,
}

impl Deduplicator {
    /// Create a cleaner retaining `retention` timestamps per series.
    #[must_use]
    pub fn new(retention: usize) -> Self {
        Self {
            seen: SeenKeys::new(retention),
        }
    }

    /// Check a record against every rule without recording it.
    ///
    /// # Errors
    ///
    /// Returns the first rule the record violates.
    pub fn validate(&self, record: &CandleRecord) -> Result<(), ValidationError> {
        let key = record.key();
        if self.seen.contains(&key) {
            return Err(ValidationError::Duplicate(key));
        }

        if let Some((field, value)) = record
            .required_positive()
            .into_iter()
            .find(|(_, value)| *value <= Decimal::ZERO)
        {
            return Err(ValidationError::NonPositive { field, value });
        }

        if let Some(newest) = self.seen.newest(&record.series())
            && record.timestamp < newest
        {
            return Err(ValidationError::OutOfOrder { key, newest });
        }

        Ok(())
    }

    /// Validate a record and, on success, record its key and hand it back.
    ///
    /// # Errors
    ///
    /// Returns the violated rule; the record is dropped.
    pub fn check(&mut self, record: CandleRecord) -> Result<CandleRecord, ValidationError> {
        self.validate(&record)?;
        let evicted = self.seen.insert(&record.key());
        if evicted > 0 {
            tracing::trace!(series = %record.series(), evicted, "Evicted seen keys");
        }
        Ok(record)
    }

    /// Admit a record, returning `None` when it is rejected.
    pub fn admit(&mut self, record: CandleRecord) -> Option<CandleRecord> {
        match self.check(record) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(reason = e.reason(), error = %e, "Candle rejected");
                None
            }
        }
    }

    /// Drop all state for a series (symbol removed from tracking).
    pub fn forget(&mut self, series: &SeriesKey) {
        self.seen.forget(series);
    }

    /// Retained keys.
    #[must_use]
    pub const fn seen(&self) -> &SeenKeys {
        &self.seen
    }
}

// =============================================================================
// Tests
// =============================================================================
