//! EMA Enrichment
//!
//! Streaming exponential moving averages per candle series.
//!
//! For period `p` the smoothing factor is `α = 2 / (p + 1)`. The first close
//! of a series seeds the average; every later close updates it:
//!
//! ```text
//! EMA_t = α · close_t + (1 − α) · EMA_{t−1}
//! ```
//!
//! The enricher must see exactly one record per candle, in timestamp order.
//! The cleaner upstream guarantees that; calling [`Enricher::update`] twice
//! for the same candle would fold its close into the average twice.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;

use crate::domain::candle::{CandleRecord, EnrichedCandleRecord, SeriesKey};

/// EMA periods used when none are configured.
pub const DEFAULT_EMA_PERIODS: [u32; 4] = [20, 50, 100, 200];

/// Enricher construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnrichmentError {
    /// EMA period must be at least one.
    #[error("EMA period must be at least 1")]
    ZeroPeriod,
}

// =============================================================================
// EMA State
// =============================================================================

/// Running EMA for one period of one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmaState {
    period: u32,
    alpha: Decimal,
    value: Option<Decimal>,
}

impl EmaState {
    /// Create an uninitialized EMA.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichmentError::ZeroPeriod`] for a zero period.
    pub fn new(period: u32) -> Result<Self, EnrichmentError> {
        if period == 0 {
            return Err(EnrichmentError::ZeroPeriod);
        }
        Ok(Self {
            period,
            alpha: smoothing_factor(period),
            value: None,
        })
    }

    /// Look-back period.
    #[must_use]
    pub const fn period(&self) -> u32 {
        self.period
    }

    /// Smoothing factor `2 / (period + 1)`.
    #[must_use]
    pub const fn alpha(&self) -> Decimal {
        self.alpha
    }

    /// Current value, `None` before the first close.
    #[must_use]
    pub const fn value(&self) -> Option<Decimal> {
        self.value
    }

    /// Fold one close into the average and return the new value.
    pub fn update(&mut self, close: Decimal) -> Decimal {
        let next = match self.value {
            None => close,
            Some(prev) => self.alpha * close + (Decimal::ONE - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }
}

/// `2 / (period + 1)`.
#[must_use]
pub fn smoothing_factor(period: u32) -> Decimal {
    Decimal::TWO / Decimal::from(u64::from(period) + 1)
}

// =============================================================================
// Enricher
// =============================================================================

/// Maintains one [`EmaState`] per (series, period).
#[derive(Debug)]
pub struct Enricher {
    periods: Vec<u32>,
    states: HashMap<SeriesKey, Vec<EmaState>>,
}

impl Enricher {
    /// Create an enricher for the given periods (duplicates collapse).
    ///
    /// # Errors
    ///
    /// Returns [`EnrichmentError::ZeroPeriod`] if any period is zero.
    pub fn new(periods: &[u32]) -> Result<Self, EnrichmentError> {
        if periods.contains(&0) {
            return Err(EnrichmentError::ZeroPeriod);
        }
        let mut periods = periods.to_vec();
        periods.sort_unstable();
        periods.dedup();
        Ok(Self {
            periods,
            states: HashMap::new(),
        })
    }

    /// Configured periods, ascending.
    #[must_use]
    pub fn periods(&self) -> &[u32] {
        &self.periods
    }

    /// Fold a record into its series and attach the current EMA values.
    pub fn update(&mut self, record: CandleRecord) -> EnrichedCandleRecord {
        let periods = &self.periods;
        let states = self.states.entry(record.series()).or_insert_with(|| {
            periods
                .iter()
                .map(|&period| EmaState {
                    period,
                    alpha: smoothing_factor(period),
                    value: None,
                })
                .collect()
        });

        let emas: BTreeMap<u32, Decimal> = states
            .iter_mut()
            .map(|state| (state.period, state.update(record.close)))
            .collect();

        EnrichedCandleRecord::new(record, emas)
    }

    /// Current EMA of a series for one period.
    #[must_use]
    pub fn ema(&self, series: &SeriesKey, period: u32) -> Option<Decimal> {
        self.states
            .get(series)?
            .iter()
            .find(|state| state.period == period)
            .and_then(EmaState::value)
    }

    /// Drop all state for a series (symbol removed from tracking).
    pub fn forget(&mut self, series: &SeriesKey) {
        self.states.remove(series);
    }

    /// Number of series with live state.
    #[must_use]
    pub fn series_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for Enricher {
    fn default() -> Self {
        Self {
            periods: DEFAULT_EMA_PERIODS.to_vec(),
            states: HashMap::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::candle::tests::candle;
    use proptest::prelude::*;

    /// Reference sequential EMA over a slice of closes.
    fn reference_ema(closes: &[Decimal], period: u32) -> Vec<Decimal> {
        let alpha = Decimal::TWO / Decimal::from(period + 1);
        let mut out = Vec::with_capacity(closes.len());
        let mut prev: Option<Decimal> = None;
        for &close in closes {
            let next = prev.map_or(close, |p| alpha * close + (Decimal::ONE - alpha) * p);
            out.push(next);
            prev = Some(next);
        }
        out
    }

    #[test]
    fn zero_period_is_rejected() {
        assert_eq!(EmaState::new(0), Err(EnrichmentError::ZeroPeriod));
        assert!(Enricher::new(&[20, 0]).is_err());
    }

    #[test]
    fn periods_are_sorted_and_deduplicated() {
        let enricher = Enricher::new(&[50, 20, 50]).unwrap();
        assert_eq!(enricher.periods(), &[20, 50]);
    }

    #[test]
    fn first_close_seeds_the_average() {
        let mut enricher = Enricher::default();
        let enriched = enricher.update(candle("BTCUSDT", 60_000, 100));
        for period in DEFAULT_EMA_PERIODS {
            assert_eq!(enriched.ema(period), Some(Decimal::from(100)));
        }
    }

    #[test]
    fn known_sequence_for_period_20() {
        let mut enricher = Enricher::new(&[20]).unwrap();
        let values: Vec<Decimal> = [100, 102, 101]
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let ts = i64::try_from(i + 1).unwrap() * 60_000;
                enricher.update(candle("BTCUSDT", ts, close)).ema(20).unwrap()
            })
            .collect();

        let tolerance = Decimal::new(1, 9);
        assert_eq!(values[0], Decimal::from(100));
        assert!((values[1] - Decimal::new(100_190_476_190, 9)).abs() < tolerance);
        assert!((values[2] - Decimal::new(100_267_573_696, 9)).abs() < tolerance);
    }

    #[test]
    fn series_are_independent() {
        let mut enricher = Enricher::new(&[2]).unwrap();
        enricher.update(candle("BTCUSDT", 60_000, 100));
        enricher.update(candle("BTCUSDT", 120_000, 400));
        let eth = enricher.update(candle("ETHUSDT", 60_000, 10));

        assert_eq!(eth.ema(2), Some(Decimal::from(10)));
        assert_eq!(enricher.series_count(), 2);
        // alpha = 2/3: 2/3 * 400 + 1/3 * 100 = 300
        let btc = candle("BTCUSDT", 0, 1).series();
        let value = enricher.ema(&btc, 2).unwrap();
        assert!((value - Decimal::from(300)).abs() < Decimal::new(1, 20));
    }

    #[test]
    fn forget_resets_series() {
        let mut enricher = Enricher::new(&[20]).unwrap();
        let first = candle("BTCUSDT", 60_000, 100);
        let series = first.series();
        enricher.update(first);
        enricher.forget(&series);

        let reseeded = enricher.update(candle("BTCUSDT", 120_000, 50));
        assert_eq!(reseeded.ema(20), Some(Decimal::from(50)));
    }

    proptest! {
        #[test]
        fn streaming_matches_reference_replay(
            closes in prop::collection::vec(1u32..1_000_000, 1..60),
            period in 1u32..250,
        ) {
            let mut enricher = Enricher::new(&[period]).unwrap();
            let closes: Vec<Decimal> = closes
                .into_iter()
                .map(|c| Decimal::new(i64::from(c), 2))
                .collect();

            let streamed: Vec<Decimal> = closes
                .iter()
                .enumerate()
                .map(|(i, &close)| {
                    let mut record = candle("BTCUSDT", i64::try_from(i).unwrap() * 60_000, 1);
                    record.close = close;
                    enricher.update(record).ema(period).unwrap()
                })
                .collect();

            prop_assert_eq!(streamed, reference_ema(&closes, period));
        }
    }
}
