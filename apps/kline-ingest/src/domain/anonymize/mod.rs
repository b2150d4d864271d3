//! Volume Anonymization
//!
//! Rounds trade-size fields so individual fills cannot be fingerprinted
//! from the stored candles. Prices and EMAs pass through untouched.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::candle::EnrichedCandleRecord;

/// Fractional digits kept on masked fields.
pub const MASK_DECIMAL_PLACES: u32 = 2;

/// Pure, stateless volume mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anonymizer {
    decimal_places: u32,
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Anonymizer {
    /// Mask to [`MASK_DECIMAL_PLACES`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            decimal_places: MASK_DECIMAL_PLACES,
        }
    }

    /// Mask to a custom number of fractional digits.
    #[must_use]
    pub const fn with_decimal_places(decimal_places: u32) -> Self {
        Self { decimal_places }
    }

    /// Round volume, taker-buy base and taker-buy quote.
    #[must_use]
    pub fn mask(&self, record: EnrichedCandleRecord) -> EnrichedCandleRecord {
        let (mut candle, emas) = record.into_parts();
        candle.volume = self.round(candle.volume);
        candle.taker_buy_base = candle.taker_buy_base.map(|v| self.round(v));
        candle.taker_buy_quote = candle.taker_buy_quote.map(|v| self.round(v));
        EnrichedCandleRecord::new(candle, emas)
    }

    fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.decimal_places, RoundingStrategy::MidpointNearestEven)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::candle::tests::candle;

    fn enriched(
        volume: Decimal,
        base: Option<Decimal>,
        quote: Option<Decimal>,
    ) -> EnrichedCandleRecord {
        let mut record = candle("BTCUSDT", 60_000, 100);
        record.open = Decimal::new(1_234_567, 4);
        record.volume = volume;
        record.taker_buy_base = base;
        record.taker_buy_quote = quote;
        let mut emas = BTreeMap::new();
        emas.insert(20, Decimal::new(100_190_476_190, 9));
        EnrichedCandleRecord::new(record, emas)
    }

    #[test]
    fn rounds_volume_fields_to_two_places() {
        let masked = Anonymizer::new().mask(enriched(
            Decimal::new(12_345_678, 6),
            Some(Decimal::new(9_999, 3)),
            Some(Decimal::new(1_004, 3)),
        ));

        assert_eq!(masked.candle().volume, Decimal::new(1_235, 2));
        assert_eq!(masked.candle().taker_buy_base, Some(Decimal::new(1_000, 2)));
        assert_eq!(masked.candle().taker_buy_quote, Some(Decimal::new(100, 2)));
    }

    #[test]
    fn midpoint_rounds_to_even() {
        let masked = Anonymizer::new().mask(enriched(Decimal::new(1_125, 3), None, None));
        assert_eq!(masked.candle().volume, Decimal::new(112, 2));
    }

    #[test]
    fn leaves_prices_and_emas_alone() {
        let original = enriched(Decimal::new(12_345, 3), None, None);
        let masked = Anonymizer::new().mask(original.clone());

        assert_eq!(masked.candle().open, original.candle().open);
        assert_eq!(masked.candle().close, original.candle().close);
        assert_eq!(masked.emas(), original.emas());
        assert_eq!(masked.candle().taker_buy_base, None);
    }

    #[test]
    fn custom_precision() {
        let masked =
            Anonymizer::with_decimal_places(0).mask(enriched(Decimal::new(25, 1), None, None));
        assert_eq!(masked.candle().volume, Decimal::from(2));
    }
}
