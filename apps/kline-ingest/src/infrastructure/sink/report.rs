//! CSV Report Sink
//!
//! Flat, spreadsheet-friendly copy of the output. One row per record with
//! the EMA periods as trailing `ema_<period>` columns; empty cells stand for
//! missing taker volumes or EMAs. The header is written only to an empty
//! file, so reopening appends.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::SecondsFormat;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::application::ports::{CandleSink, SinkError};
use crate::domain::candle::EnrichedCandleRecord;

const FIXED_COLUMNS: [&str; 12] = [
    "symbol",
    "timestamp",
    "interval",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "trade_count",
    "taker_buy_base",
    "taker_buy_quote",
    "closed",
];

/// Appends records to a CSV file.
#[derive(Debug)]
pub struct CsvReportSink {
    path: PathBuf,
    ema_periods: Vec<u32>,
    writer: BufWriter<File>,
}

impl CsvReportSink {
    /// Open `path` for appending, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the file cannot be opened, or
    /// [`SinkError::Encode`] if the header cannot be encoded.
    pub async fn open(path: impl AsRef<Path>, ema_periods: &[u32]) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let fresh = file.metadata().await?.len() == 0;

        let mut ema_periods = ema_periods.to_vec();
        ema_periods.sort_unstable();
        ema_periods.dedup();

        let mut sink = Self {
            path,
            ema_periods,
            writer: BufWriter::new(file),
        };
        if fresh {
            let header = sink.header();
            sink.writer.write_all(&encode(&header)?).await?;
        }
        tracing::info!(path = %sink.path.display(), "Opened CSV report sink");
        Ok(sink)
    }

    /// Report file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(ToString::to_string)
            .chain(self.ema_periods.iter().map(|p| format!("ema_{p}")))
            .collect()
    }

    fn row(&self, record: &EnrichedCandleRecord) -> Vec<String> {
        let c = record.candle();
        let optional = |value: Option<rust_decimal::Decimal>| {
            value.map(|v| v.to_string()).unwrap_or_default()
        };
        let mut row = vec![
            c.symbol.to_string(),
            c.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            c.interval.to_string(),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
            c.trade_count.to_string(),
            optional(c.taker_buy_base),
            optional(c.taker_buy_quote),
            c.closed.to_string(),
        ];
        row.extend(self.ema_periods.iter().map(|p| optional(record.ema(*p))));
        row
    }
}

fn encode(fields: &[String]) -> Result<Vec<u8>, SinkError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(fields)
        .map_err(|e| SinkError::Encode(e.to_string()))?;
    writer
        .into_inner()
        .map_err(|e| SinkError::Encode(e.to_string()))
}

#[async_trait]
impl CandleSink for CsvReportSink {
    async fn write(&mut self, record: &EnrichedCandleRecord) -> Result<(), SinkError> {
        let line = encode(&self.row(record))?;
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::candle::tests::candle;
    use rust_decimal::Decimal;

    fn record(ts: i64, close: i64) -> EnrichedCandleRecord {
        let mut emas = BTreeMap::new();
        emas.insert(20, Decimal::from(close));
        EnrichedCandleRecord::new(candle("BTCUSDT", ts, close), emas)
    }

    fn rows(path: &Path) -> (csv::StringRecord, Vec<csv::StringRecord>) {
        let mut reader = csv::Reader::from_path(path).unwrap();
        let header = reader.headers().unwrap().clone();
        let rows = reader.records().map(Result::unwrap).collect();
        (header, rows)
    }

    #[tokio::test]
    async fn rows_follow_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports/klines.csv");

        let mut sink = CsvReportSink::open(&path, &[50, 20]).await.unwrap();
        sink.write_all(&[record(60_000, 100), record(120_000, 102)])
            .await
            .unwrap();
        sink.flush().await.unwrap();

        let (header, rows) = rows(&path);
        assert_eq!(&header[0], "symbol");
        assert_eq!(&header[12], "ema_20");
        assert_eq!(&header[13], "ema_50");
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(&first[0], "BTCUSDT");
        assert_eq!(&first[1], "1970-01-01T00:01:00.000Z");
        assert_eq!(&first[2], "1m");
        assert_eq!(&first[6], "100");
        assert_eq!(&first[7], "12.345");
        assert_eq!(&first[9], "6.789");
        assert_eq!(&first[10], "");
        assert_eq!(&first[11], "true");
        assert_eq!(&first[12], "100");
        assert_eq!(&first[13], "");
    }

    #[tokio::test]
    async fn reopening_appends_without_a_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klines.csv");

        for ts in [60_000, 120_000] {
            let mut sink = CsvReportSink::open(&path, &[20]).await.unwrap();
            sink.write(&record(ts, 1)).await.unwrap();
            sink.close().await.unwrap();
        }

        let (header, rows) = rows(&path);
        assert_eq!(header.len(), 13);
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "1970-01-01T00:02:00.000Z");
    }
}
