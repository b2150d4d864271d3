//! Record Sinks
//!
//! [`CandleSink`] implementations:
//!
//! - [`JsonLinesSink`]: append-only file, one JSON object per line
//! - [`ParquetSink`]: partitioned Parquet files written in batches
//! - [`CsvReportSink`]: flat CSV copy for spreadsheets
//! - [`ChannelSink`]: bounded hand-off to another task
//!
//! [`OutputSink`] is what the binary writes to: the configured store plus
//! the optional report.

mod columnar;
mod report;

pub use columnar::{DEFAULT_BATCH_ROWS, DEFAULT_MAX_AGE, ParquetSink};
pub use report::CsvReportSink;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::application::ports::{CandleSink, SinkError};
use crate::domain::candle::EnrichedCandleRecord;
use crate::infrastructure::config::{OutputFormat, OutputSettings};

// =============================================================================
// JSON Lines Sink
// =============================================================================

/// Appends records to a `.jsonl` file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the directory or file cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
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
        tracing::info!(path = %path.display(), "Opened JSON lines sink");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Output file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CandleSink for JsonLinesSink {
    async fn write(&mut self, record: &EnrichedCandleRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }
}

// =============================================================================
// Channel Sink
// =============================================================================

/// Forwards records over a bounded channel, waiting for capacity.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<EnrichedCandleRecord>,
}

impl ChannelSink {
    /// Create a sink and the receiving end.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EnrichedCandleRecord>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CandleSink for ChannelSink {
    async fn write(&mut self, record: &EnrichedCandleRecord) -> Result<(), SinkError> {
        self.tx
            .send(record.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

// =============================================================================
// Output Sink
// =============================================================================

#[derive(Debug)]
enum Store {
    JsonLines(JsonLinesSink),
    Parquet(ParquetSink),
}

/// Configured primary store plus an optional CSV report.
#[derive(Debug)]
pub struct OutputSink {
    store: Store,
    report: Option<CsvReportSink>,
}

impl OutputSink {
    /// Open the sinks described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if a file cannot be opened.
    pub async fn open(settings: &OutputSettings, ema_periods: &[u32]) -> Result<Self, SinkError> {
        let store = match settings.format {
            OutputFormat::JsonLines => Store::JsonLines(JsonLinesSink::open(&settings.path).await?),
            OutputFormat::Parquet => Store::Parquet(
                ParquetSink::new(&settings.path, ema_periods)
                    .with_batch_rows(settings.parquet_batch_rows)
                    .with_max_age(settings.parquet_max_age),
            ),
        };
        let report = match &settings.report_path {
            Some(path) => Some(CsvReportSink::open(path, ema_periods).await?),
            None => None,
        };
        Ok(Self { store, report })
    }

    fn store(&mut self) -> &mut dyn CandleSink {
        match &mut self.store {
            Store::JsonLines(sink) => sink,
            Store::Parquet(sink) => sink,
        }
    }
}

#[async_trait]
impl CandleSink for OutputSink {
    async fn write(&mut self, record: &EnrichedCandleRecord) -> Result<(), SinkError> {
        self.store().write(record).await?;
        if let Some(report) = &mut self.report {
            report.write(record).await?;
        }
        Ok(())
    }

    async fn write_all(&mut self, records: &[EnrichedCandleRecord]) -> Result<(), SinkError> {
        self.store().write_all(records).await?;
        if let Some(report) = &mut self.report {
            report.write_all(records).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.store().flush().await?;
        if let Some(report) = &mut self.report {
            report.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.store().close().await?;
        if let Some(report) = &mut self.report {
            report.close().await?;
        }
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

    #[tokio::test]
    async fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/klines.jsonl");

        let mut sink = JsonLinesSink::open(&path).await.unwrap();
        sink.write_all(&[record(60_000, 100), record(120_000, 102)])
            .await
            .unwrap();
        sink.flush().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: EnrichedCandleRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, record(60_000, 100));
        let raw: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(raw["symbol"], "BTCUSDT");
        assert!(raw.get("emas").is_some());
    }

    #[tokio::test]
    async fn reopening_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("klines.jsonl");

        for ts in [60_000, 120_000] {
            let mut sink = JsonLinesSink::open(&path).await.unwrap();
            sink.write(&record(ts, 1)).await.unwrap();
            sink.flush().await.unwrap();
        }

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (mut sink, mut rx) = ChannelSink::new(4);
        sink.write(&record(60_000, 1)).await.unwrap();
        sink.write(&record(120_000, 2)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().candle().close, Decimal::from(1));
        assert_eq!(rx.recv().await.unwrap().candle().close, Decimal::from(2));
    }

    #[tokio::test]
    async fn channel_sink_reports_closed() {
        let (mut sink, rx) = ChannelSink::new(1);
        drop(rx);
        assert!(matches!(
            sink.write(&record(60_000, 1)).await,
            Err(SinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn output_sink_writes_store_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let settings = OutputSettings {
            format: OutputFormat::Parquet,
            path: dir.path().join("parquet"),
            report_path: Some(dir.path().join("klines.csv")),
            ..OutputSettings::default()
        };

        let mut sink = OutputSink::open(&settings, &[20]).await.unwrap();
        sink.write_all(&[record(60_000, 1), record(120_000, 2)])
            .await
            .unwrap();
        sink.flush().await.unwrap();
        assert!(!dir.path().join("parquet").exists());

        sink.close().await.unwrap();
        let partition = dir
            .path()
            .join("parquet/symbol=BTCUSDT/interval=1m/date=1970-01-01");
        assert!(partition.join("part-60000-120000.parquet").exists());

        let report = tokio::fs::read_to_string(dir.path().join("klines.csv"))
            .await
            .unwrap();
        assert_eq!(report.lines().count(), 3);
    }
}
