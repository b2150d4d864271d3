//! Partitioned Parquet Sink
//!
//! Buffers records per partition and writes each buffer as one Parquet file
//! once it is full or has waited past its maximum age:
//!
//! ```text
//! <root>/symbol=BTCUSDT/interval=1m/date=2026-10-18/part-<first ms>-<last ms>.parquet
//! ```
//!
//! Files are written to a `.tmp` sibling and renamed into place, so readers
//! never see a partial file. Prices, volumes and EMAs are stored as
//! `Float64`; exact decimals stay in the JSON lines output.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, TimestampMillisecondArray,
    UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use async_trait::async_trait;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::application::ports::{CandleSink, SinkError};
use crate::domain::candle::{CandleRecord, EnrichedCandleRecord, SeriesKey};

/// Rows per file unless configured otherwise.
pub const DEFAULT_BATCH_ROWS: usize = 1000;

/// Longest a row waits in a buffer before a flush writes it out.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Partition {
    series: SeriesKey,
    date: NaiveDate,
}

impl Partition {
    fn of(candle: &CandleRecord) -> Self {
        Self {
            series: candle.series(),
            date: candle.timestamp.date_naive(),
        }
    }

    fn dir(&self, root: &Path) -> PathBuf {
        root.join(format!("symbol={}", self.series.symbol))
            .join(format!("interval={}", self.series.interval))
            .join(format!("date={}", self.date.format("%Y-%m-%d")))
    }
}

#[derive(Debug)]
struct Pending {
    rows: Vec<EnrichedCandleRecord>,
    since: Instant,
}

/// Writes records as Hive-style partitioned Parquet files.
#[derive(Debug)]
pub struct ParquetSink {
    root: PathBuf,
    schema: SchemaRef,
    ema_periods: Vec<u32>,
    batch_rows: usize,
    max_age: Duration,
    pending: BTreeMap<Partition, Pending>,
    files_written: usize,
}

impl ParquetSink {
    /// Sink rooted at `root`, with one `ema_<period>` column per period.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, ema_periods: &[u32]) -> Self {
        let mut ema_periods = ema_periods.to_vec();
        ema_periods.sort_unstable();
        ema_periods.dedup();
        Self {
            root: root.into(),
            schema: schema(&ema_periods),
            ema_periods,
            batch_rows: DEFAULT_BATCH_ROWS,
            max_age: DEFAULT_MAX_AGE,
            pending: BTreeMap::new(),
            files_written: 0,
        }
    }

    /// Rows per file (at least 1).
    #[must_use]
    pub fn with_batch_rows(mut self, rows: usize) -> Self {
        self.batch_rows = rows.max(1);
        self
    }

    /// Age after which a flush writes a partial buffer.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Arrow schema of every file.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    /// Rows waiting to be written.
    #[must_use]
    pub fn buffered_rows(&self) -> usize {
        self.pending.values().map(|p| p.rows.len()).sum()
    }

    /// Files written so far.
    #[must_use]
    pub const fn files_written(&self) -> usize {
        self.files_written
    }

    fn buffer(&mut self, record: &EnrichedCandleRecord) {
        self.pending
            .entry(Partition::of(record.candle()))
            .or_insert_with(|| Pending {
                rows: Vec::new(),
                since: Instant::now(),
            })
            .rows
            .push(record.clone());
    }

    /// Write every partition matching `due`.
    async fn write_due<F>(&mut self, due: F) -> Result<(), SinkError>
    where
        F: Fn(&Pending) -> bool + Send,
    {
        let ready: Vec<Partition> = self
            .pending
            .iter()
            .filter(|(_, pending)| due(pending))
            .map(|(partition, _)| partition.clone())
            .collect();

        for partition in ready {
            if let Some(pending) = self.pending.remove(&partition) {
                self.write_partition(&partition, pending.rows).await?;
            }
        }
        Ok(())
    }

    async fn write_partition(
        &mut self,
        partition: &Partition,
        rows: Vec<EnrichedCandleRecord>,
    ) -> Result<(), SinkError> {
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            return Ok(());
        };
        let name = format!(
            "part-{}-{}.parquet",
            first.candle().timestamp.timestamp_millis(),
            last.candle().timestamp.timestamp_millis()
        );
        let path = partition.dir(&self.root).join(name);

        let batch = record_batch(&self.schema, &self.ema_periods, &rows)
            .map_err(|e| SinkError::Encode(e.to_string()))?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_file(&target, &batch))
            .await
            .map_err(|e| SinkError::Io(std::io::Error::other(e)))??;

        self.files_written += 1;
        tracing::info!(
            path = %path.display(),
            rows = rows.len(),
            series = %partition.series,
            "Wrote Parquet file"
        );
        Ok(())
    }
}

#[async_trait]
impl CandleSink for ParquetSink {
    async fn write(&mut self, record: &EnrichedCandleRecord) -> Result<(), SinkError> {
        self.buffer(record);
        let limit = self.batch_rows;
        self.write_due(|pending| pending.rows.len() >= limit).await
    }

    async fn write_all(&mut self, records: &[EnrichedCandleRecord]) -> Result<(), SinkError> {
        for record in records {
            self.buffer(record);
        }
        let limit = self.batch_rows;
        self.write_due(|pending| pending.rows.len() >= limit).await
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let (limit, max_age) = (self.batch_rows, self.max_age);
        self.write_due(|pending| {
            pending.rows.len() >= limit || pending.since.elapsed() >= max_age
        })
        .await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.write_due(|_| true).await
    }
}

fn schema(ema_periods: &[u32]) -> SchemaRef {
    let mut fields = vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("interval", DataType::Utf8, false),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Float64, false),
        Field::new("trade_count", DataType::UInt64, false),
        Field::new("taker_buy_base", DataType::Float64, true),
        Field::new("taker_buy_quote", DataType::Float64, true),
        Field::new("closed", DataType::Boolean, false),
    ];
    fields.extend(
        ema_periods
            .iter()
            .map(|period| Field::new(format!("ema_{period}"), DataType::Float64, true)),
    );
    Arc::new(Schema::new(fields))
}

fn float(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(f64::NAN)
}

fn record_batch(
    schema: &SchemaRef,
    ema_periods: &[u32],
    rows: &[EnrichedCandleRecord],
) -> Result<RecordBatch, arrow::error::ArrowError> {
    let candles: Vec<&CandleRecord> = rows.iter().map(EnrichedCandleRecord::candle).collect();
    let prices = |field: fn(&CandleRecord) -> Decimal| -> ArrayRef {
        Arc::new(Float64Array::from_iter_values(
            candles.iter().map(|c| float(field(c))),
        ))
    };
    let optional = |field: fn(&CandleRecord) -> Option<Decimal>| -> ArrayRef {
        Arc::new(Float64Array::from(
            candles.iter().map(|c| field(c).map(float)).collect::<Vec<_>>(),
        ))
    };

    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            candles.iter().map(|c| c.symbol.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            candles.iter().map(|c| c.interval.as_str()),
        )),
        Arc::new(
            TimestampMillisecondArray::from_iter_values(
                candles.iter().map(|c| c.timestamp.timestamp_millis()),
            )
            .with_timezone("UTC"),
        ),
        prices(|c| c.open),
        prices(|c| c.high),
        prices(|c| c.low),
        prices(|c| c.close),
        prices(|c| c.volume),
        Arc::new(UInt64Array::from_iter_values(
            candles.iter().map(|c| c.trade_count),
        )),
        optional(|c| c.taker_buy_base),
        optional(|c| c.taker_buy_quote),
        Arc::new(BooleanArray::from(
            candles.iter().map(|c| c.closed).collect::<Vec<_>>(),
        )),
    ];
    for period in ema_periods {
        columns.push(Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.ema(*period).map(float))
                .collect::<Vec<_>>(),
        )));
    }

    RecordBatch::try_new(Arc::clone(schema), columns)
}

fn write_file(path: &Path, batch: &RecordBatch) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("parquet.tmp");
    let properties = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let encode = |e: parquet::errors::ParquetError| SinkError::Encode(e.to_string());
    let file = File::create(&staging)?;
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), Some(properties)).map_err(encode)?;
    writer.write(batch).map_err(encode)?;
    writer.close().map_err(encode)?;

    std::fs::rename(&staging, path)?;
    Ok(())
}
