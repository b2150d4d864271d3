//! Ingest Pipeline
//!
//! Single-owner processing of the merged feed:
//!
//! ```text
//! RawMessage ─▶ decode ─▶ closed-only filter ─▶ clean ─▶ enrich ─▶ mask ─▶ sink
//! ```
//!
//! The pipeline owns the cleaner's seen keys and the enricher's EMA state,
//! so neither needs a lock. Parse and validation failures are counted and
//! dropped; sink failures are returned to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::{Stream, StreamExt};
use serde::Serialize;

use crate::application::ports::{CandleDecoder, CandleSink, SinkError};
use crate::domain::anonymize::Anonymizer;
use crate::domain::candle::{CandleRecord, EnrichedCandleRecord, SeriesKey};
use crate::domain::cleaning::{DEFAULT_RETENTION, Deduplicator, ValidationError};
use crate::domain::enrichment::{DEFAULT_EMA_PERIODS, Enricher, EnrichmentError};
use crate::domain::feed::{ParseError, RawMessage};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// EMA periods to compute.
    pub ema_periods: Vec<u32>,
    /// Timestamps remembered per series for duplicate detection.
    pub dedup_retention: usize,
    /// Drop in-progress candle updates.
    pub closed_only: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ema_periods: DEFAULT_EMA_PERIODS.to_vec(),
            dedup_retention: DEFAULT_RETENTION,
            closed_only: true,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters shared with the monitoring view.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    parse_errors: AtomicU64,
    in_progress: AtomicU64,
    rejected: AtomicU64,
    written: AtomicU64,
    sink_errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineStatsSnapshot {
    /// Raw messages received.
    pub received: u64,
    /// Messages that failed to normalize.
    pub parse_errors: u64,
    /// In-progress updates dropped by the closed-only filter.
    pub in_progress: u64,
    /// Records refused by the cleaner.
    pub rejected: u64,
    /// Records written to the sink.
    pub written: u64,
    /// Sink write failures.
    pub sink_errors: u64,
}

impl PipelineStats {
    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            in_progress: self.in_progress.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// What happened to one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Record enriched, masked and written.
    Written,
    /// Message could not be normalized.
    ParseFailed(ParseError),
    /// In-progress update skipped.
    InProgress,
    /// Refused by the cleaner.
    Rejected(ValidationError),
}

/// Normalize → clean → enrich → mask → sink.
pub struct IngestPipeline<S> {
    decoder: Box<dyn CandleDecoder>,
    cleaner: Deduplicator,
    enricher: Enricher,
    anonymizer: Anonymizer,
    sink: S,
    closed_only: bool,
    stats: Arc<PipelineStats>,
}

impl<S> std::fmt::Debug for IngestPipeline<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("periods", &self.enricher.periods())
            .field("closed_only", &self.closed_only)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl<S: CandleSink> IngestPipeline<S> {
    /// Build a pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichmentError::ZeroPeriod`] if an EMA period is zero.
    pub fn new(
        config: &PipelineConfig,
        decoder: Box<dyn CandleDecoder>,
        sink: S,
    ) -> Result<Self, EnrichmentError> {
        Ok(Self {
            decoder,
            cleaner: Deduplicator::new(config.dedup_retention),
            enricher: Enricher::new(&config.ema_periods)?,
            anonymizer: Anonymizer::new(),
            sink,
            closed_only: config.closed_only,
            stats: Arc::new(PipelineStats::default()),
        })
    }

    /// Shared counters.
    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// The sink.
    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Decode and process one raw message.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the sink write fails. Parse and validation
    /// failures are reported through [`Outcome`].
    pub async fn process(&mut self, raw: RawMessage) -> Result<Outcome, SinkError> {
        let started = Instant::now();
        PipelineStats::bump(&self.stats.received);

        let record = match self.decoder.decode(&raw) {
            Ok(record) => record,
            Err(e) => {
                PipelineStats::bump(&self.stats.parse_errors);
                metrics::record_parse_error(e.kind());
                tracing::warn!(symbol = %raw.symbol, error = %e, "Dropping unparseable message");
                return Ok(Outcome::ParseFailed(e));
            }
        };

        let outcome = self.ingest(record).await?;
        if outcome == Outcome::Written {
            metrics::record_processing_duration(started.elapsed());
        }
        Ok(outcome)
    }

    /// Process an already-normalized record.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the sink write fails.
    pub async fn ingest(&mut self, record: CandleRecord) -> Result<Outcome, SinkError> {
        let masked = match self.admit(record) {
            Ok(masked) => masked,
            Err(outcome) => return Ok(outcome),
        };

        if let Err(e) = self.sink.write(&masked).await {
            self.count_sink_error();
            tracing::error!(key = %masked.candle().key(), error = %e, "Sink write failed");
            return Err(e);
        }

        PipelineStats::bump(&self.stats.written);
        metrics::record_written(1);
        Ok(Outcome::Written)
    }

    /// Process a batch of normalized records (backfill), hand the admitted
    /// ones to the sink in a single write, and flush.
    ///
    /// Returns the number of records written.
    ///
    /// # Errors
    ///
    /// Returns the first [`SinkError`].
    pub async fn ingest_records<I>(&mut self, records: I) -> Result<usize, SinkError>
    where
        I: IntoIterator<Item = CandleRecord> + Send,
        I::IntoIter: Send,
    {
        let batch: Vec<EnrichedCandleRecord> = records
            .into_iter()
            .filter_map(|record| self.admit(record).ok())
            .collect();

        if let Err(e) = self.sink.write_all(&batch).await {
            self.count_sink_error();
            tracing::error!(rows = batch.len(), error = %e, "Sink batch write failed");
            return Err(e);
        }
        self.sink.flush().await?;

        let count = u64::try_from(batch.len()).unwrap_or(u64::MAX);
        self.stats.written.fetch_add(count, Ordering::Relaxed);
        metrics::record_written(count);
        Ok(batch.len())
    }

    /// Closed-only filter, cleaner, enricher and mask. Records that stop
    /// early are counted and returned as their [`Outcome`].
    fn admit(&mut self, record: CandleRecord) -> Result<EnrichedCandleRecord, Outcome> {
        if self.closed_only && !record.closed {
            PipelineStats::bump(&self.stats.in_progress);
            metrics::record_rejected("in_progress");
            return Err(Outcome::InProgress);
        }

        let record = match self.cleaner.check(record) {
            Ok(record) => record,
            Err(e) => {
                PipelineStats::bump(&self.stats.rejected);
                metrics::record_rejected(e.reason());
                tracing::debug!(reason = e.reason(), error = %e, "Candle rejected");
                return Err(Outcome::Rejected(e));
            }
        };

        Ok(self.anonymizer.mask(self.enricher.update(record)))
    }

    fn count_sink_error(&self) {
        PipelineStats::bump(&self.stats.sink_errors);
        metrics::record_sink_error();
    }

    /// Drain a message stream until it ends, flushing after each write.
    ///
    /// # Errors
    ///
    /// Returns the first [`SinkError`]; the stream is not drained further.
    pub async fn run<St>(&mut self, messages: St) -> Result<(), SinkError>
    where
        St: Stream<Item = RawMessage> + Unpin + Send,
    {
        self.run_with_removals(messages, futures::stream::pending()).await
    }

    /// [`Self::run`], also dropping series state for every key that arrives
    /// on `removals`. A ready removal is handled before the next message.
    ///
    /// # Errors
    ///
    /// Returns the first [`SinkError`]; the stream is not drained further.
    pub async fn run_with_removals<St, Rm>(
        &mut self,
        mut messages: St,
        mut removals: Rm,
    ) -> Result<(), SinkError>
    where
        St: Stream<Item = RawMessage> + Unpin + Send,
        Rm: Stream<Item = SeriesKey> + Unpin + Send,
    {
        tracing::info!("Ingest pipeline started");
        let mut removals_open = true;
        loop {
            tokio::select! {
                biased;
                removed = removals.next(), if removals_open => match removed {
                    Some(series) => self.forget(&series),
                    None => removals_open = false,
                },
                message = messages.next() => {
                    let Some(raw) = message else { break };
                    if self.process(raw).await? == Outcome::Written {
                        self.sink.flush().await?;
                    }
                }
            }
        }
        self.sink.close().await?;

        let stats = self.stats.snapshot();
        tracing::info!(
            received = stats.received,
            written = stats.written,
            rejected = stats.rejected,
            parse_errors = stats.parse_errors,
            "Ingest pipeline drained"
        );
        Ok(())
    }

    /// Drop cleaner and EMA state for a series no longer tracked.
    pub fn forget(&mut self, series: &SeriesKey) {
        self.cleaner.forget(series);
        self.enricher.forget(series);
        tracing::info!(series = %series, "Dropped series state");
    }
}

// =============================================================================
// Tests
// =============================================================================
