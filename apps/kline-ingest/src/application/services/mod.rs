//! Application Services
//!
//! - `IngestPipeline`: normalize, clean, enrich, mask and write candles

mod pipeline;

pub use pipeline::{IngestPipeline, Outcome, PipelineConfig, PipelineStats, PipelineStatsSnapshot};
