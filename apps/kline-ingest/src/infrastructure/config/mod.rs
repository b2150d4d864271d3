//! Configuration Module
//!
//! Configuration loading for the ingest service.

mod settings;

pub use settings::{
    ConfigError, IngestConfig, OutputFormat, OutputSettings, PipelineSettings, ServerSettings,
    WebSocketSettings,
};
