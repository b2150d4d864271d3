//! Ingest Configuration Settings
//!
//! Configuration types for the ingest service, loaded from environment
//! variables. Symbols, interval and EMA periods are validated up front;
//! other numeric settings fall back to their defaults when unparseable.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::application::services::PipelineConfig;
use crate::domain::candle::{DomainError, Interval, Symbol};
use crate::domain::cleaning::DEFAULT_RETENTION;
use crate::domain::enrichment::DEFAULT_EMA_PERIODS;
use crate::infrastructure::binance::{
    ConnectionConfig, DEFAULT_REST_URL, DEFAULT_STREAM_URL, HeartbeatConfig, ReconnectConfig,
};
use crate::infrastructure::supervisor::SupervisorConfig;

/// WebSocket connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Feed endpoint.
    pub url: String,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Consecutive subscription rejections before a symbol is marked down.
    pub max_rejections: u32,
    /// Uptime after which backoff resets.
    pub stable_after: Duration,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
            max_rejections: 3,
            stable_after: Duration::from_secs(30),
        }
    }
}

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// EMA periods.
    pub ema_periods: Vec<u32>,
    /// Distinct timestamps remembered per series for duplicate detection.
    pub dedup_retention: usize,
    /// Drop in-progress candle updates.
    pub closed_only: bool,
    /// Fan-in channel capacity.
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ema_periods: DEFAULT_EMA_PERIODS.to_vec(),
            dedup_retention: DEFAULT_RETENTION,
            closed_only: true,
            channel_capacity: 1024,
        }
    }
}

/// Storage format of the primary output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON object per line, exact decimals.
    #[default]
    JsonLines,
    /// Partitioned Parquet files.
    Parquet,
}

impl OutputFormat {
    /// Output location used when none is configured.
    #[must_use]
    pub const fn default_path(self) -> &'static str {
        match self {
            Self::JsonLines => "data/klines.jsonl",
            Self::Parquet => "data/parquet",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "jsonl" | "json" | "jsonlines" => Ok(Self::JsonLines),
            "parquet" => Ok(Self::Parquet),
            other => Err(format!("unknown output format {other:?} (expected jsonl or parquet)")),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::JsonLines => "jsonl",
            Self::Parquet => "parquet",
        })
    }
}

/// Output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSettings {
    /// Primary storage format.
    pub format: OutputFormat,
    /// JSON lines file, or Parquet root directory.
    pub path: PathBuf,
    /// Optional CSV report written alongside the primary output.
    pub report_path: Option<PathBuf>,
    /// Rows per Parquet file.
    pub parquet_batch_rows: usize,
    /// Longest a Parquet row stays buffered.
    pub parquet_max_age: Duration,
}

impl Default for OutputSettings {
    fn default() -> Self {
        let format = OutputFormat::default();
        Self {
            format,
            path: PathBuf::from(format.default_path()),
            report_path: None,
            parquet_batch_rows: 1000,
            parquet_max_age: Duration::from_secs(300),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete ingest configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Tracked symbols, deduplicated, in configured order.
    pub symbols: Vec<Symbol>,
    /// Kline interval.
    pub interval: Interval,
    /// Stream connection settings.
    pub websocket: WebSocketSettings,
    /// Historical klines endpoint.
    pub rest_url: String,
    /// Days of history to backfill before streaming (0 = none).
    pub backfill_days: u32,
    /// Pipeline settings.
    pub pipeline: PipelineSettings,
    /// Output settings.
    pub output: OutputSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Grace period for stopping connections.
    pub shutdown_grace: Duration,
}

impl IngestConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if symbols are missing or invalid, or the interval,
    /// EMA periods or output format cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let symbols = parse_symbols(
            &lookup("KLINE_SYMBOLS")
                .ok_or_else(|| ConfigError::MissingEnvVar("KLINE_SYMBOLS".to_string()))?,
        )?;

        let interval = match lookup("KLINE_INTERVAL") {
            Some(raw) => Interval::from_str(raw.trim()).map_err(|e| ConfigError::InvalidValue {
                key: "KLINE_INTERVAL".to_string(),
                reason: e.to_string(),
            })?,
            None => Interval::OneMinute,
        };

        let ema_periods = match lookup("KLINE_EMA_PERIODS") {
            Some(raw) => parse_periods(&raw)?,
            None => DEFAULT_EMA_PERIODS.to_vec(),
        };

        let ws = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            url: parse_env_string(&lookup, "KLINE_STREAM_URL", &ws.url),
            heartbeat_interval: parse_env_duration_secs(
                &lookup,
                "KLINE_HEARTBEAT_INTERVAL_SECS",
                ws.heartbeat_interval,
            ),
            heartbeat_timeout: parse_env_duration_secs(
                &lookup,
                "KLINE_HEARTBEAT_TIMEOUT_SECS",
                ws.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_env_duration_millis(
                &lookup,
                "KLINE_RECONNECT_DELAY_INITIAL_MS",
                ws.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                &lookup,
                "KLINE_RECONNECT_DELAY_MAX_SECS",
                ws.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env(
                &lookup,
                "KLINE_RECONNECT_DELAY_MULTIPLIER",
                ws.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env(
                &lookup,
                "KLINE_MAX_RECONNECT_ATTEMPTS",
                ws.max_reconnect_attempts,
            ),
            max_rejections: parse_env(&lookup, "KLINE_MAX_REJECTIONS", ws.max_rejections)
                .max(1),
            stable_after: parse_env_duration_secs(
                &lookup,
                "KLINE_STABLE_AFTER_SECS",
                ws.stable_after,
            ),
        };

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            ema_periods,
            dedup_retention: parse_env(
                &lookup,
                "KLINE_DEDUP_RETENTION",
                defaults.dedup_retention,
            )
            .max(1),
            closed_only: parse_env_bool(&lookup, "KLINE_CLOSED_ONLY", defaults.closed_only),
            channel_capacity: parse_env(
                &lookup,
                "KLINE_CHANNEL_CAPACITY",
                defaults.channel_capacity,
            )
            .max(1),
        };

        let output = parse_output(&lookup)?;

        Ok(Self {
            symbols,
            interval,
            websocket,
            rest_url: parse_env_string(&lookup, "KLINE_REST_URL", DEFAULT_REST_URL),
            backfill_days: parse_env(&lookup, "KLINE_BACKFILL_DAYS", 0),
            pipeline,
            output,
            server: ServerSettings {
                health_port: parse_env(
                    &lookup,
                    "KLINE_HEALTH_PORT",
                    ServerSettings::default().health_port,
                ),
            },
            shutdown_grace: parse_env_duration_secs(
                &lookup,
                "KLINE_SHUTDOWN_GRACE_SECS",
                Duration::from_secs(10),
            ),
        })
    }

    /// Settings for each stream connection.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        let ws = &self.websocket;
        ConnectionConfig {
            url: ws.url.clone(),
            interval: self.interval,
            reconnect: ReconnectConfig {
                initial_delay: ws.reconnect_delay_initial,
                max_delay: ws.reconnect_delay_max,
                multiplier: ws.reconnect_delay_multiplier,
                jitter_factor: 0.1,
                max_attempts: ws.max_reconnect_attempts,
                stable_after: ws.stable_after,
            },
            heartbeat: HeartbeatConfig {
                ping_interval: ws.heartbeat_interval,
                timeout: ws.heartbeat_timeout,
            },
            max_rejections: ws.max_rejections,
        }
    }

    /// Settings for the ingest pipeline.
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            ema_periods: self.pipeline.ema_periods.clone(),
            dedup_retention: self.pipeline.dedup_retention,
            closed_only: self.pipeline.closed_only,
        }
    }

    /// Settings for the stream supervisor.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            connection: self.connection_config(),
            channel_capacity: self.pipeline.channel_capacity,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What was wrong.
        reason: String,
    },
    /// Symbol rejected.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

fn parse_symbols(raw: &str) -> Result<Vec<Symbol>, ConfigError> {
    let mut symbols: Vec<Symbol> = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let symbol = Symbol::new(part)?;
        if !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    if symbols.is_empty() {
        return Err(ConfigError::EmptyValue("KLINE_SYMBOLS".to_string()));
    }
    Ok(symbols)
}

fn parse_periods(raw: &str) -> Result<Vec<u32>, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: "KLINE_EMA_PERIODS".to_string(),
        reason,
    };

    let periods = raw
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.parse::<u32>() {
            Ok(0) => Err(invalid("period must be at least 1".to_string())),
            Ok(period) => Ok(period),
            Err(e) => Err(invalid(format!("{p:?}: {e}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if periods.is_empty() {
        return Err(invalid("no periods given".to_string()));
    }
    Ok(periods)
}

fn parse_output<F>(lookup: &F) -> Result<OutputSettings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let format = match lookup("KLINE_OUTPUT_FORMAT") {
        Some(raw) => raw.parse().map_err(|reason| ConfigError::InvalidValue {
            key: "KLINE_OUTPUT_FORMAT".to_string(),
            reason,
        })?,
        None => OutputFormat::default(),
    };
    let defaults = OutputSettings::default();

    Ok(OutputSettings {
        format,
        path: PathBuf::from(parse_env_string(
            lookup,
            "KLINE_OUTPUT_PATH",
            format.default_path(),
        )),
        report_path: lookup("KLINE_REPORT_PATH")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
        parquet_batch_rows: parse_env(
            lookup,
            "KLINE_PARQUET_BATCH_ROWS",
            defaults.parquet_batch_rows,
        )
        .max(1),
        parquet_max_age: parse_env_duration_secs(
            lookup,
            "KLINE_PARQUET_MAX_AGE_SECS",
            defaults.parquet_max_age,
        ),
    })
}

fn parse_env<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_env_string<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()).as_deref() {
        Some("true" | "1" | "yes" | "on") => true,
        Some("false" | "0" | "no" | "off") => false,
        _ => default,
    }
}

fn parse_env_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<IngestConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        IngestConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_with_only_symbols() {
        let config = load(&[("KLINE_SYMBOLS", "btcusdt")]).unwrap();

        assert_eq!(config.symbols, vec![Symbol::new("BTCUSDT").unwrap()]);
        assert_eq!(config.interval, Interval::OneMinute);
        assert_eq!(config.websocket, WebSocketSettings::default());
        assert_eq!(config.pipeline, PipelineSettings::default());
        assert_eq!(config.rest_url, DEFAULT_REST_URL);
        assert_eq!(config.backfill_days, 0);
        assert_eq!(config.output, OutputSettings::default());
        assert_eq!(config.output.path, PathBuf::from("data/klines.jsonl"));
        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn symbols_are_trimmed_uppercased_and_deduplicated() {
        let config = load(&[("KLINE_SYMBOLS", " btcusdt, ETHUSDT,,BTCUSDT ")]).unwrap();
        let names: Vec<&str> = config.symbols.iter().map(Symbol::as_str).collect();
        assert_eq!(names, vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn missing_symbols_fail() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    fn empty_symbols_fail() {
        assert!(matches!(
            load(&[("KLINE_SYMBOLS", " , ")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn invalid_symbol_fails() {
        assert!(matches!(
            load(&[("KLINE_SYMBOLS", "BTC-USDT")]),
            Err(ConfigError::Domain(_))
        ));
    }

    #[test]
    fn invalid_interval_fails() {
        let err = load(&[("KLINE_SYMBOLS", "BTCUSDT"), ("KLINE_INTERVAL", "7m")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "KLINE_INTERVAL"
        ));
    }

    #[test]
    fn ema_periods_are_validated() {
        let config =
            load(&[("KLINE_SYMBOLS", "BTCUSDT"), ("KLINE_EMA_PERIODS", "9, 21")]).unwrap();
        assert_eq!(config.pipeline.ema_periods, vec![9, 21]);

        for bad in ["0", "abc", ""] {
            assert!(
                load(&[("KLINE_SYMBOLS", "BTCUSDT"), ("KLINE_EMA_PERIODS", bad)]).is_err(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn optional_numbers_fall_back_to_defaults() {
        let config = load(&[
            ("KLINE_SYMBOLS", "BTCUSDT"),
            ("KLINE_HEALTH_PORT", "not-a-port"),
            ("KLINE_DEDUP_RETENTION", "0"),
            ("KLINE_CLOSED_ONLY", "maybe"),
            ("KLINE_RECONNECT_DELAY_INITIAL_MS", "250"),
            ("KLINE_MAX_RECONNECT_ATTEMPTS", "5"),
        ])
        .unwrap();

        assert_eq!(config.server.health_port, 8083);
        assert_eq!(config.pipeline.dedup_retention, 1);
        assert!(config.pipeline.closed_only);
        assert_eq!(
            config.websocket.reconnect_delay_initial,
            Duration::from_millis(250)
        );
        assert_eq!(config.websocket.max_reconnect_attempts, 5);
    }

    #[test]
    fn closed_only_can_be_disabled() {
        let config =
            load(&[("KLINE_SYMBOLS", "BTCUSDT"), ("KLINE_CLOSED_ONLY", "false")]).unwrap();
        assert!(!config.pipeline.closed_only);
        assert!(!config.pipeline_config().closed_only);
    }

    #[test]
    fn connection_config_carries_settings() {
        let config = load(&[
            ("KLINE_SYMBOLS", "BTCUSDT"),
            ("KLINE_INTERVAL", "1h"),
            ("KLINE_MAX_REJECTIONS", "5"),
            ("KLINE_STABLE_AFTER_SECS", "60"),
        ])
        .unwrap();

        let connection = config.connection_config();
        assert_eq!(connection.interval, Interval::OneHour);
        assert_eq!(connection.max_rejections, 5);
        assert_eq!(connection.reconnect.stable_after, Duration::from_secs(60));
        assert_eq!(connection.url, DEFAULT_STREAM_URL);

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.channel_capacity, 1024);
    }

    #[test]
    fn parquet_output_defaults_to_a_directory() {
        let config = load(&[
            ("KLINE_SYMBOLS", "BTCUSDT"),
            ("KLINE_OUTPUT_FORMAT", " Parquet "),
            ("KLINE_REPORT_PATH", "reports/klines.csv"),
            ("KLINE_PARQUET_BATCH_ROWS", "0"),
            ("KLINE_PARQUET_MAX_AGE_SECS", "60"),
        ])
        .unwrap();

        let output = &config.output;
        assert_eq!(output.format, OutputFormat::Parquet);
        assert_eq!(output.path, PathBuf::from("data/parquet"));
        assert_eq!(output.report_path, Some(PathBuf::from("reports/klines.csv")));
        assert_eq!(output.parquet_batch_rows, 1);
        assert_eq!(output.parquet_max_age, Duration::from_secs(60));
    }

    #[test]
    fn unknown_output_format_fails() {
        let err = load(&[("KLINE_SYMBOLS", "BTCUSDT"), ("KLINE_OUTPUT_FORMAT", "xlsx")])
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "KLINE_OUTPUT_FORMAT"
        ));
    }
}
