//! Heartbeat Monitor
//!
//! Liveness tracking for one stream connection. The exchange pings us and
//! pushes a kline update every couple of seconds, so any inbound frame
//! counts as activity. On each tick the monitor either asks for a ping or
//! declares the connection dead.

use std::time::{Duration, Instant};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between liveness checks (and client pings).
    pub ping_interval: Duration,
    /// Silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// What the connection loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame.
    SendPing,
    /// No inbound traffic for longer than the timeout.
    Timeout,
}

/// Per-connection heartbeat state.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    last_activity: Instant,
}

impl Heartbeat {
    /// Start monitoring from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            last_activity: Instant::now(),
        }
    }

    /// Configured check interval.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }

    /// Record any inbound frame.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Evaluate liveness at a tick.
    pub fn on_tick(&self) -> HeartbeatEvent {
        self.evaluate(self.silence())
    }

    fn evaluate(&self, silence: Duration) -> HeartbeatEvent {
        if silence >= self.config.timeout {
            return HeartbeatEvent::Timeout;
        }
        HeartbeatEvent::SendPing
    }
}
