//! Live publishing statistics

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot returned by a statistics query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatistics {
    /// Last reported bitrate (bps)
    pub bitrate: u64,
    pub bitrate_formatted: String,
    /// Seconds since the stream last became active
    pub duration_secs: u64,
    pub duration_formatted: String,
    /// Approximate, accumulated from bitrate samples
    pub total_bytes_sent: u64,
    /// Secondary destinations currently configured
    pub destinations: usize,
}

pub fn format_bitrate(bps: u64) -> String {
    if bps >= 1_000_000 {
        format!("{:.1} Mbps", bps as f64 / 1_000_000.0)
    } else if bps >= 1_000 {
        format!("{} kbps", bps / 1_000)
    } else {
        format!("{} bps", bps)
    }
}

/// HH:MM:SS
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[derive(Debug, Default)]
pub struct StatsTracker {
    bitrate: u64,
    total_bytes: u64,
    active_since: Option<Instant>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream became active; keeps the running byte total
    pub fn on_active(&mut self) {
        if self.active_since.is_none() {
            self.active_since = Some(Instant::now());
        }
    }

    pub fn on_inactive(&mut self) {
        self.active_since = None;
        self.bitrate = 0;
    }

    /// Bitrate samples arrive roughly once per second
    pub fn on_bitrate(&mut self, bps: u64) {
        self.bitrate = bps;
        self.total_bytes = self.total_bytes.saturating_add(bps / 8);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self, destinations: usize) -> StreamStatistics {
        let duration = self
            .active_since
            .map(|since| since.elapsed())
            .unwrap_or_default();

        StreamStatistics {
            bitrate: self.bitrate,
            bitrate_formatted: format_bitrate(self.bitrate),
            duration_secs: duration.as_secs(),
            duration_formatted: format_duration(duration),
            total_bytes_sent: self.total_bytes,
            destinations,
        }
    }
}
