// src/progress.rs

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Progress snapshot attached to every update.
///
/// Percent-complete and the ETA are derived on first access and cached for the
/// lifetime of the snapshot. Each update builds a fresh one.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress {
    pub bytes_per_second: u64,
    pub bytes_to_transfer: Option<u64>,
    pub bytes_transferred: u64,
    percent: OnceLock<f64>,
    estimate: OnceLock<Duration>,
}

impl TransferProgress {
    pub fn new(bytes_per_second: u64, bytes_to_transfer: Option<u64>, bytes_transferred: u64) -> Self {
        Self {
            bytes_per_second,
            bytes_to_transfer,
            bytes_transferred,
            percent: OnceLock::new(),
            estimate: OnceLock::new(),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.bytes_to_transfer.is_some()
    }

    /// Fraction complete in `0.0..=1.0`, two decimals, or -1 when the size is unknown.
    pub fn percent_complete(&self) -> f64 {
        *self.percent.get_or_init(|| match self.bytes_to_transfer {
            None => -1.0,
            Some(0) => 1.0,
            Some(total) => {
                let ratio = self.bytes_transferred as f64 / total as f64;
                ((ratio * 100.0).round() / 100.0).clamp(0.0, 1.0)
            }
        })
    }

    /// Whole seconds left at the current rate; zero when it cannot be estimated.
    pub fn estimated_time_remaining(&self) -> Duration {
        *self.estimate.get_or_init(|| match self.bytes_to_transfer {
            Some(total) if self.bytes_per_second > 0 => {
                let remaining = total.saturating_sub(self.bytes_transferred);
                Duration::from_secs(remaining / self.bytes_per_second)
            }
            _ => Duration::ZERO,
        })
    }
}

impl PartialEq for TransferProgress {
    fn eq(&self, other: &Self) -> bool {
        self.bytes_per_second == other.bytes_per_second
            && self.bytes_to_transfer == other.bytes_to_transfer
            && self.bytes_transferred == other.bytes_transferred
    }
}

/// Smoothed throughput over a sliding time window.
#[derive(Debug)]
pub struct ThroughputMeter {
    window: Duration,
    origin: Instant,
    samples: VecDeque<(Instant, u64)>,
}

impl ThroughputMeter {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            origin: now,
            samples: VecDeque::new(),
        }
    }

    /// Records `bytes` moved at `now`. Zero-byte heartbeats age the window.
    pub fn record(&mut self, bytes: u64, now: Instant) {
        if bytes > 0 {
            self.samples.push_back((now, bytes));
        }
        self.prune(now);
    }

    /// Average rate over the window, or since the origin if that is shorter.
    pub fn bytes_per_second(&self, now: Instant) -> u64 {
        let cutoff = now.checked_sub(self.window).unwrap_or(self.origin);
        let total: u64 = self
            .samples
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .map(|(_, bytes)| *bytes)
            .sum();
        if total == 0 {
            return 0;
        }
        let span = now.saturating_duration_since(self.origin).min(self.window);
        // Sub-millisecond spans would report absurd rates.
        let secs = span.as_secs_f64().max(0.001);
        (total as f64 / secs) as u64
    }

    /// Clears the window, as after a pause or a restart from byte 0.
    pub fn reset(&mut self, now: Instant) {
        self.samples.clear();
        self.origin = now;
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
