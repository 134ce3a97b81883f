use std::time::Duration;

use tokio::time::Instant;

/// One progress report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    /// 0.0 to 100.0.
    pub percent: f64,
    /// Projected time remaining; `None` until a byte has moved.
    pub eta: Option<Duration>,
    pub bytes: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        self.percent / 100.0
    }
}

/// Fraction of `total` covered by `bytes`, clamped to `[0, 1]`.
///
/// An empty transfer counts as complete.
pub fn completion_fraction(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (bytes as f64 / total as f64).min(1.0)
}

/// Extrapolates time remaining from the elapsed time and bytes moved.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    started: Instant,
    total: u64,
}

impl ProgressEstimator {
    /// Starts the clock for a transfer of `total` bytes.
    pub fn new(total: u64) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Progress after `bytes` have moved.
    ///
    /// `eta = elapsed * (total / bytes - 1)`, left undefined at zero bytes
    /// and when the projection does not fit in a `Duration`.
    pub fn estimate(&self, bytes: u64) -> TransferProgress {
        let fraction = completion_fraction(bytes, self.total);
        let eta = if bytes > 0 {
            let elapsed = self.started.elapsed().as_secs_f64();
            let remaining = elapsed * (self.total as f64 / bytes as f64 - 1.0);
            Duration::try_from_secs_f64(remaining.max(0.0)).ok()
        } else {
            None
        };
        TransferProgress {
            percent: fraction * 100.0,
            eta,
            bytes,
            total: self.total,
        }
    }
}
