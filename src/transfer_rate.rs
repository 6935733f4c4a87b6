//! A shared, rolling-window transfer rate counter.
//!
//! The original design threads a single `Common::TransferRateCalculator`
//! reference through every `Uploader`, so all concurrent uploads
//! contribute to one node-wide "bytes out per second" figure for UI
//! reporting. This keeps that shape: one [`TransferRateCalculator`],
//! cheaply cloneable, fed by every uploader and (for symmetry) every
//! `ChunkDownload` as bytes are transferred.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Inner {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

/// A cloneable handle to a rolling-window byte-rate counter.
#[derive(Clone)]
pub struct TransferRateCalculator {
    inner: Arc<Mutex<Inner>>,
}

impl TransferRateCalculator {
    /// `window` bounds how far back samples are kept when computing
    /// [`Self::rate`].
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                window,
                samples: VecDeque::new(),
            })),
        }
    }

    /// Records that `bytes` were just transferred.
    pub fn add_data(&self, bytes: u64) {
        let mut inner = self.inner.lock().expect("transfer rate lock poisoned");
        let now = Instant::now();
        let window = inner.window;
        inner.samples.push_back((now, bytes));
        while let Some(&(t, _)) = inner.samples.front() {
            if now.duration_since(t) > window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// The current throughput, in bytes/s, averaged over the window.
    pub fn rate(&self) -> f64 {
        let inner = self.inner.lock().expect("transfer rate lock poisoned");
        if inner.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = inner.samples.iter().map(|(_, b)| b).sum();
        let elapsed = inner
            .samples
            .front()
            .map(|(t, _)| Instant::now().duration_since(*t).as_secs_f64())
            .unwrap_or(0.0)
            .max(0.001);
        total as f64 / elapsed
    }
}

impl Default for TransferRateCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_reflects_recent_samples() {
        let calc = TransferRateCalculator::new(Duration::from_secs(5));
        calc.add_data(1000);
        calc.add_data(2000);
        assert!(calc.rate() > 0.0);
    }

    #[test]
    fn test_empty_rate_is_zero() {
        let calc = TransferRateCalculator::new(Duration::from_secs(5));
        assert_eq!(calc.rate(), 0.0);
    }

    #[test]
    fn test_old_samples_expire() {
        let calc = TransferRateCalculator::new(Duration::from_millis(1));
        calc.add_data(1000);
        std::thread::sleep(Duration::from_millis(20));
        calc.add_data(0);
        // forces pruning of the first sample on the next add_data call
        let inner = calc.inner.lock().unwrap();
        assert_eq!(inner.samples.len(), 1);
    }
}
