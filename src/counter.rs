//! Throughput tracking for a single peer connection.
//!
//! The choking algorithm ranks peers by a short-window estimate of their
//! download rate, so each session keeps an exponentially time-weighted
//! moving average of the bytes it exchanges with its peer, alongside the
//! running totals needed for the upload ratio.

use std::time::Instant;

/// Width of the EWMA window, in seconds.
const TIME_WINDOW_SECS: f64 = 20.0;

/// An exponentially time-weighted moving average of a byte rate, plus the
/// running total of bytes seen.
#[derive(Debug)]
pub(crate) struct ThruputCounter {
    rate: f64,
    total: u64,
    last_update: Instant,
}

impl ThruputCounter {
    pub fn new() -> Self {
        Self {
            rate: 0.0,
            total: 0,
            last_update: Instant::now(),
        }
    }

    /// Folds `bytes` transferred just now into the running rate estimate.
    pub fn update(&mut self, bytes: u64) {
        let now = Instant::now();
        // guard against a near-zero delta inflating the instantaneous rate
        let dt = now.duration_since(self.last_update).as_secs_f64().max(0.001);
        let weight = (-dt / TIME_WINDOW_SECS).exp();
        let instant_rate = bytes as f64 / dt;
        self.rate = (self.rate * weight + instant_rate) / (weight + 1.0);
        self.total += bytes;
        self.last_update = now;
    }

    /// The current estimated rate, in bytes/sec.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// The total number of bytes recorded so far.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Default for ThruputCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-peer transfer statistics used by the choking algorithm.
#[derive(Debug, Default)]
pub(crate) struct PeerStats {
    downloaded: ThruputCounter,
    uploaded: ThruputCounter,
}

impl PeerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.downloaded.update(bytes);
    }

    pub fn record_upload(&mut self, bytes: u64) {
        self.uploaded.update(bytes);
    }

    /// EWMA download rate in bytes/sec, used to rank peers for the regular
    /// unchoke round.
    pub fn download_rate(&self) -> f64 {
        self.downloaded.rate()
    }

    /// Bytes uploaded to this peer divided by bytes downloaded from them.
    /// `+inf` when we haven't downloaded anything from them yet, so a peer
    /// we've given plenty to but gotten nothing from ranks as maximally
    /// unfavorable.
    pub fn upload_ratio(&self) -> f64 {
        let downloaded = self.downloaded.total();
        if downloaded == 0 {
            f64::INFINITY
        } else {
            self.uploaded.total() as f64 / downloaded as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_ratio_is_infinite_with_no_downloads() {
        let mut stats = PeerStats::new();
        stats.record_upload(1024);
        assert!(stats.upload_ratio().is_infinite());
    }

    #[test]
    fn test_upload_ratio_is_finite_once_downloaded() {
        let mut stats = PeerStats::new();
        stats.record_download(1024);
        stats.record_upload(512);
        assert!((stats.upload_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_download_rate_accumulates() {
        let mut counter = ThruputCounter::new();
        counter.update(16384);
        assert!(counter.rate() > 0.0);
        assert_eq!(counter.total(), 16384);
    }
}
