//! Phi-Accrual Failure Detector
//!
//! Liveness estimation from heartbeat arrival intervals, after
//! "The Phi Accrual Failure Detector" (Hayashibara et al.). Each endpoint
//! gets a bounded window of inter-arrival intervals; `interpret` divides
//! the time since the last arrival by the window mean and convicts when
//! the scaled value exceeds the configured threshold.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::clock::MonotonicClock;
use crate::endpoint::Endpoint;

/// Bound on the arrival window, fixed across versions
pub const SAMPLE_SIZE: usize = 1000;

/// Kept so that operators accustomed to the default threshold of 8 need
/// not retune: phi is scaled by 1/ln(10) before the comparison.
const PHI_FACTOR: f64 = 1.0 / std::f64::consts::LN_10;

/// A conviction verdict carrying the phi value that crossed the threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conviction {
    pub phi: f64,
}

/// Failure detector timing parameters
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// Seed interval for a window with no samples yet
    pub initial_value_nanos: u64,
    /// Intervals longer than this are discarded, so long partitions do
    /// not poison the mean
    pub max_interval_nanos: u64,
    /// Conviction threshold, compared against phi x 1/ln(10)
    pub phi_convict_threshold: f64,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        // 2 x the gossip period
        let initial = 2_000_000_000;
        Self {
            initial_value_nanos: initial,
            max_interval_nanos: initial,
            phi_convict_threshold: 8.0,
        }
    }
}

pub struct FailureDetector {
    clock: MonotonicClock,
    initial_value_nanos: u64,
    max_interval_nanos: u64,
    /// f64 bits, so the admin surface can adjust it at runtime
    phi_convict_threshold: AtomicU64,
    samples: Mutex<HashMap<Endpoint, ArrivalWindow>>,
}

impl FailureDetector {
    pub fn new(config: FailureDetectorConfig, clock: MonotonicClock) -> Self {
        Self {
            clock,
            initial_value_nanos: config.initial_value_nanos,
            max_interval_nanos: config.max_interval_nanos,
            phi_convict_threshold: AtomicU64::new(config.phi_convict_threshold.to_bits()),
            samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn phi_convict_threshold(&self) -> f64 {
        f64::from_bits(self.phi_convict_threshold.load(Ordering::SeqCst))
    }

    pub fn set_phi_convict_threshold(&self, threshold: f64) {
        self.phi_convict_threshold
            .store(threshold.to_bits(), Ordering::SeqCst);
    }

    /// Record a heartbeat arrival at the current time. The window is
    /// created lazily and seeded with the initial interval.
    pub fn report(&self, endpoint: &Endpoint) {
        self.report_at(endpoint, self.clock.now_nanos());
    }

    fn report_at(&self, endpoint: &Endpoint, now_nanos: u64) {
        tracing::trace!("reporting {}", endpoint);
        let mut samples = self.samples.lock().unwrap();
        samples
            .entry(endpoint.clone())
            .or_insert_with(|| ArrivalWindow::new(self.initial_value_nanos, self.max_interval_nanos))
            .add(now_nanos);
    }

    /// Estimate liveness at the current time. Unknown endpoints are a
    /// no-op.
    pub fn interpret(&self, endpoint: &Endpoint) -> Option<Conviction> {
        self.interpret_at(endpoint, self.clock.now_nanos())
    }

    fn interpret_at(&self, endpoint: &Endpoint, now_nanos: u64) -> Option<Conviction> {
        let samples = self.samples.lock().unwrap();
        let window = samples.get(endpoint)?;
        let phi = window.phi(now_nanos);
        tracing::trace!("phi for {} : {}", endpoint, phi);
        if PHI_FACTOR * phi > self.phi_convict_threshold() {
            Some(Conviction { phi })
        } else {
            None
        }
    }

    /// Conviction verdict without consulting any window. The operator
    /// paths use this to force a node down.
    pub fn force_conviction(&self, endpoint: &Endpoint) -> Conviction {
        tracing::debug!("forcing conviction of {}", endpoint);
        Conviction {
            phi: self.phi_convict_threshold(),
        }
    }

    /// Drop the window, typically on generation change or removal
    pub fn remove(&self, endpoint: &Endpoint) {
        self.samples.lock().unwrap().remove(endpoint);
    }

    pub fn is_known(&self, endpoint: &Endpoint) -> bool {
        self.samples.lock().unwrap().contains_key(endpoint)
    }

    /// Current intervals for an endpoint, for diagnostics
    pub fn intervals(&self, endpoint: &Endpoint) -> Vec<u64> {
        self.samples
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|w| w.intervals.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Bounded FIFO window of inter-arrival intervals with a running sum
struct ArrivalWindow {
    last_arrival_nanos: u64,
    intervals: VecDeque<u64>,
    sum: u64,
    initial_value_nanos: u64,
    max_interval_nanos: u64,
}

impl ArrivalWindow {
    fn new(initial_value_nanos: u64, max_interval_nanos: u64) -> Self {
        Self {
            last_arrival_nanos: 0,
            intervals: VecDeque::with_capacity(SAMPLE_SIZE),
            sum: 0,
            initial_value_nanos,
            max_interval_nanos,
        }
    }

    fn add(&mut self, now_nanos: u64) {
        if self.last_arrival_nanos > 0 {
            let interval = now_nanos.saturating_sub(self.last_arrival_nanos);
            if interval <= self.max_interval_nanos {
                self.push(interval);
            } else {
                tracing::debug!("ignoring interval time of {}ns", interval);
            }
        } else {
            // Err high on the first arrival: false negatives correct
            // themselves by waiting, false positives cause flapping.
            self.push(self.initial_value_nanos);
        }
        self.last_arrival_nanos = now_nanos;
    }

    fn push(&mut self, interval: u64) {
        while self.intervals.len() >= SAMPLE_SIZE {
            let evicted = self.intervals.pop_front().unwrap();
            self.sum -= evicted;
        }
        self.intervals.push_back(interval);
        self.sum += interval;
    }

    fn mean(&self) -> f64 {
        self.sum as f64 / self.intervals.len() as f64
    }

    fn phi(&self, now_nanos: u64) -> f64 {
        // not meaningful before the first arrival seeds the window
        debug_assert!(!self.intervals.is_empty() && self.last_arrival_nanos > 0);
        let elapsed = now_nanos.saturating_sub(self.last_arrival_nanos);
        elapsed as f64 / self.mean()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MILLIS: u64 = 1_000_000;

    fn detector() -> FailureDetector {
        FailureDetector::new(FailureDetectorConfig::default(), MonotonicClock::new())
    }

    #[test]
    fn test_interpret_unknown_endpoint_is_noop() {
        let fd = detector();
        assert!(fd.interpret(&Endpoint::new("10.0.0.9", 7946)).is_none());
    }

    #[test]
    fn test_first_report_seeds_initial_interval() {
        let fd = detector();
        let ep = Endpoint::new("10.0.0.1", 7946);
        fd.report_at(&ep, 5_000 * MILLIS);
        let intervals = fd.intervals(&ep);
        assert_eq!(intervals, vec![2_000 * MILLIS]);
    }

    #[test]
    fn test_long_intervals_are_discarded() {
        let fd = detector();
        let ep = Endpoint::new("10.0.0.1", 7946);
        fd.report_at(&ep, 1_000 * MILLIS);
        // 10 s gap, far beyond the 2 s maximum: dropped from the window
        fd.report_at(&ep, 11_000 * MILLIS);
        assert_eq!(fd.intervals(&ep).len(), 1);
        // but the arrival stamp advanced, so a normal interval records
        fd.report_at(&ep, 12_000 * MILLIS);
        assert_eq!(fd.intervals(&ep).len(), 2);
    }

    // Heartbeats at 1000 ms for 1000 samples, then silence. With the
    // default threshold of 8, conviction happens once the silence
    // exceeds 8000 x ln(10) ~ 18421 ms.
    #[test]
    fn test_phi_conviction_at_threshold() {
        let fd = detector();
        let ep = Endpoint::new("10.0.0.1", 7946);
        let mut now = 0u64;
        for _ in 0..=1000 {
            now += 1_000 * MILLIS;
            fd.report_at(&ep, now);
        }
        // the initial 2 s seed has been evicted: all intervals are 1 s
        let intervals = fd.intervals(&ep);
        assert_eq!(intervals.len(), SAMPLE_SIZE);
        assert!(intervals.iter().all(|i| *i == 1_000 * MILLIS));

        let last = now;
        assert!(fd.interpret_at(&ep, last + 18_420 * MILLIS).is_none());
        let conviction = fd.interpret_at(&ep, last + 18_421 * MILLIS).unwrap();
        assert!(conviction.phi > 18.420 && conviction.phi < 18.422);
    }

    #[test]
    fn test_threshold_is_adjustable() {
        let fd = detector();
        let ep = Endpoint::new("10.0.0.1", 7946);
        fd.report_at(&ep, 1_000 * MILLIS);
        fd.report_at(&ep, 2_000 * MILLIS);

        fd.set_phi_convict_threshold(1.0);
        // mean is 1.5 s; 4 s of silence gives phi ~ 2.67, scaled ~ 1.16
        assert!(fd.interpret_at(&ep, 6_000 * MILLIS).is_some());

        fd.set_phi_convict_threshold(8.0);
        assert!(fd.interpret_at(&ep, 6_000 * MILLIS).is_none());
    }

    #[test]
    fn test_remove_clears_window() {
        let fd = detector();
        let ep = Endpoint::new("10.0.0.1", 7946);
        fd.report_at(&ep, 1_000 * MILLIS);
        assert!(fd.is_known(&ep));
        fd.remove(&ep);
        assert!(!fd.is_known(&ep));
        assert!(fd.interpret_at(&ep, 60_000 * MILLIS).is_none());
    }

    #[test]
    fn test_window_is_bounded() {
        let fd = detector();
        let ep = Endpoint::new("10.0.0.1", 7946);
        let mut now = 0u64;
        for _ in 0..(SAMPLE_SIZE + 500) {
            now += 100 * MILLIS;
            fd.report_at(&ep, now);
        }
        assert_eq!(fd.intervals(&ep).len(), SAMPLE_SIZE);
    }
}
