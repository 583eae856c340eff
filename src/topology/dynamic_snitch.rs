//! Dynamic Endpoint Snitch
//!
//! Wraps a static snitch with measured latency. Every RPC completion
//! feeds an exponentially decaying sample per endpoint; a periodic task
//! turns the windowed medians into a score map (each median divided by
//! the cluster-wide maximum, plus the peer's self-reported severity).
//! Lowest score wins. A full sample reset every few minutes gives hosts
//! that went bad a chance to recover.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::clock::MonotonicClock;
use crate::endpoint::Endpoint;
use crate::topology::snitch::Snitch;

/// Biases the decaying sample towards newer values; fixed across versions
const ALPHA: f64 = 0.75;
/// Sample reservoir size; fixed across versions
const WINDOW_SIZE: usize = 100;
/// A merged range must score no worse than this multiple of the separate
/// ranges to be worth querying as one
const RANGE_MERGING_PREFERENCE: f64 = 1.5;
/// Rescale the decay landmark after this long to keep weights bounded
const RESCALE_AFTER: Duration = Duration::from_secs(3600);

/// Receives per-message latency samples from the transport
pub trait LatencySubscriber: Send + Sync {
    fn receive_timing(&self, endpoint: &Endpoint, latency_nanos: u64);
}

/// Supplies the self-reported severity of a peer (an opaque load signal
/// written by the storage layer into gossip)
pub trait SeveritySource: Send + Sync {
    fn severity_of(&self, endpoint: &Endpoint) -> f64;
}

#[derive(Debug, Clone)]
pub struct DynamicSnitchConfig {
    /// How often the score map is rebuilt
    pub update_interval: Duration,
    /// How often all samples are discarded
    pub reset_interval: Duration,
    /// 0 means pure score order; otherwise the static order survives
    /// until some endpoint is worse than the sorted score by this factor
    pub badness_threshold: f64,
}

impl Default for DynamicSnitchConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_millis(100),
            reset_interval: Duration::from_secs(600),
            badness_threshold: 0.1,
        }
    }
}

pub struct DynamicSnitch {
    subsnitch: Arc<dyn Snitch>,
    severity: Arc<dyn SeveritySource>,
    config: DynamicSnitchConfig,
    clock: MonotonicClock,
    scores: StdRwLock<HashMap<Endpoint, f64>>,
    samples: StdMutex<HashMap<Endpoint, DecayingSample>>,
    running: watch::Sender<bool>,
}

impl DynamicSnitch {
    pub fn new(
        subsnitch: Arc<dyn Snitch>,
        severity: Arc<dyn SeveritySource>,
        config: DynamicSnitchConfig,
        clock: MonotonicClock,
    ) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        Arc::new(Self {
            subsnitch,
            severity,
            config,
            clock,
            scores: StdRwLock::new(HashMap::new()),
            samples: StdMutex::new(HashMap::new()),
            running,
        })
    }

    pub fn subsnitch(&self) -> &Arc<dyn Snitch> {
        &self.subsnitch
    }

    /// Spawn the score-update and reset timers
    pub fn start(self: Arc<Self>) {
        self.running.send_replace(true);

        let snitch = self.clone();
        let mut shutdown = self.running.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(snitch.config.update_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => snitch.update_scores(),
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let snitch = self;
        let mut shutdown = snitch.running.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(snitch.config.reset_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => snitch.reset_samples(),
                    _ = shutdown.changed() => {
                        if !*shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.send_replace(false);
    }

    /// Record one latency observation; cheap enough for every message
    pub fn receive_timing(&self, endpoint: &Endpoint, latency_nanos: u64) {
        let now = self.clock.now_nanos();
        let mut samples = self.samples.lock().unwrap();
        samples
            .entry(endpoint.clone())
            .or_insert_with(|| DecayingSample::new(now))
            .update(latency_nanos, now, &mut rand::thread_rng());
    }

    /// Rebuild the score map from the windowed medians. Each endpoint is
    /// weighted against the worst median seen, then its severity is added
    /// unweighted; the lowest score wins.
    pub fn update_scores(&self) {
        let medians: Vec<(Endpoint, f64)> = {
            let samples = self.samples.lock().unwrap();
            samples
                .iter()
                .filter_map(|(endpoint, sample)| {
                    sample.median().map(|median| (endpoint.clone(), median))
                })
                .collect()
        };

        let mut max_latency: f64 = 1.0;
        for (_, median) in &medians {
            if *median > max_latency {
                max_latency = *median;
            }
        }

        let mut scores = self.scores.write().unwrap();
        for (endpoint, median) in medians {
            let mut score = median / max_latency;
            score += self.severity.severity_of(&endpoint);
            scores.insert(endpoint, score);
        }
    }

    /// Drop every sample so previously bad hosts get a chance to recover
    pub fn reset_samples(&self) {
        let now = self.clock.now_nanos();
        let mut samples = self.samples.lock().unwrap();
        for sample in samples.values_mut() {
            sample.clear(now);
        }
    }

    pub fn scores(&self) -> HashMap<Endpoint, f64> {
        self.scores.read().unwrap().clone()
    }

    pub fn badness_threshold(&self) -> f64 {
        self.config.badness_threshold
    }

    /// Raw timings currently held for an endpoint, for diagnostics
    pub fn dump_timings(&self, endpoint: &Endpoint) -> Vec<u64> {
        self.samples
            .lock()
            .unwrap()
            .get(endpoint)
            .map(|sample| sample.values())
            .unwrap_or_default()
    }

    fn score_of(&self, endpoint: &Endpoint) -> Option<f64> {
        self.scores.read().unwrap().get(endpoint).copied()
    }

    fn sort_by_proximity_with_score(&self, target: &Endpoint, endpoints: &mut Vec<Endpoint>) {
        endpoints.sort_by(|a, b| self.compare_endpoints(target, a, b));
    }

    /// Keep the static order unless some endpoint scores worse than its
    /// score-sorted counterpart by more than the badness factor
    fn sort_by_proximity_with_badness(&self, target: &Endpoint, endpoints: &mut Vec<Endpoint>) {
        if endpoints.len() < 2 {
            return;
        }

        self.subsnitch.sort_by_proximity(target, endpoints);
        let mut subsnitch_ordered_scores = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter() {
            match self.score_of(endpoint) {
                Some(score) => subsnitch_ordered_scores.push(score),
                // missing a score: stay with the static order
                None => return,
            }
        }

        let mut sorted_scores = subsnitch_ordered_scores.clone();
        sorted_scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        for (subsnitch_score, sorted_score) in
            subsnitch_ordered_scores.iter().zip(sorted_scores.iter())
        {
            if *subsnitch_score > sorted_score * (1.0 + self.config.badness_threshold) {
                self.sort_by_proximity_with_score(target, endpoints);
                return;
            }
        }
    }

    /// Greatest score among the endpoints, or -1.0 when none has one
    fn max_score(&self, endpoints: &[Endpoint]) -> f64 {
        let scores = self.scores.read().unwrap();
        let mut max_score = -1.0f64;
        for endpoint in endpoints {
            if let Some(score) = scores.get(endpoint) {
                if *score > max_score {
                    max_score = *score;
                }
            }
        }
        max_score
    }
}

impl Snitch for DynamicSnitch {
    fn datacenter_of(&self, endpoint: &Endpoint) -> String {
        self.subsnitch.datacenter_of(endpoint)
    }

    fn rack_of(&self, endpoint: &Endpoint) -> String {
        self.subsnitch.rack_of(endpoint)
    }

    fn compare_endpoints(&self, target: &Endpoint, a: &Endpoint, b: &Endpoint) -> Ordering {
        let score_a = self.score_of(a).unwrap_or_else(|| {
            // unknown endpoints score 0 and get a seed sample so the next
            // update round learns about them
            self.receive_timing(a, 0);
            0.0
        });
        let score_b = self.score_of(b).unwrap_or_else(|| {
            self.receive_timing(b, 0);
            0.0
        });

        if score_a == score_b {
            self.subsnitch.compare_endpoints(target, a, b)
        } else {
            score_a.partial_cmp(&score_b).unwrap_or(Ordering::Equal)
        }
    }

    fn sort_by_proximity(&self, target: &Endpoint, endpoints: &mut Vec<Endpoint>) {
        if self.config.badness_threshold == 0.0 {
            self.sort_by_proximity_with_score(target, endpoints);
        } else {
            self.sort_by_proximity_with_badness(target, endpoints);
        }
    }

    fn is_worth_merging_for_range_query(
        &self,
        merged: &[Endpoint],
        l1: &[Endpoint],
        l2: &[Endpoint],
    ) -> bool {
        if !self.subsnitch.is_worth_merging_for_range_query(merged, l1, l2) {
            return false;
        }

        // skip checking scores in the single-node case
        if l1.len() == 1 && l2.len() == 1 && l1[0] == l2[0] {
            return true;
        }

        // without enough scores, return the subsnitch decision
        let max_merged = self.max_score(merged);
        let max_l1 = self.max_score(l1);
        let max_l2 = self.max_score(l2);
        if max_merged < 0.0 || max_l1 < 0.0 || max_l2 < 0.0 {
            return true;
        }

        max_merged <= (max_l1 + max_l2) * RANGE_MERGING_PREFERENCE
    }
}

impl LatencySubscriber for DynamicSnitch {
    fn receive_timing(&self, endpoint: &Endpoint, latency_nanos: u64) {
        DynamicSnitch::receive_timing(self, endpoint, latency_nanos);
    }
}

/// Forward-decaying reservoir sample: newer observations carry
/// exponentially more weight, so the median tracks recent latency
struct DecayingSample {
    /// (priority, value); the lowest priority is evicted first
    entries: Vec<(f64, u64)>,
    landmark_nanos: u64,
}

impl DecayingSample {
    fn new(now_nanos: u64) -> Self {
        Self {
            entries: Vec::with_capacity(WINDOW_SIZE),
            landmark_nanos: now_nanos,
        }
    }

    fn update(&mut self, value: u64, now_nanos: u64, rng: &mut impl Rng) {
        let elapsed = now_nanos.saturating_sub(self.landmark_nanos);
        if elapsed > RESCALE_AFTER.as_nanos() as u64 {
            self.rescale(now_nanos);
        }

        let age_secs = now_nanos.saturating_sub(self.landmark_nanos) as f64 / 1e9;
        let weight = (ALPHA * age_secs).exp();
        // (0, 1] so the division cannot blow up
        let uniform = 1.0 - rng.gen::<f64>();
        let priority = weight / uniform;

        if self.entries.len() < WINDOW_SIZE {
            self.entries.push((priority, value));
            return;
        }
        let (min_index, min_priority) = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, (p, _))| (index, *p))
            .fold((0, f64::MAX), |acc, item| {
                if item.1 < acc.1 {
                    item
                } else {
                    acc
                }
            });
        if priority > min_priority {
            self.entries[min_index] = (priority, value);
        }
    }

    fn rescale(&mut self, now_nanos: u64) {
        let age_secs = now_nanos.saturating_sub(self.landmark_nanos) as f64 / 1e9;
        let factor = (-ALPHA * age_secs).exp();
        for (priority, _) in &mut self.entries {
            *priority *= factor;
        }
        self.landmark_nanos = now_nanos;
    }

    fn clear(&mut self, now_nanos: u64) {
        self.entries.clear();
        self.landmark_nanos = now_nanos;
    }

    fn values(&self) -> Vec<u64> {
        self.entries.iter().map(|(_, value)| *value).collect()
    }

    fn median(&self) -> Option<f64> {
        if self.entries.is_empty() {
            return None;
        }
        let mut values = self.values();
        values.sort_unstable();
        let mid = values.len() / 2;
        if values.len() % 2 == 1 {
            Some(values[mid] as f64)
        } else {
            Some((values[mid - 1] as f64 + values[mid] as f64) / 2.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::metadata::TopologyMetaData;
    use crate::topology::snitch::ConfigSnitch;

    fn ep(host: &str) -> Endpoint {
        Endpoint::new(host, 7946)
    }

    struct FixedSeverity(HashMap<Endpoint, f64>);

    impl SeveritySource for FixedSeverity {
        fn severity_of(&self, endpoint: &Endpoint) -> f64 {
            self.0.get(endpoint).copied().unwrap_or(0.0)
        }
    }

    fn snitch_with(
        badness_threshold: f64,
        severity: HashMap<Endpoint, f64>,
    ) -> Arc<DynamicSnitch> {
        let topology = Arc::new(TopologyMetaData::new());
        let subsnitch = Arc::new(ConfigSnitch::new("east", "r1", topology));
        DynamicSnitch::new(
            subsnitch,
            Arc::new(FixedSeverity(severity)),
            DynamicSnitchConfig {
                badness_threshold,
                ..DynamicSnitchConfig::default()
            },
            MonotonicClock::new(),
        )
    }

    fn feed(snitch: &DynamicSnitch, endpoint: &Endpoint, latency_nanos: u64, count: usize) {
        for _ in 0..count {
            snitch.receive_timing(endpoint, latency_nanos);
        }
    }

    #[test]
    fn test_scores_weight_median_against_worst() {
        let snitch = snitch_with(0.1, HashMap::new());
        let fast = ep("10.0.0.1");
        let slow = ep("10.0.0.2");
        feed(&snitch, &fast, 100_000, 20);
        feed(&snitch, &slow, 200_000, 20);

        snitch.update_scores();
        let scores = snitch.scores();
        assert!((scores[&fast] - 0.5).abs() < 1e-9);
        assert!((scores[&slow] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_severity_is_added_unweighted() {
        let loaded = ep("10.0.0.2");
        let mut severity = HashMap::new();
        severity.insert(loaded.clone(), 0.5);
        let snitch = snitch_with(0.1, severity);
        let calm = ep("10.0.0.1");
        feed(&snitch, &calm, 100_000, 20);
        feed(&snitch, &loaded, 100_000, 20);

        snitch.update_scores();
        let scores = snitch.scores();
        assert!((scores[&calm] - 1.0).abs() < 1e-9);
        assert!((scores[&loaded] - 1.5).abs() < 1e-9);
    }

    // Static order [A, B, C] with scores {A: 1.0, B: 5.0, C: 2.0} and a
    // badness threshold of 0.1: B at position 1 exceeds the sorted score
    // 2.0 x 1.1, so the sort falls back to pure score order [A, C, B].
    #[test]
    fn test_badness_fallback_rewrites_order() {
        let snitch = snitch_with(0.1, HashMap::new());
        let a = ep("10.0.0.1");
        let b = ep("10.0.0.2");
        let c = ep("10.0.0.3");
        {
            let mut scores = snitch.scores.write().unwrap();
            scores.insert(a.clone(), 1.0);
            scores.insert(b.clone(), 5.0);
            scores.insert(c.clone(), 2.0);
        }

        let mut endpoints = vec![a.clone(), b.clone(), c.clone()];
        snitch.sort_by_proximity(&a, &mut endpoints);
        assert_eq!(endpoints, vec![a, c, b]);
    }

    #[test]
    fn test_static_order_survives_within_threshold() {
        let snitch = snitch_with(0.1, HashMap::new());
        let a = ep("10.0.0.1");
        let b = ep("10.0.0.2");
        let c = ep("10.0.0.3");
        {
            let mut scores = snitch.scores.write().unwrap();
            scores.insert(a.clone(), 1.0);
            scores.insert(b.clone(), 1.05);
            scores.insert(c.clone(), 1.08);
        }

        let mut endpoints = vec![a.clone(), b.clone(), c.clone()];
        snitch.sort_by_proximity(&a, &mut endpoints);
        assert_eq!(endpoints, vec![a, b, c]);
    }

    #[test]
    fn test_missing_score_keeps_static_order() {
        let snitch = snitch_with(0.1, HashMap::new());
        let a = ep("10.0.0.1");
        let b = ep("10.0.0.2");
        {
            let mut scores = snitch.scores.write().unwrap();
            scores.insert(a.clone(), 9.0);
        }

        let mut endpoints = vec![a.clone(), b.clone()];
        snitch.sort_by_proximity(&a, &mut endpoints);
        assert_eq!(endpoints, vec![a, b]);
    }

    #[test]
    fn test_zero_threshold_uses_pure_score_order() {
        let snitch = snitch_with(0.0, HashMap::new());
        let a = ep("10.0.0.1");
        let b = ep("10.0.0.2");
        {
            let mut scores = snitch.scores.write().unwrap();
            scores.insert(a.clone(), 3.0);
            scores.insert(b.clone(), 1.0);
        }

        let mut endpoints = vec![a.clone(), b.clone()];
        snitch.sort_by_proximity(&a, &mut endpoints);
        assert_eq!(endpoints, vec![b, a]);
    }

    #[test]
    fn test_unknown_endpoint_scores_zero_and_gets_seeded() {
        let snitch = snitch_with(0.0, HashMap::new());
        let known = ep("10.0.0.1");
        let unknown = ep("10.0.0.2");
        {
            let mut scores = snitch.scores.write().unwrap();
            scores.insert(known.clone(), 2.0);
        }

        let mut endpoints = vec![known.clone(), unknown.clone()];
        snitch.sort_by_proximity(&known, &mut endpoints);
        assert_eq!(endpoints, vec![unknown.clone(), known]);
        // the comparison seeded a zero-latency sample
        assert_eq!(snitch.dump_timings(&unknown), vec![0]);
    }

    #[test]
    fn test_is_worth_merging() {
        let snitch = snitch_with(0.1, HashMap::new());
        let a = ep("10.0.0.1");
        let b = ep("10.0.0.2");

        // single-node case
        assert!(snitch.is_worth_merging_for_range_query(
            &[a.clone()],
            &[a.clone()],
            &[a.clone()]
        ));

        // no scores at all: cannot decide, so merge
        assert!(snitch.is_worth_merging_for_range_query(
            &[a.clone(), b.clone()],
            &[a.clone()],
            &[b.clone()]
        ));

        {
            let mut scores = snitch.scores.write().unwrap();
            scores.insert(a.clone(), 1.0);
            scores.insert(b.clone(), 10.0);
        }
        // merged max 10 <= (1 + 10) * 1.5
        assert!(snitch.is_worth_merging_for_range_query(
            &[a.clone(), b.clone()],
            &[a.clone()],
            &[b.clone()]
        ));
        // merged max 10 > (1 + 1) * 1.5 when both halves are fast
        assert!(!snitch.is_worth_merging_for_range_query(
            &[a.clone(), b.clone()],
            &[a.clone()],
            &[a.clone(), a.clone()]
        ));
    }

    #[test]
    fn test_reset_clears_samples_but_keeps_scores() {
        let snitch = snitch_with(0.1, HashMap::new());
        let a = ep("10.0.0.1");
        feed(&snitch, &a, 100_000, 10);
        snitch.update_scores();
        assert!(!snitch.dump_timings(&a).is_empty());

        snitch.reset_samples();
        assert!(snitch.dump_timings(&a).is_empty());
        assert!(snitch.scores().contains_key(&a));
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let snitch = snitch_with(0.1, HashMap::new());
        let a = ep("10.0.0.1");
        feed(&snitch, &a, 100_000, WINDOW_SIZE * 3);
        assert!(snitch.dump_timings(&a).len() <= WINDOW_SIZE);
    }
}
