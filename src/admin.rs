//! Management Accessors
//!
//! The administrative surface of the membership core. Operator CLIs and
//! RPC layers are external; they drive the cluster through this thin
//! accessor set.

use std::collections::HashMap;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::gossip::{FailureDetector, Gossiper};
use crate::state::ApplicationKey;
use crate::topology::DynamicSnitch;

pub struct ClusterAdmin {
    gossiper: Arc<Gossiper>,
    failure_detector: Arc<FailureDetector>,
    snitch: Arc<DynamicSnitch>,
}

impl ClusterAdmin {
    pub fn new(
        gossiper: Arc<Gossiper>,
        failure_detector: Arc<FailureDetector>,
        snitch: Arc<DynamicSnitch>,
    ) -> Self {
        Self {
            gossiper,
            failure_detector,
            snitch,
        }
    }

    /// Current snitch score per endpoint
    pub fn scores(&self) -> HashMap<Endpoint, f64> {
        self.snitch.scores()
    }

    /// Raw latency timings held for a host
    pub fn dump_timings(&self, host: &str) -> Result<Vec<u64>> {
        let endpoint = Endpoint::parse(host)?;
        Ok(self.snitch.dump_timings(&endpoint))
    }

    /// Milliseconds the endpoint has been unreachable, 0 when live
    pub fn endpoint_downtime(&self, address: &str) -> Result<u64> {
        let endpoint = Endpoint::parse(address)?;
        Ok(self.gossiper.endpoint_downtime(&endpoint))
    }

    pub fn current_generation(&self, address: &str) -> Result<Option<i32>> {
        let endpoint = Endpoint::parse(address)?;
        Ok(self.gossiper.current_generation(&endpoint))
    }

    /// Human-readable dump of every known endpoint state
    pub fn all_endpoint_states(&self) -> String {
        self.gossiper.all_endpoint_states()
    }

    /// host -> "UP" | "DOWN"
    pub fn simple_states(&self) -> HashMap<String, String> {
        self.gossiper.simple_states()
    }

    pub fn up_endpoint_count(&self) -> usize {
        self.gossiper.up_endpoint_count()
    }

    pub fn down_endpoint_count(&self) -> usize {
        self.gossiper.down_endpoint_count()
    }

    pub fn phi_convict_threshold(&self) -> f64 {
        self.failure_detector.phi_convict_threshold()
    }

    pub fn set_phi_convict_threshold(&self, threshold: f64) {
        self.failure_detector.set_phi_convict_threshold(threshold);
    }

    /// Self-reported severity of the local node
    pub fn severity(&self) -> f64 {
        use crate::topology::SeveritySource;
        self.gossiper.severity_of(self.gossiper.local_endpoint())
    }

    /// Publish a severity value for the local node through gossip
    pub async fn set_severity(&self, severity: f64) {
        self.gossiper
            .apply_local_state(ApplicationKey::Severity, severity.to_string())
            .await;
    }

    /// Force-remove an endpoint from the ring. Blocks for ring_delay;
    /// strictly an operator action.
    pub async fn assassinate_endpoint(&self, address: &str) -> Result<()> {
        let endpoint = Endpoint::parse(address)?;
        self.gossiper.assassinate(&endpoint).await
    }
}
