//! Endpoint Snitch
//!
//! The proximity oracle: answers where an endpoint lives and orders
//! peers by closeness for a given operation. The config snitch is the
//! static layer; the dynamic wrapper blends in measured latency.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::topology::metadata::TopologyMetaData;

pub trait Snitch: Send + Sync {
    fn datacenter_of(&self, endpoint: &Endpoint) -> String;

    fn rack_of(&self, endpoint: &Endpoint) -> String;

    /// Which of `a` and `b` is closer to `target`; ties are equal so a
    /// stable sort preserves the existing order
    fn compare_endpoints(&self, target: &Endpoint, a: &Endpoint, b: &Endpoint) -> Ordering;

    fn sort_by_proximity(&self, target: &Endpoint, endpoints: &mut Vec<Endpoint>) {
        endpoints.sort_by(|a, b| self.compare_endpoints(target, a, b));
    }

    /// Whether merging two token ranges into one query is expected to be
    /// cheaper than querying them separately
    fn is_worth_merging_for_range_query(
        &self,
        _merged: &[Endpoint],
        _l1: &[Endpoint],
        _l2: &[Endpoint],
    ) -> bool {
        true
    }

    /// Called once right before the gossiper starts
    fn gossiper_starting(&self) {}
}

/// Static topology knowledge: the local node's datacenter and rack come
/// from configuration, every other endpoint is answered from gossip-fed
/// topology metadata. Endpoints not seen yet report the local defaults,
/// so placement degrades to single-DC behavior during joins.
pub struct ConfigSnitch {
    local_datacenter: String,
    local_rack: String,
    topology: Arc<TopologyMetaData>,
}

impl ConfigSnitch {
    pub fn new(
        local_datacenter: impl Into<String>,
        local_rack: impl Into<String>,
        topology: Arc<TopologyMetaData>,
    ) -> Self {
        Self {
            local_datacenter: local_datacenter.into(),
            local_rack: local_rack.into(),
            topology,
        }
    }

    /// 0 = same endpoint, 1 = same rack, 2 = same datacenter, 3 = remote
    fn closeness(&self, target: &Endpoint, endpoint: &Endpoint) -> u8 {
        if endpoint == target {
            return 0;
        }
        let target_dc = self.datacenter_of(target);
        let endpoint_dc = self.datacenter_of(endpoint);
        if target_dc != endpoint_dc {
            return 3;
        }
        if self.rack_of(target) == self.rack_of(endpoint) {
            1
        } else {
            2
        }
    }
}

impl Snitch for ConfigSnitch {
    fn datacenter_of(&self, endpoint: &Endpoint) -> String {
        self.topology
            .datacenter_of(endpoint)
            .unwrap_or_else(|| self.local_datacenter.clone())
    }

    fn rack_of(&self, endpoint: &Endpoint) -> String {
        self.topology
            .rack_of(endpoint)
            .unwrap_or_else(|| self.local_rack.clone())
    }

    fn compare_endpoints(&self, target: &Endpoint, a: &Endpoint, b: &Endpoint) -> Ordering {
        self.closeness(target, a).cmp(&self.closeness(target, b))
    }
}
