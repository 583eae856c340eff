//! Topology Metadata
//!
//! Cluster-wide map of endpoint -> (datacenter, rack) and host-id ->
//! endpoint, with derived per-datacenter and per-rack indexes. Updates
//! are driven by subscribers of the failure-event bus as members join
//! and leave; placement queries take a consistent snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use crate::endpoint::Endpoint;

/// Where an endpoint lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub datacenter: String,
    pub rack: String,
}

/// An immutable, consistent view of the topology
#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    locations: HashMap<Endpoint, Location>,
    host_ids: BTreeMap<String, Endpoint>,
    dc_endpoints: HashMap<String, BTreeSet<Endpoint>>,
    dc_racks: HashMap<String, HashMap<String, BTreeSet<Endpoint>>>,
}

impl TopologySnapshot {
    pub fn datacenter_of(&self, endpoint: &Endpoint) -> Option<&str> {
        self.locations
            .get(endpoint)
            .map(|location| location.datacenter.as_str())
    }

    pub fn rack_of(&self, endpoint: &Endpoint) -> Option<&str> {
        self.locations
            .get(endpoint)
            .map(|location| location.rack.as_str())
    }

    pub fn is_member(&self, endpoint: &Endpoint) -> bool {
        self.locations.contains_key(endpoint)
    }

    pub fn endpoints_in(&self, datacenter: &str) -> Option<&BTreeSet<Endpoint>> {
        self.dc_endpoints.get(datacenter)
    }

    pub fn racks_in(&self, datacenter: &str) -> Option<&HashMap<String, BTreeSet<Endpoint>>> {
        self.dc_racks.get(datacenter)
    }

    pub fn datacenter_endpoints(&self) -> &HashMap<String, BTreeSet<Endpoint>> {
        &self.dc_endpoints
    }

    pub fn datacenter_racks(&self) -> &HashMap<String, HashMap<String, BTreeSet<Endpoint>>> {
        &self.dc_racks
    }

    /// Host ids in sorted order; placement walks this ring
    pub fn sorted_host_ids(&self) -> impl Iterator<Item = &str> {
        self.host_ids.keys().map(|id| id.as_str())
    }

    pub fn endpoint_for_host_id(&self, host_id: &str) -> Option<&Endpoint> {
        self.host_ids.get(host_id)
    }

    pub fn member_count(&self) -> usize {
        self.locations.len()
    }
}

/// Mutable topology registry shared across components
#[derive(Debug, Default)]
pub struct TopologyMetaData {
    inner: RwLock<TopologySnapshot>,
}

impl TopologyMetaData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or relocate a member. A previous location for the same
    /// endpoint is removed from the derived indexes first.
    pub fn add_member(
        &self,
        endpoint: &Endpoint,
        datacenter: &str,
        rack: &str,
        host_id: Option<&str>,
    ) {
        let mut inner = self.inner.write().unwrap();
        Self::unindex(&mut inner, endpoint);

        inner.locations.insert(
            endpoint.clone(),
            Location {
                datacenter: datacenter.to_string(),
                rack: rack.to_string(),
            },
        );
        inner
            .dc_endpoints
            .entry(datacenter.to_string())
            .or_default()
            .insert(endpoint.clone());
        inner
            .dc_racks
            .entry(datacenter.to_string())
            .or_default()
            .entry(rack.to_string())
            .or_default()
            .insert(endpoint.clone());

        if let Some(host_id) = host_id {
            inner
                .host_ids
                .retain(|_, mapped| mapped != endpoint);
            inner.host_ids.insert(host_id.to_string(), endpoint.clone());
        }
        tracing::debug!(
            "topology member {} at {}/{}{}",
            endpoint,
            datacenter,
            rack,
            host_id.map(|id| format!(" ({})", id)).unwrap_or_default()
        );
    }

    pub fn remove_member(&self, endpoint: &Endpoint) {
        let mut inner = self.inner.write().unwrap();
        Self::unindex(&mut inner, endpoint);
        inner.locations.remove(endpoint);
        inner.host_ids.retain(|_, mapped| mapped != endpoint);
        tracing::debug!("topology member {} removed", endpoint);
    }

    fn unindex(inner: &mut TopologySnapshot, endpoint: &Endpoint) {
        if let Some(previous) = inner.locations.get(endpoint).cloned() {
            if let Some(endpoints) = inner.dc_endpoints.get_mut(&previous.datacenter) {
                endpoints.remove(endpoint);
                if endpoints.is_empty() {
                    inner.dc_endpoints.remove(&previous.datacenter);
                }
            }
            if let Some(racks) = inner.dc_racks.get_mut(&previous.datacenter) {
                if let Some(rack_endpoints) = racks.get_mut(&previous.rack) {
                    rack_endpoints.remove(endpoint);
                    if rack_endpoints.is_empty() {
                        racks.remove(&previous.rack);
                    }
                }
                if racks.is_empty() {
                    inner.dc_racks.remove(&previous.datacenter);
                }
            }
        }
    }

    pub fn is_member(&self, endpoint: &Endpoint) -> bool {
        self.inner.read().unwrap().is_member(endpoint)
    }

    pub fn datacenter_of(&self, endpoint: &Endpoint) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .datacenter_of(endpoint)
            .map(str::to_string)
    }

    pub fn rack_of(&self, endpoint: &Endpoint) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .rack_of(endpoint)
            .map(str::to_string)
    }

    pub fn endpoints_in(&self, datacenter: &str) -> BTreeSet<Endpoint> {
        self.inner
            .read()
            .unwrap()
            .endpoints_in(datacenter)
            .cloned()
            .unwrap_or_default()
    }

    pub fn racks_in(&self, datacenter: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .unwrap()
            .racks_in(datacenter)
            .map(|racks| racks.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn sorted_host_ids(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .host_ids
            .keys()
            .cloned()
            .collect()
    }

    pub fn endpoint_for_host_id(&self, host_id: &str) -> Option<Endpoint> {
        self.inner
            .read()
            .unwrap()
            .endpoint_for_host_id(host_id)
            .cloned()
    }

    pub fn member_count(&self) -> usize {
        self.inner.read().unwrap().member_count()
    }

    /// A stable snapshot for placement calculations
    pub fn snapshot(&self) -> TopologySnapshot {
        self.inner.read().unwrap().clone()
    }
}
