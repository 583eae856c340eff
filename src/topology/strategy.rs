//! Replication Strategy
//!
//! Given the topology and a set of candidates, computes the ordered
//! replica set for a data range. The network-topology strategy takes a
//! per-datacenter replication factor and spreads replicas across racks
//! before reusing one; the local strategy pins everything to the local
//! endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::topology::metadata::TopologySnapshot;
use crate::topology::snitch::Snitch;

pub trait ReplicationStrategy: Send + Sync {
    /// Total number of replicas this strategy aims for
    fn replication_factor(&self) -> usize;

    /// Ordered replica set; insertion order is preserved, so the first
    /// endpoint accepted becomes the primary. When the cluster has fewer
    /// usable endpoints than the replication factor the result is a
    /// best-effort subset, not an error.
    fn calculate_replicas(
        &self,
        metadata: &TopologySnapshot,
        old_replicas: &HashSet<Endpoint>,
        candidates: &HashSet<Endpoint>,
        include_old: bool,
    ) -> Vec<Endpoint>;
}

/// Always replicates to the local endpoint only
pub struct LocalStrategy {
    local: Endpoint,
}

impl LocalStrategy {
    pub fn new(local: Endpoint) -> Self {
        Self { local }
    }
}

impl ReplicationStrategy for LocalStrategy {
    fn replication_factor(&self) -> usize {
        1
    }

    fn calculate_replicas(
        &self,
        _metadata: &TopologySnapshot,
        _old_replicas: &HashSet<Endpoint>,
        _candidates: &HashSet<Endpoint>,
        _include_old: bool,
    ) -> Vec<Endpoint> {
        vec![self.local.clone()]
    }
}

/// Places the configured number of replicas in each datacenter, covering
/// every distinct rack before placing a second replica in one
pub struct NetworkTopologyStrategy {
    snitch: Arc<dyn Snitch>,
    datacenters: HashMap<String, usize>,
}

impl NetworkTopologyStrategy {
    /// Options are a map from datacenter name to replication factor.
    /// Unknown option shapes fail fast at construction.
    pub fn new(snitch: Arc<dyn Snitch>, options: &HashMap<String, String>) -> Result<Self> {
        let mut datacenters = HashMap::with_capacity(options.len());
        for (datacenter, replicas) in options {
            if datacenter.eq_ignore_ascii_case("replication_factor") {
                return Err(Error::Config(
                    "replication_factor is an option for the local strategy, not the network topology strategy"
                        .into(),
                ));
            }
            let replicas = replicas.parse::<usize>().map_err(|_| {
                Error::Config(format!(
                    "replication factor for {} must be an integer, got {:?}",
                    datacenter, replicas
                ))
            })?;
            datacenters.insert(datacenter.clone(), replicas);
        }
        tracing::debug!("configured datacenter replicas are {:?}", datacenters);
        Ok(Self {
            snitch,
            datacenters,
        })
    }

    fn datacenter_factor(&self, datacenter: &str) -> usize {
        self.datacenters.get(datacenter).copied().unwrap_or(0)
    }

    /// A datacenter is satisfied once it holds min(configured factor,
    /// endpoints present in the datacenter) replicas
    fn has_sufficient_replicas(
        &self,
        datacenter: &str,
        dc_replicas: &HashMap<String, HashSet<Endpoint>>,
        metadata: &TopologySnapshot,
    ) -> bool {
        let present = metadata
            .endpoints_in(datacenter)
            .map(|endpoints| endpoints.len())
            .unwrap_or(0);
        dc_replicas
            .get(datacenter)
            .map(|replicas| replicas.len())
            .unwrap_or(0)
            >= present.min(self.datacenter_factor(datacenter))
    }

    fn all_sufficient(
        &self,
        dc_replicas: &HashMap<String, HashSet<Endpoint>>,
        metadata: &TopologySnapshot,
    ) -> bool {
        self.datacenters
            .keys()
            .all(|datacenter| self.has_sufficient_replicas(datacenter, dc_replicas, metadata))
    }
}

impl ReplicationStrategy for NetworkTopologyStrategy {
    fn replication_factor(&self) -> usize {
        self.datacenters.values().sum()
    }

    /// One pass over the sorted host ids, tracking progress per DC and
    /// rack. Endpoints in an already-seen rack wait in a skipped queue
    /// that is drained, in insertion order, once every rack of the DC has
    /// been covered.
    fn calculate_replicas(
        &self,
        metadata: &TopologySnapshot,
        old_replicas: &HashSet<Endpoint>,
        candidates: &HashSet<Endpoint>,
        include_old: bool,
    ) -> Vec<Endpoint> {
        let mut replicas: Vec<Endpoint> = Vec::new();
        let mut total_replicas = self.replication_factor();
        if include_old {
            total_replicas = total_replicas.saturating_sub(old_replicas.len());
        }

        let mut dc_replicas: HashMap<String, HashSet<Endpoint>> =
            HashMap::with_capacity(self.datacenters.len());
        let mut seen_racks: HashMap<String, HashSet<String>> =
            HashMap::with_capacity(self.datacenters.len());
        let mut skipped: HashMap<String, Vec<Endpoint>> =
            HashMap::with_capacity(self.datacenters.len());
        for datacenter in self.datacenters.keys() {
            dc_replicas.insert(datacenter.clone(), HashSet::new());
            seen_racks.insert(datacenter.clone(), HashSet::new());
            skipped.insert(datacenter.clone(), Vec::new());
        }

        for host_id in metadata.sorted_host_ids() {
            if self.all_sufficient(&dc_replicas, metadata) {
                break;
            }
            let Some(endpoint) = metadata.endpoint_for_host_id(host_id) else {
                continue;
            };
            if !candidates.contains(endpoint) || old_replicas.contains(endpoint) {
                continue;
            }
            let datacenter = self.snitch.datacenter_of(endpoint);
            if !self.datacenters.contains_key(&datacenter)
                || self.has_sufficient_replicas(&datacenter, &dc_replicas, metadata)
            {
                continue;
            }

            let rack_count = metadata
                .racks_in(&datacenter)
                .map(|racks| racks.len())
                .unwrap_or(0);
            let seen = seen_racks.get_mut(&datacenter).unwrap();
            if seen.len() == rack_count {
                // every rack covered: accept unconditionally
                dc_replicas
                    .get_mut(&datacenter)
                    .unwrap()
                    .insert(endpoint.clone());
                replicas.push(endpoint.clone());
                continue;
            }

            let rack = self.snitch.rack_of(endpoint);
            if seen.contains(&rack) {
                skipped.get_mut(&datacenter).unwrap().push(endpoint.clone());
                continue;
            }
            dc_replicas
                .get_mut(&datacenter)
                .unwrap()
                .insert(endpoint.clone());
            replicas.push(endpoint.clone());
            seen.insert(rack);
            // out of distinct racks: drain the endpoints we skipped past,
            // up to the factor
            if seen_racks[&datacenter].len() == rack_count {
                let queued = std::mem::take(skipped.get_mut(&datacenter).unwrap());
                for waiting in queued {
                    if self.has_sufficient_replicas(&datacenter, &dc_replicas, metadata) {
                        break;
                    }
                    dc_replicas
                        .get_mut(&datacenter)
                        .unwrap()
                        .insert(waiting.clone());
                    replicas.push(waiting);
                }
            }
        }

        // still short: top up from the previous replica set, preserving
        // replicas across rolling topology changes
        if !old_replicas.is_empty() && replicas.len() < total_replicas {
            let top_up =
                self.calculate_replicas(metadata, &HashSet::new(), old_replicas, include_old);
            for endpoint in top_up {
                if replicas.len() >= total_replicas {
                    break;
                }
                if !replicas.contains(&endpoint) {
                    replicas.push(endpoint);
                }
            }
        }

        replicas
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

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Cluster {
        topology: Arc<TopologyMetaData>,
        snitch: Arc<ConfigSnitch>,
    }

    impl Cluster {
        fn new() -> Self {
            let topology = Arc::new(TopologyMetaData::new());
            let snitch = Arc::new(ConfigSnitch::new("east", "r1", topology.clone()));
            Self { topology, snitch }
        }

        fn add(&self, host: &str, datacenter: &str, rack: &str, host_id: &str) -> Endpoint {
            let endpoint = ep(host);
            self.topology
                .add_member(&endpoint, datacenter, rack, Some(host_id));
            endpoint
        }

        fn strategy(&self, pairs: &[(&str, &str)]) -> NetworkTopologyStrategy {
            NetworkTopologyStrategy::new(self.snitch.clone(), &options(pairs)).unwrap()
        }
    }

    fn all(endpoints: &[Endpoint]) -> HashSet<Endpoint> {
        endpoints.iter().cloned().collect()
    }

    #[test]
    fn test_rejects_replication_factor_option() {
        let cluster = Cluster::new();
        let result =
            NetworkTopologyStrategy::new(cluster.snitch.clone(), &options(&[("replication_factor", "3")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_non_integer_factor() {
        let cluster = Cluster::new();
        let result =
            NetworkTopologyStrategy::new(cluster.snitch.clone(), &options(&[("east", "lots")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    // DC east, RF 3, three racks with one node each: replicas follow
    // sorted-host-id order, one per rack.
    #[test]
    fn test_one_replica_per_rack() {
        let cluster = Cluster::new();
        let n1 = cluster.add("10.0.0.1", "east", "r1", "h-1");
        let n2 = cluster.add("10.0.0.2", "east", "r2", "h-2");
        let n3 = cluster.add("10.0.0.3", "east", "r3", "h-3");

        let strategy = cluster.strategy(&[("east", "3")]);
        let candidates = all(&[n1.clone(), n2.clone(), n3.clone()]);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &candidates,
            false,
        );
        assert_eq!(replicas, vec![n1, n2, n3]);
    }

    // DC east, RF 3, racks r1 = {n1, n2, n3} and r2 = {n4}: after n1
    // (r1) and n4 (r2) cover both racks, the first skipped endpoint n2
    // is drained from the queue.
    #[test]
    fn test_rack_exhaustion_drains_skipped_queue() {
        let cluster = Cluster::new();
        let n1 = cluster.add("10.0.0.1", "east", "r1", "h-1");
        let n2 = cluster.add("10.0.0.2", "east", "r1", "h-2");
        let n3 = cluster.add("10.0.0.3", "east", "r1", "h-3");
        let n4 = cluster.add("10.0.0.4", "east", "r2", "h-4");

        let strategy = cluster.strategy(&[("east", "3")]);
        let candidates = all(&[n1.clone(), n2.clone(), n3.clone(), n4.clone()]);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &candidates,
            false,
        );
        assert_eq!(replicas, vec![n1, n4, n2]);
    }

    #[test]
    fn test_never_exceeds_datacenter_factor_and_never_duplicates() {
        let cluster = Cluster::new();
        let mut endpoints = Vec::new();
        for index in 1..=6 {
            endpoints.push(cluster.add(
                &format!("10.0.0.{}", index),
                "east",
                &format!("r{}", index % 2 + 1),
                &format!("h-{}", index),
            ));
        }
        let strategy = cluster.strategy(&[("east", "3")]);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &all(&endpoints),
            false,
        );

        assert_eq!(replicas.len(), 3);
        let unique: HashSet<&Endpoint> = replicas.iter().collect();
        assert_eq!(unique.len(), replicas.len());
    }

    #[test]
    fn test_multi_datacenter_placement() {
        let cluster = Cluster::new();
        let e1 = cluster.add("10.0.0.1", "east", "r1", "h-1");
        let e2 = cluster.add("10.0.0.2", "east", "r2", "h-2");
        let w1 = cluster.add("10.1.0.1", "west", "r1", "h-3");
        let w2 = cluster.add("10.1.0.2", "west", "r2", "h-4");

        let strategy = cluster.strategy(&[("east", "2"), ("west", "1")]);
        assert_eq!(strategy.replication_factor(), 3);

        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &all(&[e1.clone(), e2.clone(), w1.clone(), w2.clone()]),
            false,
        );
        assert_eq!(replicas.len(), 3);
        assert!(replicas.contains(&e1) && replicas.contains(&e2));
        assert!(replicas.contains(&w1) || replicas.contains(&w2));
    }

    #[test]
    fn test_underpopulated_datacenter_is_best_effort() {
        let cluster = Cluster::new();
        let n1 = cluster.add("10.0.0.1", "east", "r1", "h-1");

        let strategy = cluster.strategy(&[("east", "3")]);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &all(&[n1.clone()]),
            false,
        );
        assert_eq!(replicas, vec![n1]);
    }

    #[test]
    fn test_unconfigured_datacenter_is_ignored() {
        let cluster = Cluster::new();
        let e1 = cluster.add("10.0.0.1", "east", "r1", "h-1");
        let w1 = cluster.add("10.1.0.1", "west", "r1", "h-0");

        let strategy = cluster.strategy(&[("east", "1")]);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &all(&[e1.clone(), w1]),
            false,
        );
        assert_eq!(replicas, vec![e1]);
    }

    #[test]
    fn test_old_replicas_top_up_the_result() {
        let cluster = Cluster::new();
        let n1 = cluster.add("10.0.0.1", "east", "r1", "h-1");
        let n2 = cluster.add("10.0.0.2", "east", "r2", "h-2");
        let n3 = cluster.add("10.0.0.3", "east", "r3", "h-3");

        let strategy = cluster.strategy(&[("east", "3")]);
        // n2 and n3 are previous replicas; only n1 is a fresh candidate
        let old = all(&[n2.clone(), n3.clone()]);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &old,
            &all(&[n1.clone()]),
            false,
        );
        assert_eq!(replicas.len(), 3);
        assert_eq!(replicas[0], n1);
        assert!(replicas.contains(&n2) && replicas.contains(&n3));
    }

    #[test]
    fn test_local_strategy_returns_local_only() {
        let cluster = Cluster::new();
        let local = ep("10.0.0.1");
        let other = cluster.add("10.0.0.2", "east", "r1", "h-2");

        let strategy = LocalStrategy::new(local.clone());
        assert_eq!(strategy.replication_factor(), 1);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &all(&[other]),
            false,
        );
        assert_eq!(replicas, vec![local]);
    }

    #[test]
    fn test_first_accepted_is_primary_in_host_id_order() {
        let cluster = Cluster::new();
        // host ids deliberately out of address order
        let n3 = cluster.add("10.0.0.3", "east", "r1", "h-a");
        let n1 = cluster.add("10.0.0.1", "east", "r2", "h-b");
        let n2 = cluster.add("10.0.0.2", "east", "r3", "h-c");

        let strategy = cluster.strategy(&[("east", "3")]);
        let replicas = strategy.calculate_replicas(
            &cluster.topology.snapshot(),
            &HashSet::new(),
            &all(&[n1.clone(), n2.clone(), n3.clone()]),
            false,
        );
        assert_eq!(replicas, vec![n3, n1, n2]);
    }
}
