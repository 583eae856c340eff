//! Gossip Digest
//!
//! Summarizes one endpoint's state for the anti-entropy exchange: the
//! endpoint, its generation, and the largest version of any state it has
//! generated as known by the local endpoint.

use std::cmp::Ordering;
use std::fmt;

use crate::endpoint::Endpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipDigest {
    pub endpoint: Endpoint,
    pub generation: i32,
    pub max_version: i32,
}

impl GossipDigest {
    pub fn new(endpoint: Endpoint, generation: i32, max_version: i32) -> Self {
        Self {
            endpoint,
            generation,
            max_version,
        }
    }
}

impl PartialOrd for GossipDigest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GossipDigest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.max_version.cmp(&other.max_version))
    }
}

impl fmt::Display for GossipDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.endpoint, self.generation, self.max_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_generation_then_version() {
        let ep = Endpoint::new("10.0.0.1", 7946);
        let old_generation = GossipDigest::new(ep.clone(), 1, 50);
        let new_generation = GossipDigest::new(ep.clone(), 2, 1);
        let new_version = GossipDigest::new(ep, 1, 51);

        assert!(old_generation < new_generation);
        assert!(old_generation < new_version);
        assert!(new_version < new_generation);
    }

    #[test]
    fn test_display() {
        let digest = GossipDigest::new(Endpoint::new("10.0.0.1", 7946), 3, 17);
        assert_eq!(digest.to_string(), "10.0.0.1:7946:3:17");
    }
}
