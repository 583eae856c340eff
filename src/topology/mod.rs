//! Topology, Proximity and Placement
//!
//! Cluster topology metadata, the snitch layers that order peers by
//! proximity, and the replication strategies that pick replica sets.

mod dynamic_snitch;
mod metadata;
mod snitch;
mod strategy;

pub use dynamic_snitch::{
    DynamicSnitch, DynamicSnitchConfig, LatencySubscriber, SeveritySource,
};
pub use metadata::{Location, TopologyMetaData, TopologySnapshot};
pub use snitch::{ConfigSnitch, Snitch};
pub use strategy::{LocalStrategy, NetworkTopologyStrategy, ReplicationStrategy};
