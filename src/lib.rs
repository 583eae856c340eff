//! Wolfpack - Distributed Cluster Membership and Replica Placement
//!
//! The peer-to-peer membership core of a distributed database: an
//! anti-entropy gossip protocol maintains an eventually consistent view
//! of the cluster, a phi-accrual failure detector estimates liveness
//! from heartbeat arrivals, a dynamic snitch ranks peers by measured
//! proximity, and topology-aware strategies pick replica sets for data
//! ranges.
//!
//! # Architecture
//!
//! Every second the gossiper exchanges state digests with one random
//! peer (SYN / ACK / ACK2), reconciling only the delta. Liveness
//! transitions flow through an event bus to the topology metadata, the
//! snitch helpers and anything else that subscribes. The SQL layer,
//! storage engine and client routing are external collaborators; this
//! crate depends only on a clock, timers, a byte-oriented transport and
//! randomness.

pub mod admin;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gossip;
pub mod net;
pub mod node;
pub mod state;
pub mod topology;

pub use config::WolfpackConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::admin::ClusterAdmin;
    pub use crate::config::WolfpackConfig;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Error, Result};
    pub use crate::gossip::{
        EndpointStateSubscriber, FailureDetector, GossipMessage, Gossiper,
    };
    pub use crate::node::ClusterNode;
    pub use crate::state::{ApplicationKey, EndpointState, HeartbeatState};
    pub use crate::topology::{
        DynamicSnitch, NetworkTopologyStrategy, ReplicationStrategy, Snitch, TopologyMetaData,
    };
}
