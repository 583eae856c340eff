//! Anti-Entropy Gossip
//!
//! The gossip protocol core: wire messages and digests, the phi-accrual
//! failure detector, the event bus and the gossiper itself.

mod digest;
mod events;
mod failure_detector;
mod gossiper;
mod messages;

pub use digest::GossipDigest;
pub use events::{EndpointEvent, EndpointStateSubscriber, EventBus};
pub use failure_detector::{
    Conviction, FailureDetector, FailureDetectorConfig, SAMPLE_SIZE,
};
pub use gossiper::{
    Gossiper, GossipSettings, MessageBacklog, GOSSIP_INTERVAL_MS, VERY_LONG_TIME_MS,
};
pub use messages::{Envelope, GossipMessage};
