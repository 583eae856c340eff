//! Versioned Endpoint State
//!
//! Heartbeat counters, versioned application states and the per-endpoint
//! state record exchanged through gossip.

mod endpoint_state;
mod heartbeat;
mod versioned;

pub use endpoint_state::EndpointState;
pub use heartbeat::{HeartbeatState, VersionGenerator};
pub use versioned::{
    is_dead_status_token, status, ApplicationKey, ValueFactory, VersionedValue, DELIMITER,
};
