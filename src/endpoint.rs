//! Endpoint Identity
//!
//! A stable identifier for a cluster node: network address plus listening
//! port. An endpoint may carry an optional host id that survives address
//! changes; the host id does not participate in equality or ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifies a peer by its network address and listening port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address
    pub host: String,
    /// Cluster communication port
    pub port: u16,
    /// Optional opaque host id (UUID-like), survives address changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

impl Endpoint {
    /// Create an endpoint from host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            host_id: None,
        }
    }

    /// Create an endpoint carrying a host id
    pub fn with_host_id(host: impl Into<String>, port: u16, host_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            host_id: Some(host_id.into()),
        }
    }

    /// Parse a `host:port` string
    pub fn parse(address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidEndpoint(address.to_string()))?;
        if host.is_empty() {
            return Err(Error::InvalidEndpoint(address.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidEndpoint(address.to_string()))?;
        Ok(Self::new(host, port))
    }

    /// The `host:port` form used for socket connections
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host
            .cmp(&other.host)
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
