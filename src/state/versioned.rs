//! Versioned Application State
//!
//! Each endpoint advertises a small map of well-known attributes through
//! gossip. Every value carries a version drawn from the same counter as
//! the heartbeat, so a single `max_version` covers the whole endpoint
//! state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::heartbeat::VersionGenerator;

/// Separator inside composite status values, e.g. `LEFT,<expire-millis>`
pub const DELIMITER: char = ',';

/// Status tokens carried in the `Status` application state
pub mod status {
    pub const NORMAL: &str = "NORMAL";
    pub const LEFT: &str = "LEFT";
    pub const REMOVING: &str = "removing";
    pub const REMOVED: &str = "removed";
    pub const HIBERNATE: &str = "hibernate";
    pub const SHUTDOWN: &str = "shutdown";
}

/// Status tokens that mark an endpoint as dead irrespective of its
/// liveness flag
const DEAD_STATUS_TOKENS: [&str; 4] = [
    status::REMOVING,
    status::REMOVED,
    status::LEFT,
    status::HIBERNATE,
];

/// Well-known application-state keys. The discriminant is the wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum ApplicationKey {
    Status = 0,
    Load = 1,
    Datacenter = 2,
    Rack = 3,
    InternalIp = 4,
    Severity = 5,
    NetVersion = 6,
    HostId = 7,
    Tokens = 8,
}

impl ApplicationKey {
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    pub fn from_wire(value: i32) -> Result<Self> {
        Ok(match value {
            0 => ApplicationKey::Status,
            1 => ApplicationKey::Load,
            2 => ApplicationKey::Datacenter,
            3 => ApplicationKey::Rack,
            4 => ApplicationKey::InternalIp,
            5 => ApplicationKey::Severity,
            6 => ApplicationKey::NetVersion,
            7 => ApplicationKey::HostId,
            8 => ApplicationKey::Tokens,
            other => {
                return Err(Error::Protocol(format!(
                    "unknown application state key {}",
                    other
                )))
            }
        })
    }
}

/// A string value plus the version at which it was written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: String,
    pub version: i32,
}

impl VersionedValue {
    pub fn new(value: impl Into<String>, version: i32) -> Self {
        Self {
            value: value.into(),
            version,
        }
    }

    /// First delimiter-separated piece of the value
    pub fn status_token(&self) -> &str {
        self.value
            .split(DELIMITER)
            .next()
            .unwrap_or(self.value.as_str())
    }

    /// Expire time (wall-clock millis) carried by a `LEFT` status
    pub fn left_expire_time(&self) -> Option<i64> {
        let mut pieces = self.value.split(DELIMITER);
        if pieces.next() != Some(status::LEFT) {
            return None;
        }
        pieces.next().and_then(|p| p.parse::<i64>().ok())
    }
}

/// Whether a status token marks the endpoint as dead
pub fn is_dead_status_token(token: &str) -> bool {
    DEAD_STATUS_TOKENS.contains(&token)
}

/// Builds versioned values against the shared version counter
#[derive(Debug, Clone)]
pub struct ValueFactory {
    versions: Arc<VersionGenerator>,
}

impl ValueFactory {
    pub fn new(versions: Arc<VersionGenerator>) -> Self {
        Self { versions }
    }

    /// The shared counter backing this factory
    pub fn generator(&self) -> &VersionGenerator {
        &self.versions
    }

    fn make(&self, value: String) -> VersionedValue {
        VersionedValue {
            value,
            version: self.versions.next_version(),
        }
    }

    pub fn raw(&self, value: impl Into<String>) -> VersionedValue {
        self.make(value.into())
    }

    pub fn normal(&self) -> VersionedValue {
        self.make(status::NORMAL.to_string())
    }

    pub fn left(&self, expire_time_millis: i64) -> VersionedValue {
        self.make(format!(
            "{}{}{}",
            status::LEFT,
            DELIMITER,
            expire_time_millis
        ))
    }

    pub fn removing(&self) -> VersionedValue {
        self.make(status::REMOVING.to_string())
    }

    pub fn removed(&self) -> VersionedValue {
        self.make(status::REMOVED.to_string())
    }

    pub fn hibernate(&self) -> VersionedValue {
        self.make(status::HIBERNATE.to_string())
    }

    pub fn shutdown(&self) -> VersionedValue {
        self.make(status::SHUTDOWN.to_string())
    }

    pub fn datacenter(&self, name: &str) -> VersionedValue {
        self.make(name.to_string())
    }

    pub fn rack(&self, name: &str) -> VersionedValue {
        self.make(name.to_string())
    }

    pub fn host_id(&self, id: &str) -> VersionedValue {
        self.make(id.to_string())
    }

    pub fn internal_ip(&self, address: &str) -> VersionedValue {
        self.make(address.to_string())
    }

    pub fn load(&self, load: f64) -> VersionedValue {
        self.make(load.to_string())
    }

    pub fn severity(&self, severity: f64) -> VersionedValue {
        self.make(severity.to_string())
    }

    pub fn net_version(&self, version: i32) -> VersionedValue {
        self.make(version.to_string())
    }

    pub fn tokens(&self, tokens: &[String]) -> VersionedValue {
        self.make(tokens.join(&DELIMITER.to_string()))
    }

    /// Re-stamp a value with a version at least one greater than `floor`.
    /// The local-update path uses this after firing before-change
    /// notifications, so the value cannot lose to a remote update applied
    /// while the notifications ran.
    pub fn clone_with_higher_version(&self, value: &VersionedValue) -> VersionedValue {
        VersionedValue {
            value: value.value.clone(),
            version: self.versions.next_version_after(value.version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ValueFactory {
        ValueFactory::new(Arc::new(VersionGenerator::new()))
    }

    #[test]
    fn test_status_token_parsing() {
        let values = factory();
        let left = values.left(123456);
        assert_eq!(left.status_token(), status::LEFT);
        assert_eq!(left.left_expire_time(), Some(123456));

        let normal = values.normal();
        assert_eq!(normal.status_token(), status::NORMAL);
        assert_eq!(normal.left_expire_time(), None);
    }

    #[test]
    fn test_dead_status_tokens() {
        assert!(is_dead_status_token(status::LEFT));
        assert!(is_dead_status_token(status::REMOVING));
        assert!(is_dead_status_token(status::REMOVED));
        assert!(is_dead_status_token(status::HIBERNATE));
        assert!(!is_dead_status_token(status::NORMAL));
        assert!(!is_dead_status_token(status::SHUTDOWN));
    }

    #[test]
    fn test_key_wire_round_trip() {
        for key in [
            ApplicationKey::Status,
            ApplicationKey::Load,
            ApplicationKey::Datacenter,
            ApplicationKey::Rack,
            ApplicationKey::InternalIp,
            ApplicationKey::Severity,
            ApplicationKey::NetVersion,
            ApplicationKey::HostId,
            ApplicationKey::Tokens,
        ] {
            assert_eq!(ApplicationKey::from_wire(key.to_wire()).unwrap(), key);
        }
        assert!(ApplicationKey::from_wire(99).is_err());
    }

    #[test]
    fn test_clone_with_higher_version() {
        let values = factory();
        let original = values.normal();
        let raised = values.clone_with_higher_version(&original);
        assert_eq!(raised.value, original.value);
        assert!(raised.version > original.version);
    }
}
