//! Gossip Wire Messages
//!
//! The six gossip verbs and their explicit wire layout. Integers are
//! big-endian; strings are UTF-8 with a u16 length prefix. The layout is
//! fixed across versions, so serialize -> deserialize -> serialize is
//! bit-exact.
//!
//! Payloads:
//! - `Syn`: cluster name; u32 count; count x digest
//! - `Ack`: u32 count; count x digest; u32 count; count x (endpoint, state)
//! - `Ack2`: u32 count; count x (endpoint, state)
//! - `Shutdown`, `Echo`, `EchoResponse`: empty
//!
//! An endpoint is written as host string, u16 port, and an optional host
//! id behind a presence byte. An endpoint state is its heartbeat
//! `(generation:i32, version:i32)`, a u32 entry count, then each entry as
//! `(key:i32, version:i32, value)`.

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::gossip::digest::GossipDigest;
use crate::state::{ApplicationKey, EndpointState, HeartbeatState, VersionedValue};

const VERB_SYN: u8 = 1;
const VERB_ACK: u8 = 2;
const VERB_ACK2: u8 = 3;
const VERB_SHUTDOWN: u8 = 4;
const VERB_ECHO: u8 = 5;
const VERB_ECHO_RESPONSE: u8 = 6;

/// A gossip verb plus its payload
#[derive(Debug, Clone, PartialEq)]
pub enum GossipMessage {
    /// First message of a gossip round
    Syn {
        cluster_name: String,
        digests: Vec<GossipDigest>,
    },
    /// Reply to a syn: digests the receiver still needs plus states the
    /// sender lacks
    Ack {
        digests: Vec<GossipDigest>,
        states: Vec<(Endpoint, EndpointState)>,
    },
    /// Final message of a round: the states the peer requested
    Ack2 {
        states: Vec<(Endpoint, EndpointState)>,
    },
    /// Best-effort broadcast on graceful stop
    Shutdown,
    /// Liveness probe sent before marking a peer alive
    Echo,
    /// Empty reply to an echo
    EchoResponse,
}

impl GossipMessage {
    /// Short verb name for logging
    pub fn verb_name(&self) -> &'static str {
        match self {
            GossipMessage::Syn { .. } => "GOSSIP_DIGEST_SYN",
            GossipMessage::Ack { .. } => "GOSSIP_DIGEST_ACK",
            GossipMessage::Ack2 { .. } => "GOSSIP_DIGEST_ACK2",
            GossipMessage::Shutdown => "GOSSIP_SHUTDOWN",
            GossipMessage::Echo => "ECHO",
            GossipMessage::EchoResponse => "ECHO_RESPONSE",
        }
    }
}

/// A message plus the advertised endpoint of its sender
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub from: Endpoint,
    pub message: GossipMessage,
}

impl Envelope {
    pub fn new(from: Endpoint, message: GossipMessage) -> Self {
        Self { from, message }
    }

    /// Serialize to the wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        write_endpoint(&mut buf, &self.from);
        match &self.message {
            GossipMessage::Syn {
                cluster_name,
                digests,
            } => {
                buf.push(VERB_SYN);
                write_utf(&mut buf, cluster_name);
                write_digests(&mut buf, digests);
            }
            GossipMessage::Ack { digests, states } => {
                buf.push(VERB_ACK);
                write_digests(&mut buf, digests);
                write_states(&mut buf, states);
            }
            GossipMessage::Ack2 { states } => {
                buf.push(VERB_ACK2);
                write_states(&mut buf, states);
            }
            GossipMessage::Shutdown => buf.push(VERB_SHUTDOWN),
            GossipMessage::Echo => buf.push(VERB_ECHO),
            GossipMessage::EchoResponse => buf.push(VERB_ECHO_RESPONSE),
        }
        buf
    }

    /// Deserialize from the wire form
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let from = read_endpoint(&mut reader)?;
        let verb = reader.read_u8()?;
        let message = match verb {
            VERB_SYN => GossipMessage::Syn {
                cluster_name: read_utf(&mut reader)?,
                digests: read_digests(&mut reader)?,
            },
            VERB_ACK => GossipMessage::Ack {
                digests: read_digests(&mut reader)?,
                states: read_states(&mut reader)?,
            },
            VERB_ACK2 => GossipMessage::Ack2 {
                states: read_states(&mut reader)?,
            },
            VERB_SHUTDOWN => GossipMessage::Shutdown,
            VERB_ECHO => GossipMessage::Echo,
            VERB_ECHO_RESPONSE => GossipMessage::EchoResponse,
            other => return Err(Error::UnknownVerb(other)),
        };
        if !reader.is_empty() {
            return Err(Error::Protocol("trailing bytes after payload".into()));
        }
        Ok(Self { from, message })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Protocol("truncated message".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

fn write_utf(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn read_utf(reader: &mut Reader<'_>) -> Result<String> {
    let len = reader.read_u16()? as usize;
    let bytes = reader.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Protocol("invalid utf-8 string".into()))
}

fn write_endpoint(buf: &mut Vec<u8>, endpoint: &Endpoint) {
    write_utf(buf, &endpoint.host);
    buf.extend_from_slice(&endpoint.port.to_be_bytes());
    match &endpoint.host_id {
        Some(id) => {
            buf.push(1);
            write_utf(buf, id);
        }
        None => buf.push(0),
    }
}

fn read_endpoint(reader: &mut Reader<'_>) -> Result<Endpoint> {
    let host = read_utf(reader)?;
    let port = reader.read_u16()?;
    let host_id = match reader.read_u8()? {
        0 => None,
        1 => Some(read_utf(reader)?),
        _ => return Err(Error::Protocol("invalid host id marker".into())),
    };
    Ok(Endpoint {
        host,
        port,
        host_id,
    })
}

fn write_digests(buf: &mut Vec<u8>, digests: &[GossipDigest]) {
    buf.extend_from_slice(&(digests.len() as u32).to_be_bytes());
    for digest in digests {
        write_endpoint(buf, &digest.endpoint);
        buf.extend_from_slice(&digest.generation.to_be_bytes());
        buf.extend_from_slice(&digest.max_version.to_be_bytes());
    }
}

fn read_digests(reader: &mut Reader<'_>) -> Result<Vec<GossipDigest>> {
    let count = reader.read_u32()? as usize;
    let mut digests = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let endpoint = read_endpoint(reader)?;
        let generation = reader.read_i32()?;
        let max_version = reader.read_i32()?;
        digests.push(GossipDigest::new(endpoint, generation, max_version));
    }
    Ok(digests)
}

fn write_state(buf: &mut Vec<u8>, state: &EndpointState) {
    let heartbeat = state.heartbeat();
    buf.extend_from_slice(&heartbeat.generation.to_be_bytes());
    buf.extend_from_slice(&heartbeat.version.to_be_bytes());
    let count = state.application_states().count() as u32;
    buf.extend_from_slice(&count.to_be_bytes());
    for (key, value) in state.application_states() {
        buf.extend_from_slice(&key.to_wire().to_be_bytes());
        buf.extend_from_slice(&value.version.to_be_bytes());
        write_utf(buf, &value.value);
    }
}

fn read_state(reader: &mut Reader<'_>) -> Result<EndpointState> {
    let generation = reader.read_i32()?;
    let version = reader.read_i32()?;
    let mut state = EndpointState::new(HeartbeatState::with_version(generation, version), 0);
    let count = reader.read_u32()? as usize;
    for _ in 0..count {
        let key = ApplicationKey::from_wire(reader.read_i32()?)?;
        let version = reader.read_i32()?;
        let value = read_utf(reader)?;
        state.add_application_state(key, VersionedValue::new(value, version));
    }
    Ok(state)
}

fn write_states(buf: &mut Vec<u8>, states: &[(Endpoint, EndpointState)]) {
    buf.extend_from_slice(&(states.len() as u32).to_be_bytes());
    for (endpoint, state) in states {
        write_endpoint(buf, endpoint);
        write_state(buf, state);
    }
}

fn read_states(reader: &mut Reader<'_>) -> Result<Vec<(Endpoint, EndpointState)>> {
    let count = reader.read_u32()? as usize;
    let mut states = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let endpoint = read_endpoint(reader)?;
        let state = read_state(reader)?;
        states.push((endpoint, state));
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ValueFactory, VersionGenerator};
    use std::sync::Arc;

    fn sample_state() -> EndpointState {
        let values = ValueFactory::new(Arc::new(VersionGenerator::new()));
        let mut state = EndpointState::new(HeartbeatState::with_version(1722, 42), 0);
        state.add_application_state(ApplicationKey::Status, values.normal());
        state.add_application_state(ApplicationKey::Datacenter, values.datacenter("east"));
        state.add_application_state(ApplicationKey::Rack, values.rack("r2"));
        state
    }

    fn round_trip(envelope: Envelope) {
        let first = envelope.encode();
        let decoded = Envelope::decode(&first).unwrap();
        let second = decoded.encode();
        // the second pair must be bit-exact
        assert_eq!(first, second);
        assert_eq!(decoded, Envelope::decode(&second).unwrap());
    }

    #[test]
    fn test_syn_round_trip() {
        let from = Endpoint::new("10.0.0.1", 7946);
        let digests = vec![
            GossipDigest::new(Endpoint::new("10.0.0.2", 7946), 1722, 10),
            GossipDigest::new(Endpoint::with_host_id("10.0.0.3", 7946, "b7f2"), 1700, 0),
        ];
        round_trip(Envelope::new(
            from,
            GossipMessage::Syn {
                cluster_name: "pack-1".into(),
                digests,
            },
        ));
    }

    #[test]
    fn test_ack_round_trip() {
        let from = Endpoint::new("10.0.0.2", 7946);
        let digests = vec![GossipDigest::new(Endpoint::new("10.0.0.1", 7946), 1722, 5)];
        let states = vec![(Endpoint::new("10.0.0.3", 7946), sample_state())];
        round_trip(Envelope::new(from, GossipMessage::Ack { digests, states }));
    }

    #[test]
    fn test_ack2_round_trip() {
        let from = Endpoint::new("10.0.0.1", 7946);
        let states = vec![(Endpoint::new("10.0.0.2", 7946), sample_state())];
        round_trip(Envelope::new(from, GossipMessage::Ack2 { states }));
    }

    #[test]
    fn test_empty_verbs_round_trip() {
        let from = Endpoint::new("10.0.0.1", 7946);
        for message in [
            GossipMessage::Shutdown,
            GossipMessage::Echo,
            GossipMessage::EchoResponse,
        ] {
            round_trip(Envelope::new(from.clone(), message));
        }
    }

    #[test]
    fn test_decode_rejects_unknown_verb() {
        let mut buf = Vec::new();
        write_endpoint(&mut buf, &Endpoint::new("10.0.0.1", 7946));
        buf.push(99);
        assert!(matches!(
            Envelope::decode(&buf),
            Err(Error::UnknownVerb(99))
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let envelope = Envelope::new(
            Endpoint::new("10.0.0.1", 7946),
            GossipMessage::Syn {
                cluster_name: "pack-1".into(),
                digests: vec![GossipDigest::new(Endpoint::new("10.0.0.2", 7946), 1, 1)],
            },
        );
        let bytes = envelope.encode();
        assert!(Envelope::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Envelope::new(Endpoint::new("10.0.0.1", 7946), GossipMessage::Echo).encode();
        bytes.push(0);
        assert!(Envelope::decode(&bytes).is_err());
    }
}
