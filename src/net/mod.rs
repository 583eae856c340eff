//! Network Module
//!
//! Byte-oriented message transport for gossip: length-plus-checksum
//! framing over TCP. The gossip core itself only sees endpoints and
//! messages; everything socket-shaped lives here.

mod client;
mod server;

pub use client::{GossipClient, PreferredAddressBook};
pub use server::GossipServer;

use crate::error::{Error, Result};
use crate::gossip::Envelope;

/// Upper bound on a single frame; larger frames are protocol violations
pub const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

/// Frame header: payload length plus CRC32 checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// Read one framed envelope from a reader
pub async fn read_envelope<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);
    if header.length > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds the limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::ChecksumMismatch);
    }

    Envelope::decode(&body)
}

/// Write one framed envelope to a writer
pub async fn write_envelope<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = envelope.encode();
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::gossip::GossipMessage;

    #[test]
    fn test_frame_header_round_trip() {
        let data = b"gossip frame body";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(header, restored);
    }

    #[tokio::test]
    async fn test_envelope_over_stream() {
        let envelope = Envelope::new(Endpoint::new("10.0.0.1", 7946), GossipMessage::Echo);

        let (mut client, mut server) = tokio::io::duplex(1024);
        write_envelope(&mut client, &envelope).await.unwrap();
        let received = read_envelope(&mut server).await.unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_corrupted_frame_is_rejected() {
        let envelope = Envelope::new(Endpoint::new("10.0.0.1", 7946), GossipMessage::Echo);
        let body = envelope.encode();
        let header = FrameHeader::new(&body);

        let mut frame = Vec::new();
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&body);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let result = read_envelope(&mut frame.as_slice()).await;
        assert!(matches!(result, Err(Error::ChecksumMismatch)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let header = FrameHeader {
            length: MAX_FRAME_BYTES + 1,
            checksum: 0,
        };
        let bytes = header.to_bytes();
        let result = read_envelope(&mut bytes.as_slice()).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
