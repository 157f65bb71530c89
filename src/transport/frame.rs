//! Wire framing for peer connections.
//!
//! Every frame is a 4-byte big-endian length prefix followed by one JSON
//! message. Frames above 1 MiB are rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::identity::AddressHash;
use super::link::LinkId;

const MAX_FRAME: usize = 1_048_576;

/// Messages exchanged between overlay peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// A destination is reachable through the sending peer.
    Announce {
        destination: AddressHash,
        identity: AddressHash,
    },
    /// Ask peers whether they can reach a destination.
    PathRequest { destination: AddressHash },
    /// Initiator requests a link to a destination.
    LinkRequest {
        link: LinkId,
        destination: AddressHash,
    },
    /// Destination accepts the link; activates it on the initiator.
    LinkProof { link: LinkId },
    /// Initiator reports the measured round-trip time.
    LinkRtt { link: LinkId, rtt_ms: f64 },
    /// Initiator discloses its identity hash on the link.
    Identify { link: LinkId, identity: AddressHash },
    /// Unreliable datagram. Payload is base64.
    Packet {
        link: LinkId,
        id: u64,
        payload: String,
    },
    /// Delivery proof for a packet.
    PacketAck { link: LinkId, id: u64 },
    /// Reliable request keyed by a string path.
    Request {
        link: LinkId,
        id: u64,
        path: String,
        data: Value,
    },
    /// Response to a request.
    Response { link: LinkId, id: u64, data: Value },
    /// Close the link.
    Teardown { link: LinkId },
}

/// Read one frame. Returns `None` on clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let message = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(message))
}

/// Write one frame: length prefix and payload together, then flush.
pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
