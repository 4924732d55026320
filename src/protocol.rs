//! Wire packet format — binary header plus JSON body.
//!
//! Every packet on a peer connection is a fixed 4-byte header (message tag
//! and body size, both little-endian `u16`) followed by exactly `body_len`
//! bytes of JSON. Header and body are written as two separate transmissions,
//! and a receiver reads exactly `body_len` bytes after the header before
//! attempting to decode the body.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// Size of the fixed binary header.
pub const HEADER_LEN: usize = 4;

/// Upper bound on an encoded message body. Enforced on the encode path so
/// a body can never overflow the header's 16-bit size field silently.
pub const MAX_BODY_LEN: usize = 512;

/// The wire tag identifying a message schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageTag {
    UserMetaRequest = 0,
    UserMetaReply = 1,
    MessageRequest = 2,
    MessagesReply = 3,
}

impl MessageTag {
    /// Map a raw header tag back to a known schema, if any.
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::UserMetaRequest),
            1 => Some(Self::UserMetaReply),
            2 => Some(Self::MessageRequest),
            3 => Some(Self::MessagesReply),
            _ => None,
        }
    }
}

/// The fixed packet header.
///
/// `tag` is kept raw here: header bytes always decode structurally, and an
/// unknown tag only surfaces as an error once the body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u16,
    pub body_len: u16,
}

impl Header {
    /// Encode the header into its 4-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let tag = self.tag.to_le_bytes();
        let len = self.body_len.to_le_bytes();
        [tag[0], tag[1], len[0], len[1]]
    }

    /// Decode a header from its 4-byte wire form. Structurally infallible.
    pub fn decode(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            tag: u16::from_le_bytes([bytes[0], bytes[1]]),
            body_len: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }
}

// ---------------------------------------------------------------------------
// Message schemas
// ---------------------------------------------------------------------------

/// Sent by the acceptor as the first handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetaRequest {
    pub from_id: PeerId,
}

/// The initiator's handshake reply carrying its self-reported identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetaReply {
    pub peer_id: PeerId,
    pub display_name: String,
    pub room_ids: Vec<String>,
}

/// Ask a peer for its stored messages starting at `from_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub from_id: PeerId,
    pub target_id: PeerId,
    pub from_index: u64,
}

/// A chat text delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesReply {
    pub text: String,
}

/// Closed union over the four wire message schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    UserMetaRequest(UserMetaRequest),
    UserMetaReply(UserMetaReply),
    MessageRequest(MessageRequest),
    MessagesReply(MessagesReply),
}

impl ChatMessage {
    /// The wire tag for this message's schema.
    pub fn tag(&self) -> MessageTag {
        match self {
            Self::UserMetaRequest(_) => MessageTag::UserMetaRequest,
            Self::UserMetaReply(_) => MessageTag::UserMetaReply,
            Self::MessageRequest(_) => MessageTag::MessageRequest,
            Self::MessagesReply(_) => MessageTag::MessagesReply,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, NetworkError> {
        let body = match self {
            Self::UserMetaRequest(m) => serde_json::to_vec(m)?,
            Self::UserMetaReply(m) => serde_json::to_vec(m)?,
            Self::MessageRequest(m) => serde_json::to_vec(m)?,
            Self::MessagesReply(m) => serde_json::to_vec(m)?,
        };
        Ok(body)
    }

    fn decode_body(tag: MessageTag, body: &[u8]) -> Result<Self, NetworkError> {
        let msg = match tag {
            MessageTag::UserMetaRequest => Self::UserMetaRequest(serde_json::from_slice(body)?),
            MessageTag::UserMetaReply => Self::UserMetaReply(serde_json::from_slice(body)?),
            MessageTag::MessageRequest => Self::MessageRequest(serde_json::from_slice(body)?),
            MessageTag::MessagesReply => Self::MessagesReply(serde_json::from_slice(body)?),
        };
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One wire unit: header plus raw body bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    header: Header,
    body: Vec<u8>,
}

impl Packet {
    /// Build a packet from a typed message. The header's tag and body size
    /// are derived here; callers never set them manually.
    pub fn from_message(message: &ChatMessage) -> Result<Self, NetworkError> {
        let body = message.encode_body()?;
        if body.len() > MAX_BODY_LEN {
            return Err(NetworkError::BodyTooLarge(body.len()));
        }
        Ok(Self {
            header: Header {
                tag: message.tag() as u16,
                body_len: body.len() as u16,
            },
            body,
        })
    }

    /// Reassemble a packet from a decoded header and its body bytes.
    ///
    /// The caller must have read exactly `header.body_len` bytes.
    pub fn from_parts(header: Header, body: Vec<u8>) -> Self {
        debug_assert_eq!(header.body_len as usize, body.len());
        Self { header, body }
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the typed message this packet carries.
    ///
    /// An unknown tag is a protocol error; a schema mismatch is a codec
    /// error. Both leave the connection's stream position intact — the
    /// packet was already fully consumed.
    pub fn message(&self) -> Result<ChatMessage, NetworkError> {
        let tag = MessageTag::from_u16(self.header.tag)
            .ok_or_else(|| NetworkError::Protocol(format!("unknown message tag {}", self.header.tag)))?;
        ChatMessage::decode_body(tag, &self.body)
    }
}

// ---------------------------------------------------------------------------
// Framed I/O
// ---------------------------------------------------------------------------

/// Read one packet: exactly 4 header bytes, then exactly `body_len` body
/// bytes. A short read or EOF mid-packet is a terminal transport error.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_bytes).await?;
    let header = Header::decode(header_bytes);

    let mut body = vec![0u8; header.body_len as usize];
    reader.read_exact(&mut body).await?;

    Ok(Packet::from_parts(header, body))
}

/// Write one packet: the header bytes, then the body, as two writes.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.header.encode()).await?;
    writer.write_all(&packet.body).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
