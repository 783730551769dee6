//! # Message Framing
//!
//! Defines the message and header types that travel over a connection, plus
//! the [`HeaderCodec`] strategy that fixes their byte layout.
//!
//! ## Wire Protocol
//!
//! Every frame is a fixed-layout header followed by exactly `body_len` body
//! bytes. The reference layout ([`BasicHeaderCodec`], version 1) is 38 bytes,
//! big-endian:
//!
//! ```text
//! [1: version 0x01] [1: magic 0xFF] [4: total frame length]
//! [16: message UID] [16: client UID] [body bytes...]
//! ```
//!
//! The total frame length includes the header, so `body_len` is
//! `total - 38`. Deployments that need a different schema implement their
//! own [`HeaderCodec`] and pass it to both client and server - the framing
//! code never assumes a particular layout.

use uuid::Uuid;

use crate::error::TransportError;

/// Identifier distinguishing one logical connection from all others known to
/// a server. Assigned once at accept/connect time.
pub type ClientUid = Uuid;

/// Identifier generated fresh for every constructed message; used for
/// correlation and tracing, never reused.
pub type MessageUid = Uuid;

/// Maximum allowed body size (100MB) to prevent memory exhaustion from a
/// corrupt or hostile length field.
pub const DEFAULT_MAX_BODY_LEN: usize = 100 * 1024 * 1024;

/// Framing metadata that precedes every body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Connection the message belongs to.
    pub client_uid: ClientUid,
    /// Fresh per-message correlation identifier.
    pub message_uid: MessageUid,
    /// Exact number of body bytes following the header.
    pub body_len: usize,
}

/// One header-plus-body unit. Immutable once constructed; exclusively owned
/// by whichever component currently holds it.
#[derive(Debug, Clone)]
pub struct Message {
    header: MessageHeader,
    body: Vec<u8>,
}

impl Message {
    /// Build a message that owns `body`, with a fresh message UID.
    ///
    /// # Example
    /// ```ignore
    /// let msg = Message::new(client_uid, b"ping".to_vec());
    /// assert_eq!(msg.body(), b"ping");
    /// ```
    pub fn new(client_uid: ClientUid, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            header: MessageHeader {
                client_uid,
                message_uid: Uuid::new_v4(),
                body_len: body.len(),
            },
            body,
        }
    }

    /// Reassemble a message deserialized from the wire.
    pub(crate) fn from_parts(header: MessageHeader, body: Vec<u8>) -> Self {
        debug_assert_eq!(header.body_len, body.len());
        Self { header, body }
    }

    /// The framing header.
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// The connection identifier carried in the header.
    pub fn client_uid(&self) -> ClientUid {
        self.header.client_uid
    }

    /// The per-message correlation identifier.
    pub fn message_uid(&self) -> MessageUid {
        self.header.message_uid
    }

    /// The opaque payload bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of body bytes.
    pub fn body_len(&self) -> usize {
        self.header.body_len
    }

    /// Consume the message and take ownership of the payload.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Fixed byte layout for a [`MessageHeader`].
///
/// This is the sole extension point for deployments that define their own
/// wire schema: supply an implementation in
/// [`HandlerOptions`](crate::handler::HandlerOptions) and every handler
/// produced by a client or server will frame with it. Client and server must
/// share the same codec to interoperate.
pub trait HeaderCodec: Send + Sync + 'static {
    /// Size of the encoded header in bytes. Must be constant for the life
    /// of the codec - the framing layer reads exactly this many bytes before
    /// decoding.
    fn header_len(&self) -> usize;

    /// Append the encoded header to `dest`.
    fn encode(&self, header: &MessageHeader, dest: &mut Vec<u8>);

    /// Decode a header from a buffer of exactly `header_len()` bytes.
    ///
    /// # Returns
    /// - `Ok(MessageHeader)`: the decoded header
    /// - `Err(TransportError::Framing)`: the buffer is not a valid header
    fn decode(&self, src: &[u8]) -> Result<MessageHeader, TransportError>;
}

/// Header size of the [`BasicHeaderCodec`] layout.
pub const BASIC_HEADER_LEN: usize = 38;

const BASIC_VERSION: u8 = 0x01;
const BASIC_MAGIC: u8 = 0xFF;

/// The reference header layout (version 1). See the module docs for the
/// exact byte structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicHeaderCodec;

impl HeaderCodec for BasicHeaderCodec {
    fn header_len(&self) -> usize {
        BASIC_HEADER_LEN
    }

    fn encode(&self, header: &MessageHeader, dest: &mut Vec<u8>) {
        let total = (BASIC_HEADER_LEN + header.body_len) as u32;
        dest.push(BASIC_VERSION);
        dest.push(BASIC_MAGIC);
        dest.extend_from_slice(&total.to_be_bytes());
        dest.extend_from_slice(header.message_uid.as_bytes());
        dest.extend_from_slice(header.client_uid.as_bytes());
    }

    fn decode(&self, src: &[u8]) -> Result<MessageHeader, TransportError> {
        if src.len() != BASIC_HEADER_LEN {
            return Err(TransportError::Framing(format!(
                "header buffer is {} bytes, expected {}",
                src.len(),
                BASIC_HEADER_LEN
            )));
        }
        if src[0] != BASIC_VERSION || src[1] != BASIC_MAGIC {
            return Err(TransportError::Framing(format!(
                "invalid header marker {:#04x} {:#04x}",
                src[0], src[1]
            )));
        }
        let total = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if total < BASIC_HEADER_LEN {
            return Err(TransportError::Framing(format!(
                "frame length {} shorter than the header itself",
                total
            )));
        }
        let message_uid = Uuid::from_slice(&src[6..22])
            .map_err(|e| TransportError::Framing(format!("invalid message UID: {}", e)))?;
        let client_uid = Uuid::from_slice(&src[22..38])
            .map_err(|e| TransportError::Framing(format!("invalid client UID: {}", e)))?;
        Ok(MessageHeader {
            client_uid,
            message_uid,
            body_len: total - BASIC_HEADER_LEN,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let codec = BasicHeaderCodec;
        let msg = Message::new(Uuid::new_v4(), b"hello".to_vec());

        let mut buf = Vec::new();
        codec.encode(msg.header(), &mut buf);
        assert_eq!(buf.len(), BASIC_HEADER_LEN);

        let decoded = codec.decode(&buf).unwrap();
        assert_eq!(decoded, *msg.header());
        assert_eq!(decoded.body_len, 5);
    }

    #[test]
    fn empty_body_round_trip() {
        let codec = BasicHeaderCodec;
        let msg = Message::new(Uuid::new_v4(), Vec::new());

        let mut buf = Vec::new();
        codec.encode(msg.header(), &mut buf);
        let decoded = codec.decode(&buf).unwrap();
        assert_eq!(decoded.body_len, 0);
    }

    #[test]
    fn message_uid_fresh_per_construction() {
        let client = Uuid::new_v4();
        let a = Message::new(client, b"same".to_vec());
        let b = Message::new(client, b"same".to_vec());
        assert_ne!(a.message_uid(), b.message_uid());
        assert_eq!(a.client_uid(), b.client_uid());
    }

    #[test]
    fn decode_rejects_bad_marker() {
        let codec = BasicHeaderCodec;
        let msg = Message::new(Uuid::new_v4(), b"x".to_vec());
        let mut buf = Vec::new();
        codec.encode(msg.header(), &mut buf);
        buf[1] = 0x00;

        assert!(matches!(
            codec.decode(&buf),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn decode_rejects_undersized_length() {
        let codec = BasicHeaderCodec;
        let msg = Message::new(Uuid::new_v4(), Vec::new());
        let mut buf = Vec::new();
        codec.encode(msg.header(), &mut buf);
        // Claim a total frame length smaller than the header.
        buf[2..6].copy_from_slice(&10u32.to_be_bytes());

        assert!(matches!(
            codec.decode(&buf),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let codec = BasicHeaderCodec;
        assert!(matches!(
            codec.decode(&[BASIC_VERSION, BASIC_MAGIC, 0, 0]),
            Err(TransportError::Framing(_))
        ));
    }
}
