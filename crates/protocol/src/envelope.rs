//! The fixed-layout packet header carried in front of every overlay
//! datagram.
//!
//! Wire layout (big-endian integers):
//!
//! ```text
//! [version: u8][encryption tag: u8][sequence: u64][timestamp_ns: i64]
//! [recipient_id_len: u8][recipient_id: bytes]
//! ```
//!
//! The remainder of the datagram is the payload: ciphertext (including
//! the AEAD tag) when `encryption` is non-`None`, otherwise plaintext.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{PROTOCOL_VERSION, kinds::EncryptionKind};

const FIXED_LEN: usize = 1 + 1 + 8 + 8 + 1;
const MAX_RECIPIENT_ID_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// The buffer was shorter than the fixed header, or shorter than the
    /// length-prefixed recipient id it claims to carry.
    Truncated,
    /// The version byte did not match [`PROTOCOL_VERSION`].
    UnsupportedVersion(u8),
    /// The encryption tag byte is not one of the closed set of kinds.
    UnsupportedEncryption(u8),
    /// `recipient_id` is longer than 255 bytes and cannot be length-prefixed.
    RecipientIdTooLong,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "packet shorter than its header"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version: {v}"),
            Self::UnsupportedEncryption(t) => write!(f, "unsupported encryption tag: {t}"),
            Self::RecipientIdTooLong => write!(f, "recipient id longer than 255 bytes"),
        }
    }
}

impl std::error::Error for PacketError {}

/// The parsed packet header plus a view onto the payload that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub encryption: EncryptionKind,
    pub sequence: u64,
    pub timestamp_ns: i64,
    pub recipient_id: Bytes,
}

impl Header {
    pub fn new(encryption: EncryptionKind, sequence: u64, timestamp_ns: i64, recipient_id: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            encryption,
            sequence,
            timestamp_ns,
            recipient_id,
        }
    }

    /// Encode header + payload into a single buffer ready to hand to a
    /// socket. `payload` is ciphertext (tag included) or plaintext
    /// depending on `self.encryption`.
    pub fn encode(&self, payload: &[u8]) -> Result<BytesMut, PacketError> {
        if self.recipient_id.len() > MAX_RECIPIENT_ID_LEN {
            return Err(PacketError::RecipientIdTooLong);
        }

        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.recipient_id.len() + payload.len());
        buf.put_u8(self.version);
        buf.put_u8(self.encryption.tag());
        buf.put_u64(self.sequence);
        buf.put_i64(self.timestamp_ns);
        buf.put_u8(self.recipient_id.len() as u8);
        buf.put_slice(&self.recipient_id);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Parse the header from the front of `buf`, returning the header and
    /// the remaining payload bytes. Peers MUST discard packets whose
    /// encryption tag is unsupported rather than attempting to interpret
    /// the payload.
    pub fn decode(mut buf: Bytes) -> Result<(Self, Bytes), PacketError> {
        if buf.len() < FIXED_LEN {
            return Err(PacketError::Truncated);
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let tag = buf.get_u8();
        let encryption = EncryptionKind::from_tag(tag).ok_or(PacketError::UnsupportedEncryption(tag))?;

        let sequence = buf.get_u64();
        let timestamp_ns = buf.get_i64();

        let recipient_len = buf.get_u8() as usize;
        if buf.len() < recipient_len {
            return Err(PacketError::Truncated);
        }

        let recipient_id = buf.split_to(recipient_len);

        Ok((
            Self {
                version,
                encryption,
                sequence,
                timestamp_ns,
                recipient_id,
            },
            buf,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_and_payload() {
        let header = Header::new(EncryptionKind::Aes256Gcm, 42, 1_700_000_000_000_000_000, Bytes::from_static(b"peer-a"));
        let encoded = header.encode(b"hello").unwrap();
        let (decoded, payload) = Header::decode(encoded.freeze()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn rejects_unsupported_version() {
        let header = Header::new(EncryptionKind::None, 1, 0, Bytes::new());
        let mut encoded = header.encode(b"x").unwrap();
        encoded[0] = 9;
        let err = Header::decode(encoded.freeze()).unwrap_err();
        assert_eq!(err, PacketError::UnsupportedVersion(9));
    }

    #[test]
    fn rejects_unsupported_encryption_tag() {
        let header = Header::new(EncryptionKind::None, 1, 0, Bytes::new());
        let mut encoded = header.encode(b"x").unwrap();
        encoded[1] = 0xEE;
        let err = Header::decode(encoded.freeze()).unwrap_err();
        assert_eq!(err, PacketError::UnsupportedEncryption(0xEE));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let err = Header::decode(Bytes::from_static(b"\x01\x00")).unwrap_err();
        assert_eq!(err, PacketError::Truncated);
    }

    #[test]
    fn rejects_recipient_id_over_255_bytes() {
        let header = Header::new(EncryptionKind::None, 1, 0, Bytes::from(vec![0u8; 256]));
        assert_eq!(header.encode(b"x").unwrap_err(), PacketError::RecipientIdTooLong);
    }
}
