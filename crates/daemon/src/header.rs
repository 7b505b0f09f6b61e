//! Outer wire framing.
//!
//! Every datagram on the overlay starts with a fixed 16-byte header:
//! version, message type, subtype, a reserved byte, the receiver's session
//! index (big-endian u32) and the message counter (big-endian u64). The
//! raw header bytes double as the AEAD associated data, so the layout must
//! stay byte-stable across peers.

use thiserror::Error;

/// Fixed outer header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Wire protocol version emitted by this node.
pub const PROTOCOL_VERSION: u8 = 1;

/// Test message subtype: request, expects an echo.
pub const TEST_REQUEST: u8 = 1;
/// Test message subtype: reply to a request.
pub const TEST_REPLY: u8 = 2;

/// Message type tags carried in byte 1 of the outer header.
///
/// The numeric assignments are part of the wire contract and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Message = 1,
    LightHouse = 2,
    RecvError = 3,
    Test = 4,
    CloseTunnel = 5,
    Handshake = 6,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MsgType::Message),
            2 => Some(MsgType::LightHouse),
            3 => Some(MsgType::RecvError),
            4 => Some(MsgType::Test),
            5 => Some(MsgType::CloseTunnel),
            6 => Some(MsgType::Handshake),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::Message => "message",
            MsgType::LightHouse => "lighthouse",
            MsgType::RecvError => "recv_error",
            MsgType::Test => "test",
            MsgType::CloseTunnel => "close_tunnel",
            MsgType::Handshake => "handshake",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("header requires {HEADER_LEN} bytes, got {0}")]
    Truncated(usize),
}

/// Parsed outer header.
///
/// `msg_type` is kept raw so the dispatcher can account for unknown tags;
/// use [`Header::typed`] to get the closed tag set. Version mismatches are
/// likewise surfaced, not rejected, at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: u8,
    pub subtype: u8,
    pub remote_index: u32,
    pub counter: u64,
}

impl Header {
    /// Parse the fixed-layout header from the front of a datagram.
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::Truncated(buf.len()));
        }

        Ok(Self {
            version: buf[0],
            msg_type: buf[1],
            subtype: buf[2],
            remote_index: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            counter: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }

    pub fn typed(&self) -> Option<MsgType> {
        MsgType::from_u8(self.msg_type)
    }

    /// Emit the fixed layout. The reserved byte is always zero.
    pub fn encode(
        version: u8,
        msg_type: MsgType,
        subtype: u8,
        remote_index: u32,
        counter: u64,
    ) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = version;
        buf[1] = msg_type as u8;
        buf[2] = subtype;
        buf[4..8].copy_from_slice(&remote_index.to_be_bytes());
        buf[8..16].copy_from_slice(&counter.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let buf = Header::encode(PROTOCOL_VERSION, MsgType::Test, TEST_REPLY, 0xdead_beef, 42);
        let header = Header::parse(&buf).unwrap();

        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.typed(), Some(MsgType::Test));
        assert_eq!(header.subtype, TEST_REPLY);
        assert_eq!(header.remote_index, 0xdead_beef);
        assert_eq!(header.counter, 42);
    }

    #[test]
    fn test_layout_is_byte_stable() {
        let buf = Header::encode(1, MsgType::Message, 0, 0x0102_0304, 0x0506_0708_090a_0b0c);
        assert_eq!(
            buf,
            [1, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0a, 0x0b, 0x0c]
        );
    }

    #[test]
    fn test_truncated_input_rejected() {
        assert_eq!(Header::parse(&[]), Err(HeaderError::Truncated(0)));
        assert_eq!(
            Header::parse(&[1u8; HEADER_LEN - 1]),
            Err(HeaderError::Truncated(15))
        );
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let mut buf = Header::encode(1, MsgType::Message, 0, 7, 7);
        buf[1] = 0xff;
        let header = Header::parse(&buf).unwrap();
        assert_eq!(header.msg_type, 0xff);
        assert_eq!(header.typed(), None);
    }

    #[test]
    fn test_version_mismatch_not_fatal() {
        let buf = Header::encode(9, MsgType::Message, 0, 1, 1);
        let header = Header::parse(&buf).unwrap();
        assert_eq!(header.version, 9);
    }
}
