//! Frame encoding and decoding.
//!
//! Every wire message is one frame: an 8-byte big-endian header (version,
//! message type, payload length) followed by an rkyv-serialised envelope.
//! Header parsing validates everything up front, so a parsed header is
//! always safe to read a payload for.

use rkyv::api::high::{HighDeserializer, HighSerializer, HighValidator};
use rkyv::bytecheck::CheckBytes;
use rkyv::rancor::Error as RkyvError;
use rkyv::ser::allocator::ArenaHandle;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::version;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum frame payload size (10 MB).
///
/// Object payloads larger than this are split into chunk frames.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Message type discriminant, one per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Scheduler service message.
    Scheduler = 0x01,
    /// Object store service message.
    ObjStore = 0x02,
    /// Worker service message.
    Worker = 0x03,
}

impl MessageType {
    /// Returns the numeric value of this message type.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::Scheduler),
            0x02 => Ok(Self::ObjStore),
            0x03 => Ok(Self::Worker),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Frame header for protocol messages.
///
/// Wire format (8 bytes, big-endian):
/// - Bytes 0-1: Protocol version (u16)
/// - Bytes 2-3: Message type (u16)
/// - Bytes 4-7: Payload length (u32)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version.
    pub version: u16,
    /// Message type discriminant.
    pub message_type: MessageType,
    /// Length of the payload in bytes.
    pub payload_len: u32,
}

impl FrameHeader {
    /// Builds a current-version header for a payload of `payload_len`
    /// bytes, refusing payloads over the frame limit.
    pub fn for_payload(message_type: MessageType, payload_len: usize) -> Result<Self, ProtocolError> {
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload_len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self {
            version: version::CURRENT,
            message_type,
            payload_len: payload_len as u32,
        })
    }

    /// Serialises the header into its wire form.
    #[must_use]
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.message_type.as_u16().to_be_bytes());
        buf[4..].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Parses and validates a header from its wire form.
    ///
    /// Rejects unsupported versions, unknown message types, and payload
    /// lengths over the frame limit.
    pub fn parse(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let version = u16::from_be_bytes([bytes[0], bytes[1]]);
        if !(version::MIN_SUPPORTED..=version::CURRENT).contains(&version) {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let message_type = MessageType::try_from(u16::from_be_bytes([bytes[2], bytes[3]]))?;

        let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if payload_len as usize > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload_len as usize,
                max: MAX_MESSAGE_SIZE,
            });
        }

        Ok(Self {
            version,
            message_type,
            payload_len,
        })
    }
}

/// Reusable frame encoder.
///
/// Holds the encode buffer across calls so steady-state framing does not
/// allocate.
#[derive(Debug, Default)]
pub struct Codec {
    buffer: Vec<u8>,
}

impl Codec {
    /// Creates a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a codec with pre-allocated buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encodes an envelope into a complete frame (header + payload),
    /// returning the bytes to put on the wire.
    pub fn frame<T>(
        &mut self,
        message_type: MessageType,
        envelope: &crate::Envelope<T>,
    ) -> Result<&[u8], ProtocolError>
    where
        T: Archive,
        crate::Envelope<T>: for<'a> Serialize<HighSerializer<AlignedVec, ArenaHandle<'a>, RkyvError>>,
    {
        let payload =
            rkyv::to_bytes::<RkyvError>(envelope).map_err(|e| ProtocolError::Serialisation(e.to_string()))?;
        let header = FrameHeader::for_payload(message_type, payload.len())?;

        self.buffer.clear();
        self.buffer.extend_from_slice(&header.to_bytes());
        self.buffer.extend_from_slice(&payload);
        Ok(&self.buffer)
    }
}

/// Decodes a message from frame payload bytes (everything after the
/// header).
pub fn decode_payload<T>(bytes: &[u8]) -> Result<T, ProtocolError>
where
    T: Archive,
    T::Archived:
        for<'a> CheckBytes<HighValidator<'a, RkyvError>> + Deserialize<T, HighDeserializer<RkyvError>>,
{
    rkyv::from_bytes::<T, RkyvError>(bytes).map_err(|e| ProtocolError::Deserialisation(e.to_string()))
}
