use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::service::ServiceType;

/// Version 1 header: flags (1) + service (1) + info (1) + session (1) + size (4).
pub const V1_HEADER_SIZE: usize = 8;

/// Version 2+ header: the v1 fields followed by a 4-byte message id.
pub const V2_HEADER_SIZE: usize = 12;

/// Lowest protocol version understood on the wire.
pub const MIN_PROTOCOL_VERSION: u8 = 1;

/// Highest protocol version understood on the wire.
pub const MAX_PROTOCOL_VERSION: u8 = 5;

/// Maximum frame size (header included) for protocol versions 1 and 2.
pub const V1_MTU: usize = 1500;

/// Maximum frame size (header included) for protocol version 3 and later.
pub const V3_MTU: usize = 131_072;

const COMPRESSED_FLAG: u8 = 0x08;
const FRAME_TYPE_MASK: u8 = 0x07;

/// Header size for a protocol version.
pub fn header_size(version: u8) -> usize {
    if version >= 2 {
        V2_HEADER_SIZE
    } else {
        V1_HEADER_SIZE
    }
}

/// Largest data section that fits in one frame at `version`.
pub fn max_frame_data(version: u8) -> usize {
    let mtu = if version >= 3 { V3_MTU } else { V1_MTU };
    mtu - header_size(version)
}

/// Frame type bits of header byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Control,
    Single,
    First,
    Consecutive,
}

impl FrameType {
    pub fn from_bits(bits: u8) -> Result<Self> {
        match bits {
            0 => Ok(FrameType::Control),
            1 => Ok(FrameType::Single),
            2 => Ok(FrameType::First),
            3 => Ok(FrameType::Consecutive),
            other => Err(FrameError::InvalidFrameType(other)),
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            FrameType::Control => 0,
            FrameType::Single => 1,
            FrameType::First => 2,
            FrameType::Consecutive => 3,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub compressed: bool,
    pub frame_type: FrameType,
    pub service_type: ServiceType,
    /// Control frame kind, or consecutive-frame sequence number.
    pub frame_info: u8,
    pub session_id: u8,
    pub data_size: u32,
    /// Absent (zero) on version 1 frames.
    pub message_id: u32,
}

impl FrameHeader {
    pub fn new(
        version: u8,
        frame_type: FrameType,
        service_type: ServiceType,
        frame_info: u8,
        session_id: u8,
    ) -> Self {
        Self {
            version,
            compressed: false,
            frame_type,
            service_type,
            frame_info,
            session_id,
            data_size: 0,
            message_id: 0,
        }
    }

    pub fn with_message_id(mut self, message_id: u32) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn header_size(&self) -> usize {
        header_size(self.version)
    }
}

/// One physical frame: header plus its data section.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    pub data: Bytes,
}

impl Frame {
    /// The total wire size of this frame (header + data).
    pub fn wire_size(&self) -> usize {
        self.header.header_size() + self.data.len()
    }
}

/// Encode one frame into the wire format.
///
/// The header's `data_size` is taken from `data`. Wire format:
/// ```text
/// ┌────────────────────┬─────────┬───────┬─────────┬───────────┬─────────────┬──────────┐
/// │ ver:4 comp:1 typ:3 │ service │ info  │ session │ size (4B) │ msg id (4B) │ data     │
/// │                    │  (1B)   │ (1B)  │  (1B)   │ BE        │ BE, v2+     │          │
/// └────────────────────┴─────────┴───────┴─────────┴───────────┴─────────────┴──────────┘
/// ```
pub fn encode_frame(header: &FrameHeader, data: &[u8], dst: &mut BytesMut) -> Result<()> {
    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&header.version) {
        return Err(FrameError::InvalidVersion(header.version));
    }
    if data.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: data.len(),
            max: u32::MAX as usize,
        });
    }

    let mut flags = (header.version << 4) | header.frame_type.bits();
    if header.compressed {
        flags |= COMPRESSED_FLAG;
    }

    dst.reserve(header.header_size() + data.len());
    dst.put_u8(flags);
    dst.put_u8(header.service_type.as_u8());
    dst.put_u8(header.frame_info);
    dst.put_u8(header.session_id);
    dst.put_u32(data.len() as u32);
    if header.version >= 2 {
        dst.put_u32(header.message_id);
    }
    dst.put_slice(data);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. On error the buffer
/// is left untouched; the stream has lost synchronization.
pub fn decode_frame(src: &mut BytesMut, max_frame_data: usize) -> Result<Option<Frame>> {
    if src.is_empty() {
        return Ok(None);
    }

    let flags = src[0];
    let version = flags >> 4;
    if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
        return Err(FrameError::InvalidVersion(version));
    }
    let frame_type = FrameType::from_bits(flags & FRAME_TYPE_MASK)?;

    let header_len = header_size(version);
    if src.len() < header_len {
        return Ok(None);
    }

    let data_size = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
    let message_id = if version >= 2 {
        u32::from_be_bytes([src[8], src[9], src[10], src[11]])
    } else {
        0
    };

    if data_size as usize > max_frame_data {
        return Err(FrameError::PayloadTooLarge {
            size: data_size as usize,
            max: max_frame_data,
        });
    }

    let total = header_len + data_size as usize;
    if src.len() < total {
        return Ok(None);
    }

    let header = FrameHeader {
        version,
        compressed: flags & COMPRESSED_FLAG != 0,
        frame_type,
        service_type: ServiceType::from_u8(src[1]),
        frame_info: src[2],
        session_id: src[3],
        data_size,
        message_id,
    };

    src.advance(header_len);
    let data = src.split_to(data_size as usize).freeze();

    Ok(Some(Frame { header, data }))
}
