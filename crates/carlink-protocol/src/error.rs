use crate::service::ServiceType;

/// Errors that can occur during frame encoding, decoding and reassembly.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header version nibble is outside the supported range.
    #[error("invalid protocol version {0} in frame header")]
    InvalidVersion(u8),

    /// The header frame type bits do not name a known frame type.
    #[error("invalid frame type {0}")]
    InvalidFrameType(u8),

    /// A frame or message exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A control frame carries an unknown frame info value.
    #[error("unknown control frame 0x{0:02X}")]
    UnknownControlFrame(u8),

    /// A control frame that only the client may send arrived from the peer.
    #[error("unexpected control frame {0} from peer")]
    UnexpectedControlFrame(&'static str),

    /// A first frame did not carry the 8-byte size/count preamble.
    #[error("malformed first frame ({len} bytes of data, expected 8)")]
    MalformedFirstFrame { len: usize },

    /// A consecutive frame arrived with no message in progress.
    #[error("consecutive frame without first frame on session {session_id}")]
    UnexpectedConsecutiveFrame { session_id: u8 },

    /// A consecutive frame arrived out of order.
    #[error("out-of-sequence frame on session {session_id} (expected {expected}, got {actual})")]
    OutOfSequence {
        session_id: u8,
        expected: u8,
        actual: u8,
    },

    /// Reassembled data length disagrees with the declared length.
    #[error("length mismatch (declared {declared} bytes, received {actual})")]
    LengthMismatch { declared: usize, actual: usize },

    /// The binary RPC header is truncated or inconsistent.
    #[error("malformed rpc header: {0}")]
    MalformedRpcHeader(String),

    /// Protocol version 1 cannot carry bulk data.
    #[error("bulk data requires protocol version 2 or later (negotiated {version})")]
    BulkDataUnsupported { version: u8 },

    /// Bulk data is only carried by RPC and bulk-data services.
    #[error("bulk data is not carried on the {0} service")]
    BulkDataNotAllowed(ServiceType),

    /// Heartbeat frames require protocol version 3 or later.
    #[error("heartbeat requires protocol version 3 or later (negotiated {version})")]
    HeartbeatUnsupported { version: u8 },

    /// The structured payload could not be (de)serialized.
    #[error("json payload error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred while reading frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
