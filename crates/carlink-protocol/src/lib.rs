//! Head-unit link protocol: frame codec, reassembly and session control.
//!
//! Every frame carries an 8-byte (version 1) or 12-byte (version 2+)
//! header naming the service, session id and frame kind. Logical messages
//! larger than one frame are split into a first frame plus numbered
//! consecutive frames. RPC messages at version 2+ begin with a binary RPC
//! header followed by a JSON payload and optional bulk data.
//!
//! [`ProtocolFramer`] holds the per-link state: negotiated version, message
//! id counter and per-session reassembly buffers.

pub mod codec;
pub mod control;
pub mod error;
pub mod framer;
pub mod message;
pub mod reader;
pub mod service;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, header_size, max_frame_data, Frame, FrameHeader, FrameType,
    MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, V1_HEADER_SIZE, V2_HEADER_SIZE,
};
pub use control::ControlFrameKind;
pub use error::{FrameError, Result};
pub use framer::{
    encode_peer_control, FramerConfig, FramerEvent, ProtocolFramer, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use message::{ProtocolMessage, RpcHeader, RpcType, MAX_FUNCTION_ID, RPC_HEADER_SIZE};
pub use reader::FrameReader;
pub use service::ServiceType;
pub use writer::FrameWriter;
