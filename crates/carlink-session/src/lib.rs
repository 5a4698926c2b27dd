//! Session layer for head-unit links.
//!
//! Many application sessions share one physical link. The [`Multiplexer`]
//! opens the link when the first [`Session`] registers, routes inbound
//! messages and control events to sessions by head-unit assigned id, keeps
//! each session alive with a [`HeartbeatMonitor`], and closes the link when
//! the last session leaves.
//!
//! Audio, video and bulk RPC payloads are fed from any [`std::io::Read`]
//! through background packetizers; [`stream_pipe`] gives a `Write` end for
//! callers that produce data incrementally.

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod multiplexer;
pub mod packetizer;
pub mod session;

pub use config::{HeartbeatConfig, LinkConfig, MultiplexerConfig};
pub use error::{Result, SessionError};
pub use heartbeat::{HeartbeatListener, HeartbeatMonitor, HeartbeatState};
pub use multiplexer::Multiplexer;
pub use packetizer::{
    stream_pipe, PacketSink, PipeReader, PipeWriter, RpcPacketizer, StreamPacketizer,
};
pub use session::{Session, SessionListener};
