//! Client-side communication stack for in-vehicle head units.
//!
//! carlink exchanges structured RPC messages and continuous audio, video and
//! bulk-data streams with a head unit over TCP, Bluetooth RFCOMM or a USB
//! accessory link. Many logical sessions share one physical link.
//!
//! # Crate Structure
//!
//! - [`transport`] — Physical link abstraction and backends
//! - [`protocol`] — Frame codec, reassembly and session control frames
//! - [`session`] — Session multiplexer, heartbeats and stream packetizers
//!   (behind `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use carlink_transport::*;
}

/// Re-export protocol types.
pub mod protocol {
    pub use carlink_protocol::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use carlink_session::*;
}
