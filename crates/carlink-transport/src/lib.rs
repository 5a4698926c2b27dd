//! Physical link abstraction for talking to an in-vehicle head unit.
//!
//! Provides a unified interface over interchangeable transports:
//! - TCP/IP sockets
//! - Bluetooth RFCOMM device nodes
//! - USB accessory device nodes
//!
//! This is the lowest layer of carlink. The protocol framer and session
//! multiplexer drive a [`Transport`] and receive its events through a
//! [`TransportListener`].

pub mod config;
pub mod error;
pub mod stream;
pub mod traits;

pub use config::{TransportConfig, TransportKind, TransportType};
pub use error::{Result, TransportError};
pub use stream::{connect_once, DefaultTransportFactory, StreamTransport};
pub use traits::{LinkStream, Transport, TransportFactory, TransportListener};
