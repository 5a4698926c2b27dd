//! Service (session) types carried in byte 1 of every frame header.
//!
//! A session is started per service type; the head unit assigns the session
//! id when it grants the start request.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol control (heartbeat, service start/end).
pub const CONTROL: u8 = 0x00;

/// Remote procedure calls (requests, responses, notifications).
pub const RPC: u8 = 0x07;

/// PCM audio stream.
pub const AUDIO: u8 = 0x0A;

/// Navigation video stream.
pub const VIDEO: u8 = 0x0B;

/// Large RPC payloads carried as bulk data.
pub const BULK_DATA: u8 = 0x0F;

/// Purpose of a session, negotiated at session-start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Control,
    Rpc,
    Audio,
    Video,
    BulkData,
    Other(u8),
}

impl ServiceType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            CONTROL => ServiceType::Control,
            RPC => ServiceType::Rpc,
            AUDIO => ServiceType::Audio,
            VIDEO => ServiceType::Video,
            BULK_DATA => ServiceType::BulkData,
            other => ServiceType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ServiceType::Control => CONTROL,
            ServiceType::Rpc => RPC,
            ServiceType::Audio => AUDIO,
            ServiceType::Video => VIDEO,
            ServiceType::BulkData => BULK_DATA,
            ServiceType::Other(value) => value,
        }
    }

    /// Returns a human-readable name for the service.
    pub fn name(self) -> &'static str {
        match self {
            ServiceType::Control => "CONTROL",
            ServiceType::Rpc => "RPC",
            ServiceType::Audio => "AUDIO",
            ServiceType::Video => "VIDEO",
            ServiceType::BulkData => "BULK_DATA",
            ServiceType::Other(_) => "OTHER",
        }
    }

    /// Returns true if message data on this service starts with a binary
    /// RPC header (protocol version 2 and later).
    pub fn carries_rpc_header(self) -> bool {
        matches!(self, ServiceType::Rpc | ServiceType::BulkData)
    }

    /// Returns true for continuous media services.
    pub fn is_stream(self) -> bool {
        matches!(self, ServiceType::Audio | ServiceType::Video)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceType::Other(value) => write!(f, "OTHER(0x{value:02X})"),
            known => f.write_str(known.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_values_map_both_ways() {
        for service in [
            ServiceType::Control,
            ServiceType::Rpc,
            ServiceType::Audio,
            ServiceType::Video,
            ServiceType::BulkData,
        ] {
            assert_eq!(ServiceType::from_u8(service.as_u8()), service);
        }
    }

    #[test]
    fn unknown_values_are_preserved() {
        let service = ServiceType::from_u8(0x42);
        assert_eq!(service, ServiceType::Other(0x42));
        assert_eq!(service.as_u8(), 0x42);
        assert_eq!(service.to_string(), "OTHER(0x42)");
    }

    #[test]
    fn classification() {
        assert!(ServiceType::Rpc.carries_rpc_header());
        assert!(ServiceType::BulkData.carries_rpc_header());
        assert!(!ServiceType::Video.carries_rpc_header());
        assert!(ServiceType::Audio.is_stream());
        assert!(!ServiceType::Rpc.is_stream());
    }
}
