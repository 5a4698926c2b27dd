//! Control frame kinds (frame info byte of `FrameType::Control` frames).

use crate::error::{FrameError, Result};

pub const HEARTBEAT: u8 = 0x00;
pub const START_SERVICE: u8 = 0x01;
pub const START_SERVICE_ACK: u8 = 0x02;
pub const START_SERVICE_NACK: u8 = 0x03;
pub const END_SERVICE: u8 = 0x04;
pub const END_SERVICE_ACK: u8 = 0x05;
pub const END_SERVICE_NACK: u8 = 0x06;
pub const HEARTBEAT_ACK: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrameKind {
    Heartbeat,
    StartService,
    StartServiceAck,
    StartServiceNack,
    EndService,
    EndServiceAck,
    EndServiceNack,
    HeartbeatAck,
}

impl ControlFrameKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            HEARTBEAT => Ok(Self::Heartbeat),
            START_SERVICE => Ok(Self::StartService),
            START_SERVICE_ACK => Ok(Self::StartServiceAck),
            START_SERVICE_NACK => Ok(Self::StartServiceNack),
            END_SERVICE => Ok(Self::EndService),
            END_SERVICE_ACK => Ok(Self::EndServiceAck),
            END_SERVICE_NACK => Ok(Self::EndServiceNack),
            HEARTBEAT_ACK => Ok(Self::HeartbeatAck),
            other => Err(FrameError::UnknownControlFrame(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Heartbeat => HEARTBEAT,
            Self::StartService => START_SERVICE,
            Self::StartServiceAck => START_SERVICE_ACK,
            Self::StartServiceNack => START_SERVICE_NACK,
            Self::EndService => END_SERVICE,
            Self::EndServiceAck => END_SERVICE_ACK,
            Self::EndServiceNack => END_SERVICE_NACK,
            Self::HeartbeatAck => HEARTBEAT_ACK,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::StartService => "START_SERVICE",
            Self::StartServiceAck => "START_SERVICE_ACK",
            Self::StartServiceNack => "START_SERVICE_NACK",
            Self::EndService => "END_SERVICE",
            Self::EndServiceAck => "END_SERVICE_ACK",
            Self::EndServiceNack => "END_SERVICE_NACK",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
        }
    }
}
