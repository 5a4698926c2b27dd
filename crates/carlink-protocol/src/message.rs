//! Complete logical messages and the binary RPC header.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};
use crate::service::ServiceType;

/// Size of the binary RPC header carried by protocol version 2 and later.
pub const RPC_HEADER_SIZE: usize = 12;

/// Function ids occupy the low 28 bits of the first header word.
pub const MAX_FUNCTION_ID: u32 = 0x0FFF_FFFF;

/// Kind of RPC carried in the high nibble of the RPC header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcType {
    #[default]
    Request,
    Response,
    Notification,
}

impl RpcType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RpcType::Request),
            1 => Ok(RpcType::Response),
            2 => Ok(RpcType::Notification),
            other => Err(FrameError::MalformedRpcHeader(format!(
                "unknown rpc type {other}"
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RpcType::Request => 0,
            RpcType::Response => 1,
            RpcType::Notification => 2,
        }
    }
}

/// Binary header preceding the JSON payload of RPC messages.
///
/// ```text
/// ┌──────────────────────────────┬──────────────────┬───────────────┐
/// │ rpc type:4 | function id:28  │ correlation (4B) │ json size (4B)│
/// └──────────────────────────────┴──────────────────┴───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcHeader {
    pub rpc_type: RpcType,
    pub function_id: u32,
    pub correlation_id: u32,
    pub json_size: u32,
}

impl RpcHeader {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.function_id > MAX_FUNCTION_ID {
            return Err(FrameError::MalformedRpcHeader(format!(
                "function id 0x{:X} exceeds 28 bits",
                self.function_id
            )));
        }
        dst.put_u32((u32::from(self.rpc_type.as_u8()) << 28) | self.function_id);
        dst.put_u32(self.correlation_id);
        dst.put_u32(self.json_size);
        Ok(())
    }

    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < RPC_HEADER_SIZE {
            return Err(FrameError::MalformedRpcHeader(format!(
                "{} bytes, expected at least {RPC_HEADER_SIZE}",
                src.len()
            )));
        }
        let word = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        Ok(Self {
            rpc_type: RpcType::from_u8((word >> 28) as u8)?,
            function_id: word & MAX_FUNCTION_ID,
            correlation_id: u32::from_be_bytes([src[4], src[5], src[6], src[7]]),
            json_size: u32::from_be_bytes([src[8], src[9], src[10], src[11]]),
        })
    }
}

/// One complete logical message, independent of how it was framed.
///
/// For RPC services `payload` holds the JSON structured payload; for media
/// services it holds raw stream bytes. `version` is stamped by the framer on
/// both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub service_type: ServiceType,
    pub session_id: u8,
    pub version: u8,
    pub rpc_type: RpcType,
    pub function_id: u32,
    pub correlation_id: u32,
    pub payload: Bytes,
    /// Raw segment after the JSON. Never `Some` and empty: on the wire an
    /// empty segment is indistinguishable from none.
    pub bulk_data: Option<Bytes>,
}

impl ProtocolMessage {
    /// An RPC message with a pre-serialized JSON payload.
    pub fn rpc(
        rpc_type: RpcType,
        function_id: u32,
        correlation_id: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            service_type: ServiceType::Rpc,
            session_id: 0,
            version: 0,
            rpc_type,
            function_id,
            correlation_id,
            payload: payload.into(),
            bulk_data: None,
        }
    }

    /// An RPC message whose payload is `value` serialized as JSON.
    pub fn rpc_json<T: Serialize>(
        rpc_type: RpcType,
        function_id: u32,
        correlation_id: u32,
        value: &T,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::rpc(rpc_type, function_id, correlation_id, payload))
    }

    /// A raw media message (audio or video).
    pub fn stream(service_type: ServiceType, data: impl Into<Bytes>) -> Self {
        Self {
            service_type,
            session_id: 0,
            version: 0,
            rpc_type: RpcType::Request,
            function_id: 0,
            correlation_id: 0,
            payload: data.into(),
            bulk_data: None,
        }
    }

    pub fn with_session_id(mut self, session_id: u8) -> Self {
        self.session_id = session_id;
        self
    }

    /// Attach bulk data, moving the message to the bulk-data service when
    /// it was a plain RPC. Empty bulk data clears the segment.
    pub fn with_bulk_data(mut self, bulk: impl Into<Bytes>) -> Self {
        if self.service_type == ServiceType::Rpc {
            self.service_type = ServiceType::BulkData;
        }
        let bulk = bulk.into();
        self.bulk_data = (!bulk.is_empty()).then_some(bulk);
        self
    }

    /// Parse the structured payload. An empty payload parses as `null`.
    pub fn json(&self) -> Result<serde_json::Value> {
        if self.payload.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn bulk_len(&self) -> usize {
        self.bulk_data.as_ref().map_or(0, Bytes::len)
    }

    /// Serialize the message data section (everything that gets split
    /// across frames) for `version`.
    pub fn encode_data(&self, version: u8) -> Result<Bytes> {
        if !self.service_type.carries_rpc_header() {
            if self.bulk_data.is_some() {
                return Err(FrameError::BulkDataNotAllowed(self.service_type));
            }
            return Ok(self.payload.clone());
        }

        if version < 2 {
            if self.bulk_data.is_some() {
                return Err(FrameError::BulkDataUnsupported { version });
            }
            return Ok(self.payload.clone());
        }

        let json_size = u32::try_from(self.payload.len()).map_err(|_| {
            FrameError::PayloadTooLarge {
                size: self.payload.len(),
                max: u32::MAX as usize,
            }
        })?;

        let mut buf = BytesMut::with_capacity(RPC_HEADER_SIZE + self.payload.len() + self.bulk_len());
        RpcHeader {
            rpc_type: self.rpc_type,
            function_id: self.function_id,
            correlation_id: self.correlation_id,
            json_size,
        }
        .encode(&mut buf)?;
        buf.put_slice(&self.payload);
        if let Some(bulk) = &self.bulk_data {
            buf.put_slice(bulk);
        }
        Ok(buf.freeze())
    }

    /// Rebuild a message from a reassembled data section.
    pub fn decode_data(
        service_type: ServiceType,
        session_id: u8,
        version: u8,
        data: Bytes,
    ) -> Result<Self> {
        let mut message = Self::stream(service_type, Bytes::new()).with_session_id(session_id);
        message.version = version;

        if !service_type.carries_rpc_header() || version < 2 {
            message.payload = data;
            return Ok(message);
        }

        let header = RpcHeader::decode(&data)?;
        let json_end = RPC_HEADER_SIZE + header.json_size as usize;
        if json_end > data.len() {
            return Err(FrameError::LengthMismatch {
                declared: header.json_size as usize,
                actual: data.len() - RPC_HEADER_SIZE,
            });
        }

        message.rpc_type = header.rpc_type;
        message.function_id = header.function_id;
        message.correlation_id = header.correlation_id;
        message.payload = data.slice(RPC_HEADER_SIZE..json_end);
        if json_end < data.len() {
            message.bulk_data = Some(data.slice(json_end..));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_header_layout() {
        let mut buf = BytesMut::new();
        RpcHeader {
            rpc_type: RpcType::Notification,
            function_id: 0x0000_8001,
            correlation_id: 7,
            json_size: 3,
        }
        .encode(&mut buf)
        .unwrap();

        assert_eq!(
            buf.as_ref(),
            &[0x20, 0x00, 0x80, 0x01, 0, 0, 0, 7, 0, 0, 0, 3]
        );
        let header = RpcHeader::decode(&buf).unwrap();
        assert_eq!(header.rpc_type, RpcType::Notification);
        assert_eq!(header.function_id, 0x8001);
    }

    #[test]
    fn function_id_must_fit_28_bits() {
        let mut buf = BytesMut::new();
        let err = RpcHeader {
            rpc_type: RpcType::Request,
            function_id: 0x1000_0000,
            correlation_id: 0,
            json_size: 0,
        }
        .encode(&mut buf)
        .unwrap_err();
        assert!(matches!(err, FrameError::MalformedRpcHeader(_)));
    }

    #[test]
    fn rpc_data_with_bulk_v2() {
        let message = ProtocolMessage::rpc(RpcType::Request, 12, 99, &b"{\"a\":1}"[..])
            .with_bulk_data(vec![1u8, 2, 3]);
        assert_eq!(message.service_type, ServiceType::BulkData);

        let data = message.encode_data(2).unwrap();
        assert_eq!(data.len(), RPC_HEADER_SIZE + 7 + 3);

        let decoded =
            ProtocolMessage::decode_data(ServiceType::BulkData, 4, 2, data).unwrap();
        assert_eq!(decoded.session_id, 4);
        assert_eq!(decoded.function_id, 12);
        assert_eq!(decoded.correlation_id, 99);
        assert_eq!(decoded.payload.as_ref(), b"{\"a\":1}");
        assert_eq!(decoded.bulk_data.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(decoded.json().unwrap()["a"], 1);
    }

    #[test]
    fn empty_bulk_data_is_no_bulk_data() {
        let message = ProtocolMessage::rpc(RpcType::Request, 12, 7, &b"{}"[..])
            .with_session_id(4)
            .with_bulk_data(Bytes::new());
        assert_eq!(message.service_type, ServiceType::BulkData);
        assert_eq!(message.bulk_data, None);
        assert_eq!(message.bulk_len(), 0);

        let data = message.encode_data(2).unwrap();
        let mut decoded =
            ProtocolMessage::decode_data(ServiceType::BulkData, 4, 2, data).unwrap();
        decoded.version = message.version;
        assert_eq!(decoded, message);
    }

    #[test]
    fn v1_rpc_is_raw_json() {
        let message = ProtocolMessage::rpc_json(
            RpcType::Request,
            1,
            1,
            &serde_json::json!({"hello": "world"}),
        )
        .unwrap();
        let data = message.encode_data(1).unwrap();
        assert_eq!(data, message.payload);

        let decoded = ProtocolMessage::decode_data(ServiceType::Rpc, 1, 1, data).unwrap();
        assert_eq!(decoded.json().unwrap()["hello"], "world");
        assert_eq!(decoded.function_id, 0);
    }

    #[test]
    fn v1_rejects_bulk_data() {
        let message = ProtocolMessage::rpc(RpcType::Request, 1, 1, Bytes::new())
            .with_bulk_data(vec![0u8; 4]);
        assert!(matches!(
            message.encode_data(1),
            Err(FrameError::BulkDataUnsupported { version: 1 })
        ));
    }

    #[test]
    fn stream_rejects_bulk_data() {
        let message = ProtocolMessage::stream(ServiceType::Video, vec![0u8; 4])
            .with_bulk_data(vec![0u8; 4]);
        assert!(matches!(
            message.encode_data(3),
            Err(FrameError::BulkDataNotAllowed(ServiceType::Video))
        ));
    }

    #[test]
    fn declared_json_size_beyond_data() {
        let mut buf = BytesMut::new();
        RpcHeader {
            rpc_type: RpcType::Response,
            function_id: 1,
            correlation_id: 1,
            json_size: 50,
        }
        .encode(&mut buf)
        .unwrap();
        buf.put_slice(b"{}");

        let err = ProtocolMessage::decode_data(ServiceType::Rpc, 1, 2, buf.freeze()).unwrap_err();
        assert!(matches!(
            err,
            FrameError::LengthMismatch {
                declared: 50,
                actual: 2
            }
        ));
    }

    #[test]
    fn truncated_rpc_header() {
        let err = ProtocolMessage::decode_data(ServiceType::Rpc, 1, 3, Bytes::from_static(b"abc"))
            .unwrap_err();
        assert!(matches!(err, FrameError::MalformedRpcHeader(_)));
    }

    #[test]
    fn empty_payload_is_null() {
        let message = ProtocolMessage::stream(ServiceType::Audio, Bytes::new());
        assert_eq!(message.json().unwrap(), serde_json::Value::Null);
    }
}
