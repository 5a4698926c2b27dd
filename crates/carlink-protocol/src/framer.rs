//! Frame reassembly and message segmentation for one transport.
//!
//! A [`ProtocolFramer`] owns the inbound byte buffer of a single link plus
//! the per-session reassembly state. Inbound bytes are turned into
//! [`FramerEvent`]s; outbound messages and control requests are turned into
//! the contiguous bytes the transport should send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::codec::{self, decode_frame, encode_frame, Frame, FrameHeader, FrameType};
use crate::control::ControlFrameKind;
use crate::error::{FrameError, Result};
use crate::message::ProtocolMessage;
use crate::service::ServiceType;

/// Default ceiling for one reassembled message (8 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

const FIRST_FRAME_DATA_SIZE: usize = 8;
const INITIAL_BUFFER_CAPACITY: usize = 16 * 1024;

/// Framer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramerConfig {
    /// Highest protocol version this side will negotiate.
    pub max_version: u8,
    /// Override for the per-frame data ceiling on outbound frames.
    pub max_frame_data: Option<usize>,
    /// Largest message accepted for reassembly or sending.
    pub max_message_size: usize,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            max_version: codec::MAX_PROTOCOL_VERSION,
            max_frame_data: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Everything the framer can report about the inbound stream.
#[derive(Debug)]
pub enum FramerEvent {
    /// A frame for this session id arrived (emitted once per batch).
    Activity { session_id: u8 },
    /// A complete logical message.
    Message(ProtocolMessage),
    SessionStarted {
        service_type: ServiceType,
        session_id: u8,
        version: u8,
        hash_id: u32,
    },
    SessionStartNacked {
        service_type: ServiceType,
        session_id: u8,
    },
    SessionEnded {
        service_type: ServiceType,
        session_id: u8,
    },
    SessionEndNacked {
        service_type: ServiceType,
        session_id: u8,
    },
    /// The peer asked for a heartbeat acknowledgement.
    Heartbeat { session_id: u8 },
    HeartbeatAck { session_id: u8 },
    /// A frame was dropped; any partial message it belonged to is discarded.
    ProtocolError {
        session_id: Option<u8>,
        error: FrameError,
    },
}

#[derive(Debug)]
struct Partial {
    declared_size: usize,
    frame_count: u32,
    frames_received: u32,
    next_sequence: u8,
    data: BytesMut,
}

#[derive(Debug, Default)]
struct Inbound {
    buf: BytesMut,
    partials: HashMap<(u8, ServiceType), Partial>,
}

/// Protocol state for one live transport.
#[derive(Debug)]
pub struct ProtocolFramer {
    config: FramerConfig,
    version: AtomicU8,
    next_message_id: AtomicU32,
    inbound: Mutex<Inbound>,
}

impl Default for ProtocolFramer {
    fn default() -> Self {
        Self::new(FramerConfig::default())
    }
}

impl ProtocolFramer {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            version: AtomicU8::new(codec::MIN_PROTOCOL_VERSION),
            next_message_id: AtomicU32::new(1),
            inbound: Mutex::new(Inbound {
                buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
                partials: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    /// Currently negotiated protocol version (1 until the RPC grant).
    pub fn version(&self) -> u8 {
        self.version.load(Ordering::Acquire)
    }

    pub fn supports_heartbeat(&self) -> bool {
        self.version() >= 3
    }

    /// Data ceiling for outbound frames at the negotiated version.
    pub fn max_frame_data(&self) -> usize {
        self.config
            .max_frame_data
            .unwrap_or_else(|| codec::max_frame_data(self.version()))
    }

    fn inbound_frame_limit(&self) -> usize {
        let v3 = codec::max_frame_data(3);
        self.config.max_frame_data.map_or(v3, |limit| limit.max(v3))
    }

    /// Feed raw transport bytes and collect the resulting events.
    pub fn handle_bytes(&self, bytes: &[u8]) -> Vec<FramerEvent> {
        let mut events = Vec::new();
        let mut seen = Vec::new();
        let limit = self.inbound_frame_limit();

        let mut inbound = lock(&self.inbound);
        inbound.buf.extend_from_slice(bytes);

        loop {
            match decode_frame(&mut inbound.buf, limit) {
                Ok(Some(frame)) => {
                    let session_id = frame.header.session_id;
                    if !seen.contains(&session_id) {
                        seen.push(session_id);
                        events.push(FramerEvent::Activity { session_id });
                    }
                    self.handle_frame(&mut inbound, frame, &mut events);
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%error, buffered = inbound.buf.len(), "discarding unparseable inbound bytes");
                    inbound.buf.clear();
                    events.push(FramerEvent::ProtocolError {
                        session_id: None,
                        error,
                    });
                    break;
                }
            }
        }

        events
    }

    fn handle_frame(&self, inbound: &mut Inbound, frame: Frame, events: &mut Vec<FramerEvent>) {
        let header = frame.header;
        trace!(
            frame_type = ?header.frame_type,
            service = %header.service_type,
            session_id = header.session_id,
            size = header.data_size,
            "inbound frame"
        );

        let outcome = match header.frame_type {
            FrameType::Control => self.handle_control(&header),
            FrameType::Single => self.decode_message(&header, frame.data).map(Some),
            FrameType::First => self.begin_partial(inbound, &header, &frame.data).map(|()| None),
            FrameType::Consecutive => self.continue_partial(inbound, &header, &frame.data),
        };

        match outcome {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(error) => {
                debug!(%error, session_id = header.session_id, service = %header.service_type, "protocol violation");
                inbound
                    .partials
                    .remove(&(header.session_id, header.service_type));
                events.push(FramerEvent::ProtocolError {
                    session_id: Some(header.session_id),
                    error,
                });
            }
        }
    }

    fn handle_control(&self, header: &FrameHeader) -> Result<Option<FramerEvent>> {
        let service_type = header.service_type;
        let session_id = header.session_id;

        let event = match ControlFrameKind::from_u8(header.frame_info)? {
            ControlFrameKind::Heartbeat => FramerEvent::Heartbeat { session_id },
            ControlFrameKind::HeartbeatAck => FramerEvent::HeartbeatAck { session_id },
            ControlFrameKind::StartServiceAck => {
                if service_type == ServiceType::Rpc {
                    let negotiated = header.version.min(self.config.max_version);
                    self.version.store(negotiated, Ordering::Release);
                    debug!(
                        peer_version = header.version,
                        negotiated, "protocol version negotiated"
                    );
                }
                FramerEvent::SessionStarted {
                    service_type,
                    session_id,
                    version: self.version(),
                    hash_id: header.message_id,
                }
            }
            ControlFrameKind::StartServiceNack => FramerEvent::SessionStartNacked {
                service_type,
                session_id,
            },
            ControlFrameKind::EndService | ControlFrameKind::EndServiceAck => {
                FramerEvent::SessionEnded {
                    service_type,
                    session_id,
                }
            }
            ControlFrameKind::EndServiceNack => FramerEvent::SessionEndNacked {
                service_type,
                session_id,
            },
            ControlFrameKind::StartService => {
                return Err(FrameError::UnexpectedControlFrame(
                    ControlFrameKind::StartService.name(),
                ))
            }
        };
        Ok(Some(event))
    }

    fn decode_message(&self, header: &FrameHeader, data: Bytes) -> Result<FramerEvent> {
        if data.len() > self.config.max_message_size {
            return Err(FrameError::PayloadTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
        }
        ProtocolMessage::decode_data(header.service_type, header.session_id, header.version, data)
            .map(FramerEvent::Message)
    }

    fn begin_partial(&self, inbound: &mut Inbound, header: &FrameHeader, data: &[u8]) -> Result<()> {
        if data.len() != FIRST_FRAME_DATA_SIZE {
            return Err(FrameError::MalformedFirstFrame { len: data.len() });
        }
        let declared_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let frame_count = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if declared_size > self.config.max_message_size {
            return Err(FrameError::PayloadTooLarge {
                size: declared_size,
                max: self.config.max_message_size,
            });
        }

        let key = (header.session_id, header.service_type);
        if inbound.partials.contains_key(&key) {
            debug!(session_id = header.session_id, service = %header.service_type, "first frame replaces unfinished message");
        }
        inbound.partials.insert(
            key,
            Partial {
                declared_size,
                frame_count,
                frames_received: 0,
                next_sequence: 1,
                data: BytesMut::with_capacity(declared_size),
            },
        );
        Ok(())
    }

    fn continue_partial(
        &self,
        inbound: &mut Inbound,
        header: &FrameHeader,
        data: &[u8],
    ) -> Result<Option<FramerEvent>> {
        let key = (header.session_id, header.service_type);
        let partial = inbound
            .partials
            .get_mut(&key)
            .ok_or(FrameError::UnexpectedConsecutiveFrame {
                session_id: header.session_id,
            })?;

        let sequence = header.frame_info;
        let last = sequence == 0;
        if !last && sequence != partial.next_sequence {
            return Err(FrameError::OutOfSequence {
                session_id: header.session_id,
                expected: partial.next_sequence,
                actual: sequence,
            });
        }

        if partial.data.len() + data.len() > partial.declared_size {
            return Err(FrameError::LengthMismatch {
                declared: partial.declared_size,
                actual: partial.data.len() + data.len(),
            });
        }
        partial.data.extend_from_slice(data);
        partial.frames_received += 1;
        partial.next_sequence = if partial.next_sequence == u8::MAX {
            1
        } else {
            partial.next_sequence + 1
        };

        if !last {
            return Ok(None);
        }

        let Some(partial) = inbound.partials.remove(&key) else {
            return Ok(None);
        };
        if partial.data.len() != partial.declared_size {
            return Err(FrameError::LengthMismatch {
                declared: partial.declared_size,
                actual: partial.data.len(),
            });
        }
        if partial.frames_received != partial.frame_count {
            trace!(
                expected = partial.frame_count,
                received = partial.frames_received,
                "frame count differs from first frame"
            );
        }
        self.decode_message(header, partial.data.freeze()).map(Some)
    }

    /// Serialize `message` into one or more frames at the negotiated version.
    ///
    /// The returned bytes are meant to go to the transport in a single send
    /// so that frames of one message are never interleaved with others.
    pub fn encode_message(&self, message: &ProtocolMessage) -> Result<Bytes> {
        let version = self.version();
        let data = message.encode_data(version)?;
        if data.len() > self.config.max_message_size {
            return Err(FrameError::PayloadTooLarge {
                size: data.len(),
                max: self.config.max_message_size,
            });
        }

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let max = self.max_frame_data().max(1);
        let header_len = codec::header_size(version);
        let header = |frame_type, frame_info| {
            FrameHeader::new(
                version,
                frame_type,
                message.service_type,
                frame_info,
                message.session_id,
            )
            .with_message_id(message_id)
        };

        if data.len() <= max {
            let mut out = BytesMut::with_capacity(header_len + data.len());
            encode_frame(&header(FrameType::Single, 0), &data, &mut out)?;
            return Ok(out.freeze());
        }

        let chunks = data.len().div_ceil(max);
        let mut out = BytesMut::with_capacity(data.len() + (chunks + 1) * header_len);

        let mut first = [0u8; FIRST_FRAME_DATA_SIZE];
        first[..4].copy_from_slice(&(data.len() as u32).to_be_bytes());
        first[4..].copy_from_slice(&(chunks as u32).to_be_bytes());
        encode_frame(&header(FrameType::First, 0), &first, &mut out)?;

        let mut sequence: u8 = 0;
        for (index, chunk) in data.chunks(max).enumerate() {
            sequence = if sequence == u8::MAX { 1 } else { sequence + 1 };
            let info = if index + 1 == chunks { 0 } else { sequence };
            encode_frame(&header(FrameType::Consecutive, info), chunk, &mut out)?;
        }

        trace!(
            service = %message.service_type,
            session_id = message.session_id,
            frames = chunks + 1,
            size = data.len(),
            "segmented outbound message"
        );
        Ok(out.freeze())
    }

    fn control_frame(
        &self,
        kind: ControlFrameKind,
        service_type: ServiceType,
        session_id: u8,
        message_id: u32,
    ) -> Result<Bytes> {
        let header = FrameHeader::new(
            self.version(),
            FrameType::Control,
            service_type,
            kind.as_u8(),
            session_id,
        )
        .with_message_id(message_id);
        let mut out = BytesMut::with_capacity(header.header_size());
        encode_frame(&header, &[], &mut out)?;
        Ok(out.freeze())
    }

    /// Start-service request for `service_type`.
    pub fn start_session(&self, service_type: ServiceType, session_id: u8) -> Result<Bytes> {
        self.control_frame(ControlFrameKind::StartService, service_type, session_id, 0)
    }

    /// End-service request carrying the session hash id.
    pub fn end_session(
        &self,
        service_type: ServiceType,
        session_id: u8,
        hash_id: u32,
    ) -> Result<Bytes> {
        self.control_frame(ControlFrameKind::EndService, service_type, session_id, hash_id)
    }

    pub fn heartbeat(&self, session_id: u8) -> Result<Bytes> {
        self.require_heartbeat()?;
        self.control_frame(ControlFrameKind::Heartbeat, ServiceType::Control, session_id, 0)
    }

    pub fn heartbeat_ack(&self, session_id: u8) -> Result<Bytes> {
        self.require_heartbeat()?;
        self.control_frame(ControlFrameKind::HeartbeatAck, ServiceType::Control, session_id, 0)
    }

    fn require_heartbeat(&self) -> Result<()> {
        if self.supports_heartbeat() {
            Ok(())
        } else {
            Err(FrameError::HeartbeatUnsupported {
                version: self.version(),
            })
        }
    }

    /// Drop buffered bytes and unfinished messages.
    pub fn reset(&self) {
        let mut inbound = lock(&self.inbound);
        inbound.buf.clear();
        inbound.partials.clear();
    }
}

/// Encode a control frame as the head unit would send it.
///
/// Used by tools and tests that play the peer role.
pub fn encode_peer_control(
    version: u8,
    kind: ControlFrameKind,
    service_type: ServiceType,
    session_id: u8,
    message_id: u32,
) -> Result<Bytes> {
    let header = FrameHeader::new(version, FrameType::Control, service_type, kind.as_u8(), session_id)
        .with_message_id(message_id);
    let mut out = BytesMut::with_capacity(header.header_size());
    encode_frame(&header, &[], &mut out)?;
    Ok(out.freeze())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RpcType;
    use bytes::BufMut;

    fn put_first_frame(dst: &mut BytesMut, total: u32, count: u32) {
        dst.put_u32(total);
        dst.put_u32(count);
    }

    fn granted(framer: &ProtocolFramer, version: u8) {
        let ack = encode_peer_control(
            version,
            ControlFrameKind::StartServiceAck,
            ServiceType::Rpc,
            1,
            0xABCD,
        )
        .unwrap();
        let events = framer.handle_bytes(&ack);
        assert!(events
            .iter()
            .any(|e| matches!(e, FramerEvent::SessionStarted { .. })));
    }

    fn messages(events: Vec<FramerEvent>) -> Vec<ProtocolMessage> {
        events
            .into_iter()
            .filter_map(|event| match event {
                FramerEvent::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn protocol_errors(events: &[FramerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, FramerEvent::ProtocolError { .. }))
            .count()
    }

    #[test]
    fn start_ack_negotiates_version_and_hash() {
        let framer = ProtocolFramer::new(FramerConfig {
            max_version: 3,
            ..FramerConfig::default()
        });
        assert_eq!(framer.version(), 1);

        let ack = encode_peer_control(5, ControlFrameKind::StartServiceAck, ServiceType::Rpc, 4, 77)
            .unwrap();
        let events = framer.handle_bytes(&ack);

        assert!(matches!(events[0], FramerEvent::Activity { session_id: 4 }));
        match &events[1] {
            FramerEvent::SessionStarted {
                service_type,
                session_id,
                version,
                hash_id,
            } => {
                assert_eq!(*service_type, ServiceType::Rpc);
                assert_eq!(*session_id, 4);
                assert_eq!(*version, 3);
                assert_eq!(*hash_id, 77);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(framer.version(), 3);
        assert!(framer.supports_heartbeat());
    }

    #[test]
    fn stream_ack_keeps_negotiated_version() {
        let framer = ProtocolFramer::default();
        granted(&framer, 2);

        let ack = encode_peer_control(5, ControlFrameKind::StartServiceAck, ServiceType::Video, 1, 0)
            .unwrap();
        let events = framer.handle_bytes(&ack);
        assert!(events.iter().any(|e| matches!(
            e,
            FramerEvent::SessionStarted {
                service_type: ServiceType::Video,
                version: 2,
                ..
            }
        )));
        assert_eq!(framer.version(), 2);
    }

    #[test]
    fn control_events_map_to_distinct_variants() {
        let framer = ProtocolFramer::default();
        let mut wire = BytesMut::new();
        for kind in [
            ControlFrameKind::StartServiceNack,
            ControlFrameKind::EndServiceAck,
            ControlFrameKind::EndServiceNack,
            ControlFrameKind::EndService,
            ControlFrameKind::Heartbeat,
            ControlFrameKind::HeartbeatAck,
        ] {
            wire.extend_from_slice(
                &encode_peer_control(3, kind, ServiceType::Rpc, 2, 0).unwrap(),
            );
        }

        let events = framer.handle_bytes(&wire);
        assert!(matches!(events[0], FramerEvent::Activity { session_id: 2 }));
        assert!(matches!(events[1], FramerEvent::SessionStartNacked { session_id: 2, .. }));
        assert!(matches!(events[2], FramerEvent::SessionEnded { session_id: 2, .. }));
        assert!(matches!(events[3], FramerEvent::SessionEndNacked { session_id: 2, .. }));
        assert!(matches!(events[4], FramerEvent::SessionEnded { session_id: 2, .. }));
        assert!(matches!(events[5], FramerEvent::Heartbeat { session_id: 2 }));
        assert!(matches!(events[6], FramerEvent::HeartbeatAck { session_id: 2 }));
        assert_eq!(events.len(), 7);
    }

    #[test]
    fn loopback_single_frame_roundtrip() {
        let sender = ProtocolFramer::default();
        let receiver = ProtocolFramer::default();
        granted(&sender, 3);
        granted(&receiver, 3);

        let message = ProtocolMessage::rpc(RpcType::Request, 33, 5, &b"{\"x\":true}"[..])
            .with_bulk_data(vec![9u8; 16])
            .with_session_id(6);
        let wire = sender.encode_message(&message).unwrap();

        let received = messages(receiver.handle_bytes(&wire));
        assert_eq!(received.len(), 1);
        let got = &received[0];
        assert_eq!(got.service_type, ServiceType::BulkData);
        assert_eq!(got.session_id, 6);
        assert_eq!(got.version, 3);
        assert_eq!(got.function_id, 33);
        assert_eq!(got.correlation_id, 5);
        assert_eq!(got.payload, message.payload);
        assert_eq!(got.bulk_data, message.bulk_data);
    }

    #[test]
    fn loopback_multi_frame_roundtrip() {
        let config = FramerConfig {
            max_frame_data: Some(100),
            ..FramerConfig::default()
        };
        let sender = ProtocolFramer::new(config.clone());
        let receiver = ProtocolFramer::new(config);

        let payload: Vec<u8> = (0..1050u32).map(|i| (i % 251) as u8).collect();
        let message = ProtocolMessage::stream(ServiceType::Video, payload.clone()).with_session_id(2);
        let wire = sender.encode_message(&message).unwrap();

        // 1 first frame + 11 consecutive frames, version 1 headers.
        assert_eq!(wire.len(), 12 * codec::V1_HEADER_SIZE + 8 + 1050);

        let received = messages(receiver.handle_bytes(&wire));
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].service_type, ServiceType::Video);
        assert_eq!(received[0].session_id, 2);
        assert_eq!(received[0].payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn sequence_wraps_past_255() {
        let config = FramerConfig {
            max_frame_data: Some(4),
            ..FramerConfig::default()
        };
        let sender = ProtocolFramer::new(config.clone());
        let receiver = ProtocolFramer::new(config);

        let payload = vec![0x5A; 4 * 600];
        let wire = sender
            .encode_message(&ProtocolMessage::stream(ServiceType::Audio, payload.clone()))
            .unwrap();

        let events = receiver.handle_bytes(&wire);
        assert_eq!(protocol_errors(&events), 0);
        let received = messages(events);
        assert_eq!(received[0].payload.len(), payload.len());
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let sender = ProtocolFramer::new(FramerConfig {
            max_frame_data: Some(10),
            ..FramerConfig::default()
        });
        let receiver = ProtocolFramer::default();

        let wire = sender
            .encode_message(&ProtocolMessage::stream(ServiceType::Audio, vec![7u8; 35]))
            .unwrap();

        let mut received = Vec::new();
        for byte in wire.iter() {
            received.extend(messages(receiver.handle_bytes(&[*byte])));
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload.as_ref(), &[7u8; 35][..]);
    }

    #[test]
    fn interleaved_sessions_reassemble_independently() {
        let config = FramerConfig {
            max_frame_data: Some(8),
            ..FramerConfig::default()
        };
        let sender = ProtocolFramer::new(config.clone());
        let receiver = ProtocolFramer::new(config);

        let a = sender
            .encode_message(&ProtocolMessage::stream(ServiceType::Audio, vec![1u8; 20]).with_session_id(1))
            .unwrap();
        let b = sender
            .encode_message(&ProtocolMessage::stream(ServiceType::Video, vec![2u8; 20]).with_session_id(1))
            .unwrap();

        // Split both messages into individual frames and interleave them.
        let frame_len = codec::V1_HEADER_SIZE + 8;
        let mut wire = BytesMut::new();
        let mut a_pos = 0;
        let mut b_pos = 0;
        while a_pos < a.len() || b_pos < b.len() {
            for (src, pos) in [(&a, &mut a_pos), (&b, &mut b_pos)] {
                if *pos < src.len() {
                    let len = if *pos == 0 {
                        frame_len
                    } else {
                        let size = u32::from_be_bytes([
                            src[*pos + 4],
                            src[*pos + 5],
                            src[*pos + 6],
                            src[*pos + 7],
                        ]) as usize;
                        codec::V1_HEADER_SIZE + size
                    };
                    wire.extend_from_slice(&src[*pos..*pos + len]);
                    *pos += len;
                }
            }
        }

        let received = messages(receiver.handle_bytes(&wire));
        assert_eq!(received.len(), 2);
        let audio = received
            .iter()
            .find(|m| m.service_type == ServiceType::Audio)
            .unwrap();
        let video = received
            .iter()
            .find(|m| m.service_type == ServiceType::Video)
            .unwrap();
        assert_eq!(audio.payload.as_ref(), &[1u8; 20][..]);
        assert_eq!(video.payload.as_ref(), &[2u8; 20][..]);
    }

    #[test]
    fn consecutive_without_first_is_dropped() {
        let receiver = ProtocolFramer::default();
        let mut wire = BytesMut::new();
        encode_frame(
            &FrameHeader::new(1, FrameType::Consecutive, ServiceType::Rpc, 1, 3),
            b"abc",
            &mut wire,
        )
        .unwrap();

        let events = receiver.handle_bytes(&wire);
        assert!(matches!(
            events.last(),
            Some(FramerEvent::ProtocolError {
                session_id: Some(3),
                error: FrameError::UnexpectedConsecutiveFrame { session_id: 3 }
            })
        ));
    }

    #[test]
    fn out_of_sequence_discards_partial() {
        let receiver = ProtocolFramer::default();
        let mut wire = BytesMut::new();
        let mut first = BytesMut::new();
        put_first_frame(&mut first, 6, 2);
        encode_frame(
            &FrameHeader::new(1, FrameType::First, ServiceType::Audio, 0, 1),
            &first,
            &mut wire,
        )
        .unwrap();
        encode_frame(
            &FrameHeader::new(1, FrameType::Consecutive, ServiceType::Audio, 2, 1),
            b"abc",
            &mut wire,
        )
        .unwrap();
        // The final frame now has nothing to attach to.
        encode_frame(
            &FrameHeader::new(1, FrameType::Consecutive, ServiceType::Audio, 0, 1),
            b"def",
            &mut wire,
        )
        .unwrap();

        let events = receiver.handle_bytes(&wire);
        assert_eq!(protocol_errors(&events), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            FramerEvent::ProtocolError {
                error: FrameError::OutOfSequence {
                    expected: 1,
                    actual: 2,
                    ..
                },
                ..
            }
        )));
        assert!(messages(events).is_empty());
    }

    #[test]
    fn declared_length_mismatch() {
        let receiver = ProtocolFramer::default();
        let mut wire = BytesMut::new();
        let mut first = BytesMut::new();
        put_first_frame(&mut first, 10, 1);
        encode_frame(
            &FrameHeader::new(1, FrameType::First, ServiceType::Video, 0, 1),
            &first,
            &mut wire,
        )
        .unwrap();
        encode_frame(
            &FrameHeader::new(1, FrameType::Consecutive, ServiceType::Video, 0, 1),
            b"short",
            &mut wire,
        )
        .unwrap();

        let events = receiver.handle_bytes(&wire);
        assert!(events.iter().any(|e| matches!(
            e,
            FramerEvent::ProtocolError {
                error: FrameError::LengthMismatch {
                    declared: 10,
                    actual: 5
                },
                ..
            }
        )));
    }

    #[test]
    fn bad_header_clears_buffer_and_recovers() {
        let receiver = ProtocolFramer::default();
        let events = receiver.handle_bytes(&[0xF1, 0x07, 0x00, 0x01, 0, 0, 0, 0]);
        assert_eq!(protocol_errors(&events), 1);

        let mut wire = BytesMut::new();
        encode_frame(
            &FrameHeader::new(1, FrameType::Single, ServiceType::Audio, 0, 1),
            b"ok",
            &mut wire,
        )
        .unwrap();
        let received = messages(receiver.handle_bytes(&wire));
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn oversize_first_frame_rejected() {
        let receiver = ProtocolFramer::new(FramerConfig {
            max_message_size: 64,
            ..FramerConfig::default()
        });
        let mut wire = BytesMut::new();
        let mut first = BytesMut::new();
        put_first_frame(&mut first, 1000, 10);
        encode_frame(
            &FrameHeader::new(1, FrameType::First, ServiceType::Video, 0, 1),
            &first,
            &mut wire,
        )
        .unwrap();

        let events = receiver.handle_bytes(&wire);
        assert!(events.iter().any(|e| matches!(
            e,
            FramerEvent::ProtocolError {
                error: FrameError::PayloadTooLarge { .. },
                ..
            }
        )));
    }

    #[test]
    fn peer_start_service_is_a_violation() {
        let receiver = ProtocolFramer::default();
        let wire =
            encode_peer_control(1, ControlFrameKind::StartService, ServiceType::Rpc, 0, 0).unwrap();
        let events = receiver.handle_bytes(&wire);
        assert_eq!(protocol_errors(&events), 1);
    }

    #[test]
    fn heartbeat_requires_v3() {
        let framer = ProtocolFramer::default();
        assert!(matches!(
            framer.heartbeat(1),
            Err(FrameError::HeartbeatUnsupported { version: 1 })
        ));

        granted(&framer, 3);
        let wire = framer.heartbeat(1).unwrap();
        assert_eq!(wire.len(), codec::V2_HEADER_SIZE);
        assert_eq!(wire[0], 0x30);
        assert_eq!(wire[1], 0x00);
        assert_eq!(wire[2], 0x00);
        assert_eq!(wire[3], 1);
    }

    #[test]
    fn end_session_carries_hash_id() {
        let framer = ProtocolFramer::default();
        granted(&framer, 2);
        let wire = framer.end_session(ServiceType::Rpc, 5, 0xDEAD_BEEF).unwrap();
        assert_eq!(&wire[..4], &[0x20, 0x07, 0x04, 5]);
        assert_eq!(&wire[8..12], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn start_session_uses_current_version() {
        let framer = ProtocolFramer::default();
        let wire = framer.start_session(ServiceType::Rpc, 0).unwrap();
        assert_eq!(wire.as_ref(), &[0x10, 0x07, 0x01, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn message_too_large_to_send() {
        let framer = ProtocolFramer::new(FramerConfig {
            max_message_size: 16,
            ..FramerConfig::default()
        });
        let err = framer
            .encode_message(&ProtocolMessage::stream(ServiceType::Audio, vec![0u8; 17]))
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { size: 17, max: 16 }));
    }
}
