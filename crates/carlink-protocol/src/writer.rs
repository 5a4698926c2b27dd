use std::io::{ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, max_frame_data, FrameHeader, FrameType};
use crate::control::ControlFrameKind;
use crate::error::{FrameError, Result};
use crate::message::ProtocolMessage;
use crate::service::ServiceType;

/// Blocking frame output for the head-unit side of a link.
///
/// Counterpart of [`FrameReader`](crate::FrameReader) for simulators and
/// replay tools. The client side goes through
/// [`ProtocolFramer`](crate::ProtocolFramer) instead, which also fragments
/// and numbers messages.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
        }
    }

    pub fn write_frame(&mut self, header: &FrameHeader, data: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_frame(header, data, &mut self.buf)?;
        let frame = self.buf.split().freeze();
        self.write_raw(&frame)
    }

    /// Answer or initiate session control, e.g. a StartServiceAck carrying
    /// the assigned session id and hash id.
    pub fn write_control(
        &mut self,
        version: u8,
        kind: ControlFrameKind,
        service_type: ServiceType,
        session_id: u8,
        message_id: u32,
    ) -> Result<()> {
        let header = FrameHeader::new(version, FrameType::Control, service_type, kind.as_u8(), session_id)
            .with_message_id(message_id);
        self.write_frame(&header, &[])
    }

    /// Send `message` as one single frame. RPC messages reuse the
    /// correlation id as message id.
    ///
    /// Messages that need fragmenting at `version` are refused with
    /// [`FrameError::PayloadTooLarge`].
    pub fn write_message(&mut self, version: u8, message: &ProtocolMessage) -> Result<()> {
        let data = message.encode_data(version)?;
        let max = max_frame_data(version);
        if data.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: data.len(),
                max,
            });
        }

        let mut header = FrameHeader::new(
            version,
            FrameType::Single,
            message.service_type,
            0,
            message.session_id,
        );
        if message.service_type.carries_rpc_header() {
            header = header.with_message_id(message.correlation_id);
        }
        self.write_frame(&header, &data)
    }

    /// Write bytes that are already framed.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner
            .write_all(bytes)
            .and_then(|()| self.inner.flush())
            .map_err(|err| match err.kind() {
                ErrorKind::WriteZero | ErrorKind::BrokenPipe => FrameError::ConnectionClosed,
                _ => FrameError::Io(err),
            })
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
