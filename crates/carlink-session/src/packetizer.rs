//! Background workers that turn a byte source into outbound messages.
//!
//! Each packetizer owns one thread. The thread reads a chunk from its source
//! without holding any lock, then emits the chunk while holding the gate.
//! `stop()` closes the gate, so once it returns no further message from that
//! packetizer reaches the sink. A worker blocked in `read` exits the next
//! time its source returns.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use carlink_protocol::{ProtocolMessage, ServiceType};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

/// Destination for packetized messages (the multiplexer's live link).
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, message: ProtocolMessage) -> Result<()>;
}

struct Worker {
    gate: Arc<Mutex<bool>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<Mutex<bool>>) + Send + 'static,
    {
        let gate = Arc::new(Mutex::new(true));
        let thread_gate = Arc::clone(&gate);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body(Arc::clone(&thread_gate));
                *lock(&thread_gate) = false;
            })?;
        Ok(Self {
            gate,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn is_running(&self) -> bool {
        *lock(&self.gate)
    }

    fn stop(&self) {
        *lock(&self.gate) = false;
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Emit one message if the gate is still open. Returns false when the
/// worker should exit.
fn emit(gate: &Mutex<bool>, sink: &dyn PacketSink, message: ProtocolMessage) -> bool {
    let open = lock(gate);
    if !*open {
        return false;
    }
    match sink.send_packet(message) {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "packetizer send failed, stopping");
            false
        }
    }
}

/// Read until a non-interrupted result. `None` means end of stream.
fn read_chunk<R: Read>(source: &mut R, buf: &mut [u8]) -> Option<usize> {
    loop {
        match source.read(buf) {
            Ok(0) => return None,
            Ok(n) => return Some(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "packetizer source failed");
                return None;
            }
        }
    }
}

/// Streams raw media bytes (audio or video) for one session.
pub struct StreamPacketizer {
    service_type: ServiceType,
    session_id: u8,
    worker: Worker,
}

impl StreamPacketizer {
    /// Spawn the worker. Returns as soon as the thread is running.
    pub fn start<R>(
        source: R,
        sink: Arc<dyn PacketSink>,
        service_type: ServiceType,
        session_id: u8,
        chunk_size: usize,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let chunk_size = chunk_size.max(1);
        let name = format!("carlink-{}", service_type.name().to_ascii_lowercase());
        let worker = Worker::spawn(&name, move |gate| {
            let mut source = source;
            let mut buf = vec![0u8; chunk_size];
            let mut sent = 0usize;
            while let Some(n) = read_chunk(&mut source, &mut buf) {
                let message = ProtocolMessage::stream(service_type, Bytes::copy_from_slice(&buf[..n]))
                    .with_session_id(session_id);
                if !emit(&gate, sink.as_ref(), message) {
                    break;
                }
                sent += n;
            }
            debug!(service = %service_type, session_id, bytes = sent, "stream packetizer finished");
        })?;

        debug!(service = %service_type, session_id, "stream packetizer started");
        Ok(Self {
            service_type,
            session_id,
            worker,
        })
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    /// False once stopped or once the source is exhausted.
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&self) {
        self.worker.stop();
        debug!(service = %self.service_type, session_id = self.session_id, "stream packetizer stopped");
    }
}

/// Streams a large opaque payload as a series of RPC requests.
///
/// Every chunk is sent as bulk data on a copy of `request`; the request's
/// JSON parameters gain `offset` and `length` for that chunk.
pub struct RpcPacketizer {
    session_id: u8,
    worker: Worker,
}

impl RpcPacketizer {
    pub fn start<R>(
        source: R,
        sink: Arc<dyn PacketSink>,
        request: ProtocolMessage,
        chunk_size: usize,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let params = match request.json()? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(SessionError::InvalidRequest(format!(
                    "rpc stream parameters must be a JSON object, got {other}"
                )))
            }
        };

        let chunk_size = chunk_size.max(1);
        let session_id = request.session_id;
        let worker = Worker::spawn("carlink-rpc-stream", move |gate| {
            let mut source = source;
            let mut buf = vec![0u8; chunk_size];
            let mut offset = 0u64;
            while let Some(n) = read_chunk(&mut source, &mut buf) {
                let mut chunk_params = params.clone();
                chunk_params.insert("offset".to_string(), Value::from(offset));
                chunk_params.insert("length".to_string(), Value::from(n as u64));

                let payload = match serde_json::to_vec(&Value::Object(chunk_params)) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "rpc stream parameters failed to serialize");
                        break;
                    }
                };
                let mut message = request.clone();
                message.payload = Bytes::from(payload);
                let message = message.with_bulk_data(Bytes::copy_from_slice(&buf[..n]));

                if !emit(&gate, sink.as_ref(), message) {
                    break;
                }
                offset += n as u64;
            }
            debug!(session_id, bytes = offset, "rpc packetizer finished");
        })?;

        debug!(session_id, "rpc packetizer started");
        Ok(Self { session_id, worker })
    }

    pub fn session_id(&self) -> u8 {
        self.session_id
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn stop(&self) {
        self.worker.stop();
        debug!(session_id = self.session_id, "rpc packetizer stopped");
    }
}

/// Bounded in-memory pipe feeding a packetizer.
///
/// Writes block once `capacity` chunks are queued. Dropping the writer ends
/// the stream; writing after the reader is gone fails with `BrokenPipe`.
pub fn stream_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
        },
    )
}

/// Write half of [`stream_pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "stream stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read half of [`stream_pipe`].
#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.current.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
