use std::fs::File;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{TransportConfig, TransportType};
use crate::error::{Result, TransportError};

/// One physical link to the head unit.
///
/// `open` is asynchronous: it returns once the connection attempt has been
/// started and reports the outcome through [`TransportListener`]. Bytes passed
/// to `send` are written in call order. `close` is idempotent and a closed
/// transport is never reopened.
pub trait Transport: Send + Sync {
    /// Start establishing the link.
    fn open(&self) -> Result<()>;

    /// Release the underlying resource. Closing twice is a no-op.
    fn close(&self);

    /// Write bytes to the link (may block on backend I/O).
    ///
    /// I/O failures are returned to the caller and also surface
    /// asynchronously through [`TransportListener::on_error`].
    fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Best-effort snapshot of the connection state.
    fn is_connected(&self) -> bool;

    /// Physical transport family.
    fn transport_type(&self) -> TransportType;

    /// Human-readable endpoint description for diagnostics.
    fn describe(&self) -> String;
}

/// Receives connection lifecycle events and inbound bytes from a [`Transport`].
///
/// Callbacks run on the transport's own I/O thread.
pub trait TransportListener: Send + Sync {
    fn on_connected(&self);
    fn on_bytes_received(&self, bytes: &[u8]);
    fn on_disconnected(&self, reason: &str);
    fn on_error(&self, reason: &str, cause: &TransportError);
}

/// Builds a transport for a configuration, wired to a listener.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        config: &TransportConfig,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>>;
}

/// A connected byte stream implementing Read + Write.
///
/// TCP links wrap a socket; Bluetooth RFCOMM and USB accessory links wrap
/// an already-bound device node.
pub struct LinkStream {
    inner: LinkStreamInner,
}

enum LinkStreamInner {
    Tcp(TcpStream),
    Device(File),
}

impl Read for LinkStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            LinkStreamInner::Tcp(stream) => stream.read(buf),
            LinkStreamInner::Device(file) => file.read(buf),
        }
    }
}

impl Write for LinkStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            LinkStreamInner::Tcp(stream) => stream.write(buf),
            LinkStreamInner::Device(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            LinkStreamInner::Tcp(stream) => stream.flush(),
            LinkStreamInner::Device(file) => file.flush(),
        }
    }
}

impl LinkStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: LinkStreamInner::Tcp(stream),
        }
    }

    pub(crate) fn from_device(file: File) -> Self {
        Self {
            inner: LinkStreamInner::Device(file),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            LinkStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
            LinkStreamInner::Device(file) => Ok(Self::from_device(file.try_clone()?)),
        }
    }

    /// Wait up to `timeout` for inbound data on a device node.
    ///
    /// Returns `Ok(false)` on timeout. Sockets always report ready: their
    /// readers are unblocked by [`shutdown`](Self::shutdown) instead.
    #[cfg(unix)]
    pub fn wait_readable(&self, timeout: Duration) -> std::io::Result<bool> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            LinkStreamInner::Tcp(_) => return Ok(true),
            LinkStreamInner::Device(file) => file.as_raw_fd(),
        };

        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: `pollfd` is a valid, writable array of one entry and `fd`
        // is an open descriptor owned by this stream.
        let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
        match rc {
            rc if rc < 0 => Err(std::io::Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    /// Wait up to `timeout` for inbound data on a device node.
    ///
    /// Without `poll` every stream reports ready and reads block.
    #[cfg(not(unix))]
    pub fn wait_readable(&self, _timeout: Duration) -> std::io::Result<bool> {
        Ok(true)
    }

    /// Unblock readers of this stream. Device nodes have no shutdown; their
    /// readers poll with [`wait_readable`](Self::wait_readable).
    pub fn shutdown(&self) {
        if let LinkStreamInner::Tcp(stream) = &self.inner {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl std::fmt::Debug for LinkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.inner {
            LinkStreamInner::Tcp(_) => "tcp",
            LinkStreamInner::Device(_) => "device",
        };
        f.debug_struct("LinkStream").field("type", &kind).finish()
    }
}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("type", &self.transport_type())
            .field("endpoint", &self.describe())
            .field("connected", &self.is_connected())
            .finish()
    }
}

