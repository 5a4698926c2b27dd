use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{TransportConfig, TransportKind, TransportType};
use crate::error::{Result, TransportError};
use crate::traits::{LinkStream, Transport, TransportFactory, TransportListener};

const READ_CHUNK_SIZE: usize = 8 * 1024;
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stream-backed transport shared by every backend.
///
/// A single I/O thread connects (retrying when `keep_alive` is set), reports
/// `on_connected`, then reads until the link ends. Writes happen on the
/// caller's thread under a mutex, so bytes from sequential `send` calls stay
/// in order. `close` never waits on that mutex: a socket is shut down through
/// a separate handle, which fails any write stalled on it.
pub struct StreamTransport {
    shared: Arc<Shared>,
}

struct Shared {
    config: TransportConfig,
    listener: Arc<dyn TransportListener>,
    writer: Mutex<Option<LinkStream>>,
    shutdown: Mutex<Option<LinkStream>>,
    send_failure: Mutex<Option<std::io::Error>>,
    opened: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl StreamTransport {
    pub fn new(config: TransportConfig, listener: Arc<dyn TransportListener>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                listener,
                writer: Mutex::new(None),
                shutdown: Mutex::new(None),
                send_failure: Mutex::new(None),
                opened: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }
}

impl Transport for StreamTransport {
    fn open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }
        if self.shared.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("carlink-{}", self.shared.config.transport_type()))
            .spawn(move || shared.run())?;
        Ok(())
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.shared.shutdown).take() {
            handle.shutdown();
        }
        match self.shared.writer.try_lock() {
            Ok(mut writer) => drop(writer.take()),
            Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
            // The in-flight send drops the writer once it returns.
            Err(TryLockError::WouldBlock) => debug!("send in flight during close"),
        }
        debug!(endpoint = %self.describe(), "transport closed");
    }

    fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = lock(&self.shared.writer);
        let Some(stream) = guard.as_mut() else {
            if self.shared.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Shutdown);
            }
            return Err(TransportError::NotConnected);
        };

        match write_all_retrying(stream, bytes) {
            Ok(()) => {
                if self.shared.closed.load(Ordering::SeqCst) {
                    *guard = None;
                }
                Ok(())
            }
            Err(err) => {
                warn!(endpoint = %self.describe(), error = %err, "transport write failed");
                // The reader thread observes the shutdown and reports the
                // failure through the listener.
                stream.shutdown();
                *guard = None;
                drop(guard);
                self.shared.connected.store(false, Ordering::SeqCst);
                *lock(&self.shared.send_failure) =
                    Some(std::io::Error::new(err.kind(), err.to_string()));
                Err(TransportError::Io(err))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        self.shared.config.transport_type()
    }

    fn describe(&self) -> String {
        format!(
            "{} {}",
            self.shared.config.transport_type(),
            self.shared.config.kind.endpoint()
        )
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn run(self: Arc<Self>) {
        let stream = match self.connect_with_retries() {
            Ok(stream) => stream,
            Err(err) => {
                if !self.closed.load(Ordering::SeqCst) {
                    warn!(error = %err, "transport failed to open");
                    self.listener.on_error("failed to open transport", &err);
                }
                return;
            }
        };

        let mut reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                stream.shutdown();
                if !self.closed.load(Ordering::SeqCst) {
                    self.listener.on_error("failed to split link stream", &err);
                }
                return;
            }
        };

        match stream.try_clone() {
            Ok(handle) => {
                let mut shutdown = lock(&self.shutdown);
                if self.closed.load(Ordering::SeqCst) {
                    stream.shutdown();
                    return;
                }
                *shutdown = Some(handle);
            }
            Err(err) => warn!(error = %err, "no shutdown handle for link stream"),
        }

        {
            let mut writer = lock(&self.writer);
            if self.closed.load(Ordering::SeqCst) {
                stream.shutdown();
                return;
            }
            *writer = Some(stream);
            self.connected.store(true, Ordering::SeqCst);
        }

        info!(
            transport = %self.config.transport_type(),
            endpoint = %self.config.kind.endpoint(),
            "transport connected"
        );
        self.listener.on_connected();
        self.read_loop(&mut reader);
    }

    fn connect_with_retries(&self) -> Result<LinkStream> {
        let attempts = self.config.connect_attempts();
        let mut attempt = 1u32;
        loop {
            match connect_once(&self.config) {
                Ok(stream) => return Ok(stream),
                Err(err) if attempt < attempts && !self.closed.load(Ordering::SeqCst) => {
                    debug!(attempt, attempts, error = %err, "connect attempt failed; retrying");
                    thread::sleep(self.config.retry_delay());
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn read_loop(&self, reader: &mut LinkStream) {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.wait_readable(DEVICE_POLL_INTERVAL) {
                Ok(true) => {}
                Ok(false) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return self.finish(Some(err)),
            }
            // Bytes arriving after close belong to whoever reopens the node.
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match reader.read(&mut chunk) {
                Ok(0) => return self.finish(None),
                Ok(n) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    self.listener.on_bytes_received(&chunk[..n]);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return self.finish(Some(err)),
            }
        }
    }

    fn finish(&self, read_error: Option<std::io::Error>) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.shutdown).take();
        lock(&self.writer).take();
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let send_failure = lock(&self.send_failure).take();
        match send_failure.or(read_error) {
            Some(err) => {
                warn!(error = %err, "transport link failed");
                self.listener
                    .on_error("transport link failed", &TransportError::Io(err));
            }
            None => {
                info!(endpoint = %self.config.kind.endpoint(), "transport disconnected");
                self.listener.on_disconnected("link closed by peer");
            }
        }
    }
}

/// Establish one connection for `config` without retrying.
pub fn connect_once(config: &TransportConfig) -> Result<LinkStream> {
    match &config.kind {
        TransportKind::Tcp { host, port } => connect_tcp(host, *port, config),
        TransportKind::Bluetooth { device } | TransportKind::Usb { device } => open_device(device),
    }
}

fn connect_tcp(host: &str, port: u16, config: &TransportConfig) -> Result<LinkStream> {
    let endpoint = format!("{host}:{port}");
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| TransportError::Connect {
            endpoint: endpoint.clone(),
            source,
        })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                stream
                    .set_write_timeout(config.write_timeout())
                    .map_err(|source| TransportError::Connect {
                        endpoint: endpoint.clone(),
                        source,
                    })?;
                debug!(%endpoint, "tcp link established");
                return Ok(LinkStream::from_tcp(stream));
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(TransportError::Connect {
        endpoint,
        source: last_err.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::AddrNotAvailable, "host resolved to no addresses")
        }),
    })
}

fn open_device(path: &Path) -> Result<LinkStream> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| TransportError::OpenDevice {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(?path, "device link opened");
    Ok(LinkStream::from_device(file))
}

fn write_all_retrying(stream: &mut LinkStream, bytes: &[u8]) -> std::io::Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match stream.write(&bytes[offset..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "link accepted no bytes",
                ))
            }
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if is_stalled(&err) => return Err(stalled(offset, bytes.len())),
            Err(err) => return Err(err),
        }
    }

    loop {
        match stream.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if is_stalled(&err) => return Err(stalled(offset, bytes.len())),
            Err(err) => return Err(err),
        }
    }
}

/// A socket write timeout surfaces as `WouldBlock` on Unix and `TimedOut`
/// on Windows.
fn is_stalled(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn stalled(written: usize, total: usize) -> std::io::Error {
    std::io::Error::new(
        ErrorKind::TimedOut,
        format!("link write stalled after {written} of {total} bytes"),
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds [`StreamTransport`]s for every [`TransportKind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        config: &TransportConfig,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>> {
        validate_config(config)?;
        Ok(Arc::new(StreamTransport::new(config.clone(), listener)))
    }
}

fn validate_config(config: &TransportConfig) -> Result<()> {
    match &config.kind {
        TransportKind::Tcp { host, port } => {
            if host.is_empty() {
                return Err(TransportError::InvalidConfig("tcp host is empty".to_string()));
            }
            if *port == 0 {
                return Err(TransportError::InvalidConfig("tcp port is 0".to_string()));
            }
        }
        TransportKind::Bluetooth { device } | TransportKind::Usb { device } => {
            if device.as_os_str().is_empty() {
                return Err(TransportError::InvalidConfig(format!(
                    "{} device path is empty",
                    config.transport_type()
                )));
            }
        }
    }
    if config.connect_timeout_ms == 0 {
        return Err(TransportError::InvalidConfig(
            "connect timeout must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[derive(Debug)]
    enum Event {
        Connected,
        Bytes(Vec<u8>),
        Disconnected(String),
        Error(String),
    }

    struct RecordingListener {
        tx: Mutex<mpsc::Sender<Event>>,
    }

    impl RecordingListener {
        fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
            let (tx, rx) = mpsc::channel();
            (
                Arc::new(Self {
                    tx: Mutex::new(tx),
                }),
                rx,
            )
        }

        fn emit(&self, event: Event) {
            let _ = self.tx.lock().unwrap().send(event);
        }
    }

    impl TransportListener for RecordingListener {
        fn on_connected(&self) {
            self.emit(Event::Connected);
        }

        fn on_bytes_received(&self, bytes: &[u8]) {
            self.emit(Event::Bytes(bytes.to_vec()));
        }

        fn on_disconnected(&self, reason: &str) {
            self.emit(Event::Disconnected(reason.to_string()));
        }

        fn on_error(&self, reason: &str, cause: &TransportError) {
            self.emit(Event::Error(format!("{reason}: {cause}")));
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn collect_bytes(rx: &mpsc::Receiver<Event>, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            match rx.recv_timeout(WAIT).unwrap() {
                Event::Bytes(bytes) => out.extend_from_slice(&bytes),
                other => panic!("unexpected event {other:?}"),
            }
        }
        out
    }

    #[test]
    fn tcp_connect_send_and_receive() {
        let (server, port) = local_listener();
        let (listener, rx) = RecordingListener::new();
        let transport = StreamTransport::new(TransportConfig::tcp("127.0.0.1", port), listener);

        transport.open().unwrap();
        let (mut peer, _) = server.accept().unwrap();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Connected));
        assert!(transport.is_connected());

        peer.write_all(b"hello").unwrap();
        assert_eq!(collect_bytes(&rx, 5), b"hello");

        transport.send(b"ping").unwrap();
        transport.send(b"pong").unwrap();
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pingpong");

        transport.close();
        assert!(!transport.is_connected());
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let (listener, _rx) = RecordingListener::new();
        let transport = StreamTransport::new(TransportConfig::tcp("127.0.0.1", 9), listener);

        transport.close();
        transport.close();

        assert!(matches!(transport.open(), Err(TransportError::Shutdown)));
        assert!(matches!(transport.send(b"x"), Err(TransportError::Shutdown)));
    }

    #[test]
    fn send_before_open_is_not_connected() {
        let (listener, _rx) = RecordingListener::new();
        let transport = StreamTransport::new(TransportConfig::tcp("127.0.0.1", 9), listener);
        assert!(matches!(
            transport.send(b"x"),
            Err(TransportError::NotConnected)
        ));
    }

    #[test]
    fn refused_connection_reports_error() {
        let (server, port) = local_listener();
        drop(server);

        let (listener, rx) = RecordingListener::new();
        let transport = StreamTransport::new(TransportConfig::tcp("127.0.0.1", port), listener);
        transport.open().unwrap();

        match rx.recv_timeout(WAIT).unwrap() {
            Event::Error(reason) => assert!(reason.contains("failed to open transport")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!transport.is_connected());
    }

    #[test]
    fn peer_close_reports_disconnect() {
        let (server, port) = local_listener();
        let (listener, rx) = RecordingListener::new();
        let transport = StreamTransport::new(TransportConfig::tcp("127.0.0.1", port), listener);

        transport.open().unwrap();
        let (peer, _) = server.accept().unwrap();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Connected));

        drop(peer);
        match rx.recv_timeout(WAIT).unwrap() {
            Event::Disconnected(_) | Event::Error(_) => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!transport.is_connected());
    }

    #[test]
    fn device_node_transport_reads_until_eof() {
        let dir = std::env::temp_dir().join(format!("carlink-device-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let device = dir.join("usb_accessory");
        std::fs::write(&device, b"abc").unwrap();

        let (listener, rx) = RecordingListener::new();
        let transport = StreamTransport::new(TransportConfig::usb(&device), listener);
        transport.open().unwrap();

        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Connected));
        assert_eq!(collect_bytes(&rx, 3), b"abc");
        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Event::Disconnected(_)
        ));
        assert_eq!(transport.describe(), format!("usb {}", device.display()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn close_returns_while_send_is_stalled() {
        let (server, port) = local_listener();
        let (listener, rx) = RecordingListener::new();
        let mut config = TransportConfig::tcp("127.0.0.1", port);
        config.write_timeout_ms = 0;
        let transport = Arc::new(StreamTransport::new(config, listener));

        transport.open().unwrap();
        let (_silent_peer, _) = server.accept().unwrap();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Connected));

        let sender = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                let chunk = vec![0u8; 1024 * 1024];
                loop {
                    if let Err(err) = transport.send(&chunk) {
                        return err;
                    }
                }
            })
        };
        thread::sleep(Duration::from_millis(500));

        let (done_tx, done_rx) = mpsc::channel();
        let closer = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                transport.close();
                let _ = done_tx.send(());
            })
        };
        assert!(
            done_rx.recv_timeout(Duration::from_secs(2)).is_ok(),
            "close waited for the stalled send"
        );
        closer.join().unwrap();

        let err = sender.join().unwrap();
        assert!(matches!(err, TransportError::Io(_) | TransportError::Shutdown));
        assert!(!transport.is_connected());
    }

    #[test]
    fn stalled_write_fails_after_write_timeout() {
        let (server, port) = local_listener();
        let (listener, rx) = RecordingListener::new();
        let mut config = TransportConfig::tcp("127.0.0.1", port);
        config.write_timeout_ms = 200;
        let transport = StreamTransport::new(config, listener);

        transport.open().unwrap();
        let (_silent_peer, _) = server.accept().unwrap();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Connected));

        let chunk = vec![0u8; 1024 * 1024];
        let err = loop {
            if let Err(err) = transport.send(&chunk) {
                break err;
            }
        };
        match err {
            TransportError::Io(io) => assert_eq!(io.kind(), ErrorKind::TimedOut),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Error(_)));
        assert!(!transport.is_connected());
    }

    #[cfg(unix)]
    #[test]
    fn reopened_device_link_receives_every_byte() {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let dir = std::env::temp_dir().join(format!("carlink-fifo-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let node = dir.join("usb_accessory");
        let _ = std::fs::remove_file(&node);
        let c_path = CString::new(node.as_os_str().as_bytes()).unwrap();
        // SAFETY: `c_path` is a valid NUL-terminated path.
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let (first_listener, first_rx) = RecordingListener::new();
        let first = StreamTransport::new(TransportConfig::usb(&node), first_listener);
        first.open().unwrap();
        assert!(matches!(first_rx.recv_timeout(WAIT).unwrap(), Event::Connected));
        first.close();

        let (second_listener, second_rx) = RecordingListener::new();
        let second = StreamTransport::new(TransportConfig::usb(&node), second_listener);
        second.open().unwrap();
        assert!(matches!(second_rx.recv_timeout(WAIT).unwrap(), Event::Connected));

        let mut feeder = OpenOptions::new().write(true).open(&node).unwrap();
        for i in 0..5u8 {
            feeder.write_all(&[b'm', b'0' + i]).unwrap();
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(collect_bytes(&second_rx, 10), b"m0m1m2m3m4");
        assert!(first_rx.recv_timeout(Duration::from_millis(200)).is_err());

        second.close();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_device_reports_open_error() {
        let (listener, rx) = RecordingListener::new();
        let transport = StreamTransport::new(
            TransportConfig::bluetooth("/nonexistent/carlink/rfcomm0"),
            listener,
        );
        transport.open().unwrap();
        assert!(matches!(rx.recv_timeout(WAIT).unwrap(), Event::Error(_)));
    }

    #[test]
    fn factory_rejects_invalid_config() {
        let (listener, _rx) = RecordingListener::new();
        let factory = DefaultTransportFactory;

        let err = factory
            .create(&TransportConfig::tcp("127.0.0.1", 0), listener.clone())
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));

        let err = factory
            .create(&TransportConfig::usb(""), listener.clone())
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidConfig(_)));

        let transport = factory
            .create(&TransportConfig::tcp("localhost", 12345), listener)
            .unwrap();
        assert_eq!(transport.transport_type(), TransportType::Tcp);
        assert!(!transport.is_connected());
    }
}
