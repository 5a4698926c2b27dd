//! One link, many sessions.
//!
//! The [`Multiplexer`] owns at most one live transport + framer pair and the
//! registry of sessions sharing it. Inbound framer events are routed to
//! sessions by id; transport failures are broadcast. The link is created on
//! the first registration and torn down when the last session leaves.
//!
//! Locking: the registry and the link each sit behind their own mutex and
//! are always taken in that order. Callbacks into sessions run on a snapshot
//! of the registry with no lock held.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use carlink_protocol::{FrameError, FramerEvent, ProtocolFramer, ProtocolMessage, ServiceType};
use carlink_transport::{
    DefaultTransportFactory, Transport, TransportConfig, TransportError, TransportFactory,
    TransportListener,
};
use tracing::{debug, info, trace, warn};

use crate::config::MultiplexerConfig;
use crate::error::{Result, SessionError};
use crate::heartbeat::HeartbeatListener;
use crate::packetizer::{stream_pipe, PacketSink, PipeWriter, RpcPacketizer, StreamPacketizer};
use crate::session::Session;

struct LiveLink {
    generation: u64,
    transport: Arc<dyn Transport>,
    framer: ProtocolFramer,
}

enum Link {
    Absent,
    Live(Arc<LiveLink>),
}

impl Link {
    fn current(&self) -> Option<Arc<LiveLink>> {
        match self {
            Link::Live(live) => Some(Arc::clone(live)),
            Link::Absent => None,
        }
    }

    fn take(&mut self) -> Option<Arc<LiveLink>> {
        match std::mem::replace(self, Link::Absent) {
            Link::Live(live) => Some(live),
            Link::Absent => None,
        }
    }
}

#[derive(Default)]
struct Streams {
    audio: Option<StreamPacketizer>,
    video: Option<StreamPacketizer>,
    rpc: Option<RpcPacketizer>,
}

impl Streams {
    fn media_slot(&mut self, service_type: ServiceType) -> Option<&mut Option<StreamPacketizer>> {
        match service_type {
            ServiceType::Audio => Some(&mut self.audio),
            ServiceType::Video => Some(&mut self.video),
            _ => None,
        }
    }
}

struct Inner {
    config: MultiplexerConfig,
    transport_config: TransportConfig,
    factory: Arc<dyn TransportFactory>,
    registry: Mutex<Vec<Arc<Session>>>,
    link: Mutex<Link>,
    generation: AtomicU64,
    streams: Mutex<Streams>,
}

enum LinkLoss<'a> {
    Disconnected(&'a str),
    Failed(&'a str, &'a TransportError),
}

/// Coordinates one head-unit link shared by any number of sessions.
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("transport", &self.transport_config())
            .field("sessions", &self.session_count())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Multiplexer {
    /// Multiplexer using the built-in TCP / Bluetooth / USB transports.
    pub fn new(transport_config: TransportConfig, config: MultiplexerConfig) -> Self {
        Self::with_factory(
            transport_config,
            config,
            Arc::new(DefaultTransportFactory),
        )
    }

    /// Multiplexer building its transports through `factory`.
    ///
    /// `factory.create` is called with multiplexer locks held and must not
    /// invoke the listener synchronously; `Transport::open` may.
    pub fn with_factory(
        transport_config: TransportConfig,
        config: MultiplexerConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport_config,
                factory,
                registry: Mutex::new(Vec::new()),
                link: Mutex::new(Link::Absent),
                generation: AtomicU64::new(0),
                streams: Mutex::new(Streams::default()),
            }),
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.inner.config
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.inner.transport_config
    }

    /// Add a session. Opens the link if none is live, otherwise requests
    /// the session's primary service right away.
    pub fn register_session(&self, session: &Arc<Session>) -> Result<()> {
        self.inner.register(session)
    }

    /// Remove a session. Tears the link down when it was the last one.
    /// Unknown sessions are ignored.
    pub fn unregister_session(&self, session: &Arc<Session>) {
        self.inner.unregister(session);
    }

    /// Reopen the link after a transport failure, if sessions remain.
    pub fn reconnect(&self) -> Result<()> {
        self.inner.reconnect()
    }

    /// Unregister every session and close the link.
    pub fn close(&self) {
        for session in self.sessions() {
            self.inner.unregister(&session);
        }
        self.inner.teardown();
    }

    /// Send one message on behalf of `session`. The session id is stamped
    /// from the session; the protocol version from the link.
    pub fn send(&self, session: &Session, message: ProtocolMessage) -> Result<()> {
        let service_type = message.service_type;
        if !covers(session, service_type) {
            return Err(SessionError::ServiceNotStarted(service_type));
        }
        let link = self.inner.require_link()?;
        let message = message.with_session_id(session.session_id());
        self.inner.send_on(&link, &message)
    }

    /// Ask the head unit to start `service_type` on this session.
    pub fn start_service(&self, session: &Arc<Session>, service_type: ServiceType) -> Result<()> {
        self.inner.ensure_registered(session)?;
        let link = self.inner.require_link()?;
        if !link.transport.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.inner.request_start(&link, session, service_type)
    }

    /// Ask the head unit to end `service_type` on this session.
    pub fn end_service(&self, session: &Arc<Session>, service_type: ServiceType) -> Result<()> {
        if !session.has_service(service_type) {
            return Err(SessionError::ServiceNotStarted(service_type));
        }
        let link = self.inner.require_link()?;
        let hash_id = if service_type == session.service_type() {
            session.hash_id()
        } else {
            0
        };
        let bytes = link
            .framer
            .end_session(service_type, session.session_id(), hash_id)?;
        link.transport.send(&bytes)?;
        debug!(service = %service_type, session_id = session.session_id(), "end service requested");
        Ok(())
    }

    /// Stream `source` as audio or video on this session. Replaces any
    /// running stream of the same service.
    pub fn start_stream<R>(&self, session: &Session, service_type: ServiceType, source: R) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        if !service_type.is_stream() {
            return Err(SessionError::NotStreamable(service_type));
        }
        if !session.has_service(service_type) {
            return Err(SessionError::ServiceNotStarted(service_type));
        }
        self.inner.require_link()?;

        let packetizer = StreamPacketizer::start(
            source,
            self.inner.sink(),
            service_type,
            session.session_id(),
            self.inner.config.stream_chunk_size,
        )?;

        let previous = {
            let mut streams = lock(&self.inner.streams);
            streams
                .media_slot(service_type)
                .and_then(|slot| slot.replace(packetizer))
        };
        if let Some(previous) = previous {
            debug!(service = %service_type, "replacing running stream");
            previous.stop();
        }
        Ok(())
    }

    /// Like [`start_stream`](Self::start_stream) but returns a writer that
    /// feeds the packetizer through a bounded pipe.
    pub fn start_stream_writer(&self, session: &Session, service_type: ServiceType) -> Result<PipeWriter> {
        let (writer, reader) = stream_pipe(self.inner.config.pipe_capacity);
        self.start_stream(session, service_type, reader)?;
        Ok(writer)
    }

    /// Stop the audio or video stream. Returns false if none was running.
    pub fn stop_stream(&self, service_type: ServiceType) -> bool {
        let packetizer = {
            let mut streams = lock(&self.inner.streams);
            streams.media_slot(service_type).and_then(Option::take)
        };
        match packetizer {
            Some(packetizer) => {
                packetizer.stop();
                true
            }
            None => false,
        }
    }

    /// True while an audio or video packetizer is still reading its source.
    pub fn is_streaming(&self, service_type: ServiceType) -> bool {
        lock(&self.inner.streams)
            .media_slot(service_type)
            .is_some_and(|slot| slot.as_ref().is_some_and(StreamPacketizer::is_running))
    }

    /// Stream `source` as bulk data on copies of `request`.
    pub fn start_rpc_stream<R>(&self, session: &Session, request: ProtocolMessage, source: R) -> Result<()>
    where
        R: Read + Send + 'static,
    {
        if !session.is_granted() {
            return Err(SessionError::ServiceNotStarted(session.service_type()));
        }
        self.inner.require_link()?;

        let request = request.with_session_id(session.session_id());
        let packetizer = RpcPacketizer::start(
            source,
            self.inner.sink(),
            request,
            self.inner.config.stream_chunk_size,
        )?;

        let previous = lock(&self.inner.streams).rpc.replace(packetizer);
        if let Some(previous) = previous {
            debug!("replacing running rpc stream");
            previous.stop();
        }
        Ok(())
    }

    pub fn start_rpc_stream_writer(&self, session: &Session, request: ProtocolMessage) -> Result<PipeWriter> {
        let (writer, reader) = stream_pipe(self.inner.config.pipe_capacity);
        self.start_rpc_stream(session, request, reader)?;
        Ok(writer)
    }

    pub fn stop_rpc_stream(&self) -> bool {
        let packetizer = lock(&self.inner.streams).rpc.take();
        match packetizer {
            Some(packetizer) => {
                packetizer.stop();
                true
            }
            None => false,
        }
    }

    /// Send a heartbeat for this session immediately.
    pub fn send_heartbeat(&self, session: &Session) -> Result<()> {
        self.inner.send_heartbeat_for(session)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link)
            .current()
            .is_some_and(|link| link.transport.is_connected())
    }

    /// Negotiated protocol version of the live link.
    pub fn protocol_version(&self) -> Option<u8> {
        lock(&self.inner.link)
            .current()
            .map(|link| link.framer.version())
    }

    /// Endpoint description of the live link.
    pub fn describe(&self) -> Option<String> {
        lock(&self.inner.link)
            .current()
            .map(|link| link.transport.describe())
    }

    pub fn session_count(&self) -> usize {
        lock(&self.inner.registry).len()
    }

    /// Registered sessions, oldest first.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.snapshot()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

fn covers(session: &Session, service_type: ServiceType) -> bool {
    match service_type {
        ServiceType::BulkData => session.has_service(ServiceType::Rpc) || session.has_service(ServiceType::BulkData),
        other => session.has_service(other),
    }
}

impl Inner {
    fn snapshot(&self) -> Vec<Arc<Session>> {
        lock(&self.registry).clone()
    }

    fn current_link(&self) -> Option<Arc<LiveLink>> {
        lock(&self.link).current()
    }

    fn require_link(&self) -> Result<Arc<LiveLink>> {
        self.current_link().ok_or(SessionError::NotConnected)
    }

    fn live_link(&self, generation: u64) -> Option<Arc<LiveLink>> {
        self.current_link()
            .filter(|link| link.generation == generation)
    }

    fn ensure_registered(&self, session: &Arc<Session>) -> Result<()> {
        if lock(&self.registry).iter().any(|s| Arc::ptr_eq(s, session)) {
            Ok(())
        } else {
            Err(SessionError::NotRegistered)
        }
    }

    fn sink(self: &Arc<Self>) -> Arc<dyn PacketSink> {
        Arc::new(LinkSink {
            inner: Arc::downgrade(self),
        })
    }

    fn create_link(self: &Arc<Self>) -> Result<Arc<LiveLink>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let listener = Arc::new(LinkListener {
            inner: Arc::downgrade(self),
            generation,
        });
        let transport = self.factory.create(&self.transport_config, listener)?;
        debug!(generation, endpoint = %transport.describe(), "link created");
        Ok(Arc::new(LiveLink {
            generation,
            transport,
            framer: ProtocolFramer::new(self.config.framer.clone()),
        }))
    }

    fn register(self: &Arc<Self>, session: &Arc<Session>) -> Result<()> {
        let (link, opened) = {
            let mut registry = lock(&self.registry);
            if registry.iter().any(|s| Arc::ptr_eq(s, session)) {
                return Err(SessionError::AlreadyRegistered);
            }
            registry.push(Arc::clone(session));

            let mut link = lock(&self.link);
            match link.current() {
                Some(live) => (live, false),
                None => match self.create_link() {
                    Ok(live) => {
                        *link = Link::Live(Arc::clone(&live));
                        (live, true)
                    }
                    Err(err) => {
                        registry.pop();
                        return Err(err);
                    }
                },
            }
        };
        debug!(service = %session.service_type(), "session registered");

        if opened {
            if let Err(err) = link.transport.open() {
                warn!(error = %err, endpoint = %link.transport.describe(), "transport failed to open");
                self.abort_link(&link, session, &err);
                return Err(err.into());
            }
        } else if link.transport.is_connected() {
            if let Err(err) = self.request_start(&link, session, session.service_type()) {
                warn!(error = %err, "start service request failed");
            }
        }
        Ok(())
    }

    fn reconnect(self: &Arc<Self>) -> Result<()> {
        let link = {
            let registry = lock(&self.registry);
            if registry.is_empty() {
                return Ok(());
            }
            let mut link = lock(&self.link);
            if link.current().is_some() {
                return Ok(());
            }
            let live = self.create_link()?;
            *link = Link::Live(Arc::clone(&live));
            live
        };
        if let Err(err) = link.transport.open() {
            self.lose_link(link.generation, LinkLoss::Failed("transport failed to open", &err));
            return Err(err.into());
        }
        Ok(())
    }

    /// Roll back a registration whose transport could not be opened.
    fn abort_link(&self, link: &Arc<LiveLink>, session: &Arc<Session>, err: &TransportError) {
        let remaining = {
            let mut registry = lock(&self.registry);
            registry.retain(|s| !Arc::ptr_eq(s, session));
            let mut current = lock(&self.link);
            if current
                .current()
                .is_some_and(|live| live.generation == link.generation)
            {
                *current = Link::Absent;
            }
            registry.clone()
        };
        link.transport.close();

        for other in &remaining {
            other.reset();
            other
                .listener()
                .on_transport_error(other, "transport failed to open", err);
        }
    }

    fn unregister(&self, session: &Arc<Session>) {
        let (link, last) = {
            let mut registry = lock(&self.registry);
            let Some(pos) = registry.iter().position(|s| Arc::ptr_eq(s, session)) else {
                return;
            };
            registry.remove(pos);

            let mut link = lock(&self.link);
            if registry.is_empty() {
                (link.take(), true)
            } else {
                (link.current(), false)
            }
        };

        session.stop_heartbeat();
        let session_id = session.session_id();
        let granted = session.is_granted();

        if granted {
            if let Some(link) = link.as_ref().filter(|link| link.transport.is_connected()) {
                let sent = link
                    .framer
                    .end_session(session.service_type(), session_id, session.hash_id())
                    .map_err(SessionError::from)
                    .and_then(|bytes| link.transport.send(&bytes).map_err(SessionError::from));
                if let Err(err) = sent {
                    debug!(error = %err, session_id, "end service notification failed");
                }
            }
        }
        session.reset();
        debug!(session_id, "session unregistered");

        if last {
            // Closing first fails any packetizer send stalled on the link.
            if let Some(link) = link {
                link.transport.close();
                info!(endpoint = %link.transport.describe(), "last session unregistered, link closed");
            }
            self.stop_all_streams();
        } else if granted {
            self.stop_streams_for(session_id);
        }
    }

    /// Drop the link without touching the registry.
    fn teardown(&self) {
        if let Some(link) = lock(&self.link).take() {
            link.transport.close();
        }
        self.stop_all_streams();
    }

    fn stop_all_streams(&self) {
        let streams = std::mem::take(&mut *lock(&self.streams));
        for packetizer in [streams.audio, streams.video].into_iter().flatten() {
            packetizer.stop();
        }
        if let Some(rpc) = streams.rpc {
            rpc.stop();
        }
    }

    fn stop_streams_for(&self, session_id: u8) {
        let (media, rpc) = {
            let mut guard = lock(&self.streams);
            let streams = &mut *guard;
            let mut media = Vec::new();
            for slot in [&mut streams.audio, &mut streams.video] {
                if slot.as_ref().is_some_and(|p| p.session_id() == session_id) {
                    media.extend(slot.take());
                }
            }
            let rpc = if streams.rpc.as_ref().is_some_and(|p| p.session_id() == session_id) {
                streams.rpc.take()
            } else {
                None
            };
            (media, rpc)
        };
        for packetizer in media {
            packetizer.stop();
        }
        if let Some(rpc) = rpc {
            rpc.stop();
        }
    }

    fn stop_stream_service(&self, service_type: ServiceType, session_id: u8) {
        let packetizer = {
            let mut streams = lock(&self.streams);
            streams.media_slot(service_type).and_then(|slot| {
                if slot.as_ref().is_some_and(|p| p.session_id() == session_id) {
                    slot.take()
                } else {
                    None
                }
            })
        };
        if let Some(packetizer) = packetizer {
            packetizer.stop();
        }
    }

    fn request_start(&self, link: &LiveLink, session: &Session, service_type: ServiceType) -> Result<()> {
        if !session.mark_requested(service_type) {
            return Ok(());
        }
        let sent = link
            .framer
            .start_session(service_type, session.session_id())
            .map_err(SessionError::from)
            .and_then(|bytes| link.transport.send(&bytes).map_err(SessionError::from));
        if let Err(err) = sent {
            session.reject(service_type);
            return Err(err);
        }
        debug!(service = %service_type, session_id = session.session_id(), "start service requested");
        Ok(())
    }

    fn send_on(&self, link: &LiveLink, message: &ProtocolMessage) -> Result<()> {
        let bytes = link.framer.encode_message(message)?;
        link.transport.send(&bytes)?;
        trace!(
            service = %message.service_type,
            session_id = message.session_id,
            bytes = bytes.len(),
            "message sent"
        );
        Ok(())
    }

    fn send_heartbeat_for(&self, session: &Session) -> Result<()> {
        let link = self.require_link()?;
        let bytes = link.framer.heartbeat(session.session_id())?;
        link.transport.send(&bytes)?;
        trace!(session_id = session.session_id(), "heartbeat sent");
        Ok(())
    }

    fn handle_connected(&self, generation: u64) {
        let Some(link) = self.live_link(generation) else {
            return;
        };
        info!(endpoint = %link.transport.describe(), "link connected");
        for session in self.snapshot() {
            if session.is_granted() {
                continue;
            }
            if let Err(err) = self.request_start(&link, &session, session.service_type()) {
                warn!(error = %err, "start service request failed");
            }
        }
    }

    fn handle_bytes(self: &Arc<Self>, generation: u64, bytes: &[u8]) {
        let Some(link) = self.live_link(generation) else {
            trace!(generation, "bytes from stale link ignored");
            return;
        };
        for event in link.framer.handle_bytes(bytes) {
            self.route(&link, event);
        }
    }

    fn lose_link(&self, generation: u64, loss: LinkLoss<'_>) {
        let link = {
            let mut current = lock(&self.link);
            match current.current() {
                Some(live) if live.generation == generation => current.take(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return;
        };

        link.transport.close();
        self.stop_all_streams();

        let sessions = self.snapshot();
        for session in &sessions {
            session.reset();
        }
        match loss {
            LinkLoss::Disconnected(reason) => {
                info!(reason, endpoint = %link.transport.describe(), "link disconnected");
                for session in &sessions {
                    session.listener().on_transport_disconnected(session, reason);
                }
            }
            LinkLoss::Failed(reason, cause) => {
                warn!(reason, error = %cause, endpoint = %link.transport.describe(), "link failed");
                for session in &sessions {
                    session.listener().on_transport_error(session, reason, cause);
                }
            }
        }
    }

    fn find_granted(&self, session_id: u8) -> Option<Arc<Session>> {
        lock(&self.registry)
            .iter()
            .find(|s| s.is_granted() && s.session_id() == session_id)
            .cloned()
    }

    fn find_for_message(&self, message: &ProtocolMessage) -> Option<Arc<Session>> {
        let candidates: Vec<Arc<Session>> = lock(&self.registry)
            .iter()
            .filter(|s| s.is_granted() && s.session_id() == message.session_id)
            .cloned()
            .collect();
        candidates
            .iter()
            .find(|s| covers(s, message.service_type))
            .or_else(|| candidates.first())
            .cloned()
    }

    /// Grant target: for RPC, the control session still waiting with id 0;
    /// otherwise the oldest session with a matching pending request.
    fn find_grant_target(&self, service_type: ServiceType, session_id: u8) -> Option<Arc<Session>> {
        let sessions = self.snapshot();
        let preferred = if service_type == ServiceType::Rpc {
            sessions.iter().find(|s| {
                s.service_type() == ServiceType::Rpc && s.session_id() == 0 && s.is_pending(service_type)
            })
        } else {
            sessions
                .iter()
                .find(|s| s.is_granted() && s.session_id() == session_id && s.is_pending(service_type))
        };
        preferred
            .or_else(|| sessions.iter().find(|s| s.is_pending(service_type)))
            .cloned()
    }

    fn route(self: &Arc<Self>, link: &LiveLink, event: FramerEvent) {
        match event {
            FramerEvent::Activity { session_id } => {
                if let Some(session) = self.find_granted(session_id) {
                    session.heartbeat_activity();
                }
            }
            FramerEvent::Message(message) => match self.find_for_message(&message) {
                Some(session) => session.listener().on_message_received(&session, message),
                None => trace!(
                    session_id = message.session_id,
                    service = %message.service_type,
                    "message for unknown session dropped"
                ),
            },
            FramerEvent::SessionStarted {
                service_type,
                session_id,
                version,
                hash_id,
            } => self.session_started(link, service_type, session_id, version, hash_id),
            FramerEvent::SessionStartNacked {
                service_type,
                session_id,
            } => {
                let target = self
                    .snapshot()
                    .into_iter()
                    .find(|s| s.session_id() == session_id && s.is_pending(service_type));
                match target {
                    Some(session) => {
                        session.reject(service_type);
                        info!(service = %service_type, session_id, "service start rejected");
                        session
                            .listener()
                            .on_session_start_nacked(&session, service_type);
                    }
                    None => debug!(service = %service_type, session_id, "unmatched start nack dropped"),
                }
            }
            FramerEvent::SessionEnded {
                service_type,
                session_id,
            } => {
                let target = self
                    .snapshot()
                    .into_iter()
                    .find(|s| s.session_id() == session_id && s.has_service(service_type));
                let Some(session) = target else {
                    debug!(service = %service_type, session_id, "unmatched end dropped");
                    return;
                };
                if service_type == session.service_type() {
                    self.stop_streams_for(session_id);
                } else if service_type.is_stream() {
                    self.stop_stream_service(service_type, session_id);
                }
                session.end(service_type);
                info!(service = %service_type, session_id, "service ended");
                session.listener().on_session_ended(&session, service_type);
            }
            FramerEvent::SessionEndNacked {
                service_type,
                session_id,
            } => {
                let target = self
                    .snapshot()
                    .into_iter()
                    .find(|s| s.session_id() == session_id && s.has_service(service_type));
                match target {
                    Some(session) => session
                        .listener()
                        .on_session_end_nacked(&session, service_type),
                    None => debug!(service = %service_type, session_id, "unmatched end nack dropped"),
                }
            }
            FramerEvent::Heartbeat { session_id } => {
                let reply = link
                    .framer
                    .heartbeat_ack(session_id)
                    .map_err(SessionError::from)
                    .and_then(|bytes| link.transport.send(&bytes).map_err(SessionError::from));
                if let Err(err) = reply {
                    debug!(error = %err, session_id, "heartbeat ack not sent");
                }
            }
            FramerEvent::HeartbeatAck { session_id } => {
                if let Some(session) = self.find_granted(session_id) {
                    session.heartbeat_ack();
                }
            }
            FramerEvent::ProtocolError { session_id, error } => {
                let targets: Vec<Arc<Session>> = match session_id {
                    Some(id) => self.find_granted(id).into_iter().collect(),
                    None => self.snapshot(),
                };
                for session in &targets {
                    session.listener().on_protocol_error(session, &error);
                }
            }
        }
    }

    fn session_started(
        self: &Arc<Self>,
        link: &LiveLink,
        service_type: ServiceType,
        session_id: u8,
        version: u8,
        hash_id: u32,
    ) {
        let Some(session) = self.find_grant_target(service_type, session_id) else {
            debug!(service = %service_type, session_id, "unmatched grant dropped");
            return;
        };

        let conflict = self.snapshot().into_iter().any(|other| {
            !Arc::ptr_eq(&other, &session)
                && other.session_id() == session_id
                && other.has_service(service_type)
        });
        if conflict {
            warn!(service = %service_type, session_id, "grant duplicates a live session, dropped");
            session.reject(service_type);
            session.listener().on_protocol_error(
                &session,
                &FrameError::UnexpectedControlFrame("START_SERVICE_ACK"),
            );
            return;
        }

        session.grant(service_type, session_id, version, hash_id);
        info!(service = %service_type, session_id, version, "service started");

        let heartbeat = &self.config.heartbeat;
        if service_type == session.service_type() && heartbeat.enabled && link.framer.supports_heartbeat() {
            session.start_heartbeat(
                heartbeat.interval(),
                heartbeat.ack_timeout(),
                Arc::new(SessionHeartbeat {
                    inner: Arc::downgrade(self),
                    session: Arc::downgrade(&session),
                }),
            );
        }

        session.listener().on_session_started(&session, service_type);
    }
}

/// Transport events for one link generation.
struct LinkListener {
    inner: Weak<Inner>,
    generation: u64,
}

impl TransportListener for LinkListener {
    fn on_connected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_connected(self.generation);
        }
    }

    fn on_bytes_received(&self, bytes: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_bytes(self.generation, bytes);
        }
    }

    fn on_disconnected(&self, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lose_link(self.generation, LinkLoss::Disconnected(reason));
        }
    }

    fn on_error(&self, reason: &str, cause: &TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lose_link(self.generation, LinkLoss::Failed(reason, cause));
        }
    }
}

/// Packetizer output goes to whatever link is live when the chunk is ready.
struct LinkSink {
    inner: Weak<Inner>,
}

impl PacketSink for LinkSink {
    fn send_packet(&self, message: ProtocolMessage) -> Result<()> {
        let inner = self.inner.upgrade().ok_or(SessionError::NotConnected)?;
        let link = inner.require_link()?;
        inner.send_on(&link, &message)
    }
}

struct SessionHeartbeat {
    inner: Weak<Inner>,
    session: Weak<Session>,
}

impl HeartbeatListener for SessionHeartbeat {
    fn send_heartbeat(&self) {
        let (Some(inner), Some(session)) = (self.inner.upgrade(), self.session.upgrade()) else {
            return;
        };
        if let Err(err) = inner.send_heartbeat_for(&session) {
            debug!(error = %err, session_id = session.session_id(), "heartbeat not sent");
        }
    }

    fn heartbeat_timed_out(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        warn!(session_id = session.session_id(), "heartbeat timed out");
        session.listener().on_heartbeat_timed_out(&session);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
