use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use carlink_protocol::{FrameError, ProtocolMessage, ServiceType};
use carlink_transport::TransportError;

use crate::heartbeat::{HeartbeatListener, HeartbeatMonitor, HeartbeatState};

/// Receives everything the multiplexer routes to one session.
///
/// Callbacks run on the transport reader thread (or the heartbeat worker for
/// [`on_heartbeat_timed_out`](Self::on_heartbeat_timed_out)) with no
/// multiplexer lock held, so they may call back into the multiplexer.
pub trait SessionListener: Send + Sync {
    fn on_session_started(&self, _session: &Session, _service_type: ServiceType) {}

    fn on_session_start_nacked(&self, _session: &Session, _service_type: ServiceType) {}

    fn on_session_ended(&self, _session: &Session, _service_type: ServiceType) {}

    fn on_session_end_nacked(&self, _session: &Session, _service_type: ServiceType) {}

    fn on_message_received(&self, _session: &Session, _message: ProtocolMessage) {}

    fn on_transport_disconnected(&self, _session: &Session, _reason: &str) {}

    fn on_transport_error(&self, _session: &Session, _reason: &str, _cause: &TransportError) {}

    fn on_heartbeat_timed_out(&self, _session: &Session) {}

    /// Diagnostic only: a frame for this session was dropped.
    fn on_protocol_error(&self, _session: &Session, _error: &FrameError) {}
}

#[derive(Debug, Default)]
struct SessionState {
    session_id: u8,
    hash_id: u32,
    version: u8,
    /// Services granted by the head unit, in grant order.
    granted: Vec<ServiceType>,
    /// Services requested and not yet answered.
    pending: Vec<ServiceType>,
}

/// One logical conversation with the head unit.
///
/// Created by the application and handed to
/// [`Multiplexer::register_session`](crate::Multiplexer::register_session).
/// Identity is the `Arc` allocation: registering the same `Arc` twice is
/// rejected, two separately created sessions are always distinct.
pub struct Session {
    service_type: ServiceType,
    listener: Arc<dyn SessionListener>,
    state: Mutex<SessionState>,
    heartbeat: HeartbeatMonitor,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Session")
            .field("service_type", &self.service_type)
            .field("session_id", &state.session_id)
            .field("version", &state.version)
            .field("granted", &state.granted)
            .field("pending", &state.pending)
            .finish()
    }
}

impl Session {
    /// A session whose primary service is `service_type` (normally RPC).
    pub fn new(service_type: ServiceType, listener: Arc<dyn SessionListener>) -> Arc<Self> {
        Arc::new(Self {
            service_type,
            listener,
            state: Mutex::new(SessionState::default()),
            heartbeat: HeartbeatMonitor::new(),
        })
    }

    /// The primary RPC session.
    pub fn rpc(listener: Arc<dyn SessionListener>) -> Arc<Self> {
        Self::new(ServiceType::Rpc, listener)
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Head-unit assigned id; 0 until the primary service is granted.
    pub fn session_id(&self) -> u8 {
        lock(&self.state).session_id
    }

    /// Hash id returned with the grant, echoed on end-service.
    pub fn hash_id(&self) -> u32 {
        lock(&self.state).hash_id
    }

    /// Negotiated protocol version; 0 until granted.
    pub fn version(&self) -> u8 {
        lock(&self.state).version
    }

    pub fn is_granted(&self) -> bool {
        lock(&self.state).granted.contains(&self.service_type)
    }

    pub fn has_service(&self, service_type: ServiceType) -> bool {
        lock(&self.state).granted.contains(&service_type)
    }

    pub fn granted_services(&self) -> Vec<ServiceType> {
        lock(&self.state).granted.clone()
    }

    pub fn is_pending(&self, service_type: ServiceType) -> bool {
        lock(&self.state).pending.contains(&service_type)
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.heartbeat.state()
    }

    pub fn listener(&self) -> &Arc<dyn SessionListener> {
        &self.listener
    }

    /// Record a start request. Returns false if one is already outstanding
    /// or the service is already granted.
    pub(crate) fn mark_requested(&self, service_type: ServiceType) -> bool {
        let mut state = lock(&self.state);
        if state.pending.contains(&service_type) || state.granted.contains(&service_type) {
            return false;
        }
        state.pending.push(service_type);
        true
    }

    /// Apply a grant. The primary service fixes id, version and hash id.
    pub(crate) fn grant(&self, service_type: ServiceType, session_id: u8, version: u8, hash_id: u32) {
        let mut state = lock(&self.state);
        state.pending.retain(|pending| *pending != service_type);
        if !state.granted.contains(&service_type) {
            state.granted.push(service_type);
        }
        if service_type == self.service_type {
            state.session_id = session_id;
            state.hash_id = hash_id;
        }
        state.version = version;
    }

    /// Clear a pending request. Returns true if one was outstanding.
    pub(crate) fn reject(&self, service_type: ServiceType) -> bool {
        let mut state = lock(&self.state);
        let before = state.pending.len();
        state.pending.retain(|pending| *pending != service_type);
        before != state.pending.len()
    }

    /// Drop a granted service. Ending the primary service ends the session.
    pub(crate) fn end(&self, service_type: ServiceType) {
        if service_type == self.service_type {
            self.reset();
            return;
        }
        lock(&self.state)
            .granted
            .retain(|granted| *granted != service_type);
    }

    /// Back to the unregistered, ungranted state.
    pub(crate) fn reset(&self) {
        self.heartbeat.stop();
        *lock(&self.state) = SessionState::default();
    }

    pub(crate) fn start_heartbeat(
        &self,
        interval: Duration,
        ack_timeout: Duration,
        listener: Arc<dyn HeartbeatListener>,
    ) {
        self.heartbeat.start(interval, ack_timeout, listener);
    }

    pub(crate) fn stop_heartbeat(&self) {
        self.heartbeat.stop();
    }

    pub(crate) fn heartbeat_activity(&self) {
        self.heartbeat.notify_activity();
    }

    pub(crate) fn heartbeat_ack(&self) {
        self.heartbeat.notify_ack();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;
    impl SessionListener for Quiet {}

    #[test]
    fn grant_and_end_lifecycle() {
        let session = Session::rpc(Arc::new(Quiet));
        assert_eq!(session.session_id(), 0);
        assert!(session.mark_requested(ServiceType::Rpc));
        assert!(!session.mark_requested(ServiceType::Rpc));
        assert!(session.is_pending(ServiceType::Rpc));

        session.grant(ServiceType::Rpc, 5, 3, 0xAA);
        assert!(session.is_granted());
        assert_eq!(session.session_id(), 5);
        assert_eq!(session.hash_id(), 0xAA);
        assert_eq!(session.version(), 3);

        assert!(session.mark_requested(ServiceType::Video));
        session.grant(ServiceType::Video, 5, 3, 0);
        assert!(session.has_service(ServiceType::Video));
        assert_eq!(session.hash_id(), 0xAA);

        session.end(ServiceType::Video);
        assert!(!session.has_service(ServiceType::Video));
        assert!(session.is_granted());

        session.end(ServiceType::Rpc);
        assert!(!session.is_granted());
        assert_eq!(session.session_id(), 0);
    }

    #[test]
    fn reject_clears_pending_only_once() {
        let session = Session::rpc(Arc::new(Quiet));
        session.mark_requested(ServiceType::Audio);
        assert!(session.reject(ServiceType::Audio));
        assert!(!session.reject(ServiceType::Audio));
    }
}
