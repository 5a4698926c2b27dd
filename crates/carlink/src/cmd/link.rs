//! Connect-and-wait plumbing shared by the session commands.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use carlink_protocol::{ProtocolMessage, RpcType, ServiceType, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};
use carlink_session::{LinkConfig, Multiplexer, Session, SessionError, SessionListener};
use carlink_transport::{TransportConfig, TransportError};
use tracing::debug;

use crate::cmd::LinkArgs;
use crate::exit::{session_error, CliError, CliResult, FAILURE, TRANSPORT_ERROR, USAGE};

#[derive(Debug)]
pub enum LinkEvent {
    Started(ServiceType),
    StartNacked(ServiceType),
    Ended(ServiceType),
    Message(ProtocolMessage),
    Lost(String),
    HeartbeatTimedOut,
}

/// Forwards session callbacks to the command thread.
struct Forwarder {
    tx: Sender<LinkEvent>,
}

impl Forwarder {
    fn forward(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }
}

impl SessionListener for Forwarder {
    fn on_session_started(&self, _session: &Session, service_type: ServiceType) {
        self.forward(LinkEvent::Started(service_type));
    }

    fn on_session_start_nacked(&self, _session: &Session, service_type: ServiceType) {
        self.forward(LinkEvent::StartNacked(service_type));
    }

    fn on_session_ended(&self, _session: &Session, service_type: ServiceType) {
        self.forward(LinkEvent::Ended(service_type));
    }

    fn on_message_received(&self, _session: &Session, message: ProtocolMessage) {
        self.forward(LinkEvent::Message(message));
    }

    fn on_transport_disconnected(&self, _session: &Session, reason: &str) {
        self.forward(LinkEvent::Lost(reason.to_string()));
    }

    fn on_transport_error(&self, _session: &Session, reason: &str, cause: &TransportError) {
        self.forward(LinkEvent::Lost(format!("{reason}: {cause}")));
    }

    fn on_heartbeat_timed_out(&self, _session: &Session) {
        self.forward(LinkEvent::HeartbeatTimedOut);
    }
}

/// One RPC session on its own multiplexer.
pub struct Link {
    mux: Multiplexer,
    session: Arc<Session>,
    events: Receiver<LinkEvent>,
    timeout: Duration,
}

impl Link {
    /// Connect and wait for the RPC grant.
    pub fn open(args: &LinkArgs) -> CliResult<Self> {
        let timeout = parse_duration(&args.timeout)?;
        let config = resolve_config(args)?;
        debug!(transport = ?config.transport.kind, "opening link");

        let (tx, events) = mpsc::channel();
        let session = Session::rpc(Arc::new(Forwarder { tx }));
        let mux = Multiplexer::new(config.transport, config.multiplexer);
        mux.register_session(&session)
            .map_err(|err| session_error("connect failed", err))?;

        let link = Self {
            mux,
            session,
            events,
            timeout,
        };
        link.wait_started(ServiceType::Rpc)?;
        Ok(link)
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Wait for the head unit to grant (or refuse) `service_type`.
    pub fn wait_started(&self, service_type: ServiceType) -> CliResult<()> {
        self.wait_for(|event| match event {
            LinkEvent::Started(started) if started == service_type => Some(Ok(())),
            LinkEvent::StartNacked(nacked) if nacked == service_type => Some(Err(session_error(
                "start failed",
                SessionError::Rejected(nacked),
            ))),
            _ => None,
        })
    }

    /// Wait for the response to `correlation_id`. Version 1 messages carry
    /// no RPC header, so any inbound message counts.
    pub fn wait_response(&self, correlation_id: u32) -> CliResult<ProtocolMessage> {
        self.wait_for(|event| match event {
            LinkEvent::Message(message)
                if message.version < 2
                    || (message.rpc_type == RpcType::Response
                        && message.correlation_id == correlation_id) =>
            {
                Some(Ok(message))
            }
            _ => None,
        })
    }

    /// Next event within `wait`, if any.
    pub fn next_event(&self, wait: Duration) -> Option<LinkEvent> {
        self.events.recv_timeout(wait).ok()
    }

    pub fn close(self) {
        self.mux.unregister_session(&self.session);
    }

    fn wait_for<T>(&self, mut accept: impl FnMut(LinkEvent) -> Option<CliResult<T>>) -> CliResult<T> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(LinkEvent::Lost(reason)) => {
                    return Err(CliError::new(TRANSPORT_ERROR, format!("link lost: {reason}")));
                }
                Ok(LinkEvent::HeartbeatTimedOut) => {
                    return Err(CliError::new(FAILURE, "head unit stopped answering heartbeats"));
                }
                Ok(event) => {
                    if let Some(result) = accept(event) {
                        return result;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(session_error(
                        "head unit did not answer",
                        SessionError::Timeout(self.timeout),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CliError::new(FAILURE, "session listener dropped"));
                }
            }
        }
    }
}

/// Merge `--config`, the positional endpoint and the overrides.
pub fn resolve_config(args: &LinkArgs) -> CliResult<LinkConfig> {
    let mut config = match (&args.config, &args.endpoint) {
        (Some(path), endpoint) => {
            let mut config =
                LinkConfig::from_file(path).map_err(|err| session_error("config", err))?;
            if let Some(endpoint) = endpoint {
                config.transport.kind = parse_endpoint(endpoint)?.kind;
            }
            config
        }
        (None, Some(endpoint)) => LinkConfig {
            transport: parse_endpoint(endpoint)?,
            multiplexer: Default::default(),
        },
        (None, None) => {
            return Err(CliError::new(
                USAGE,
                "an endpoint (host:port) or --config is required",
            ))
        }
    };

    if let Some(version) = args.max_version {
        if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
            return Err(CliError::new(
                USAGE,
                format!(
                    "--max-version must be between {MIN_PROTOCOL_VERSION} and {MAX_PROTOCOL_VERSION}"
                ),
            ));
        }
        config.multiplexer.framer.max_version = version;
    }
    if args.no_heartbeat {
        config.multiplexer.heartbeat.enabled = false;
    }
    Ok(config)
}

pub fn parse_endpoint(input: &str) -> CliResult<TransportConfig> {
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| CliError::new(USAGE, format!("endpoint must be host:port, got {input}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(CliError::new(USAGE, format!("endpoint has no host: {input}")));
    }
    let port: u16 = port
        .parse()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| CliError::new(USAGE, format!("invalid port in endpoint: {input}")))?;
    Ok(TransportConfig::tcp(host, port))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}
