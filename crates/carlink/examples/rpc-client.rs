//! Minimal RPC client: starts the RPC session, sends one request and
//! prints the response.
//!
//! Run with:
//!   cargo run --example rpc-client -- 127.0.0.1:12345

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use carlink::protocol::{ProtocolMessage, RpcType, ServiceType};
use carlink::session::{Multiplexer, MultiplexerConfig, Session, SessionListener};
use carlink::transport::TransportConfig;

enum Event {
    Started,
    Message(ProtocolMessage),
}

struct Forward(Sender<Event>);

impl SessionListener for Forward {
    fn on_session_started(&self, _session: &Session, service_type: ServiceType) {
        if service_type == ServiceType::Rpc {
            let _ = self.0.send(Event::Started);
        }
    }

    fn on_message_received(&self, _session: &Session, message: ProtocolMessage) {
        let _ = self.0.send(Event::Message(message));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:12345".to_string());
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or("endpoint must be host:port")?;

    let (tx, rx) = mpsc::channel();
    let session = Session::rpc(Arc::new(Forward(tx)));
    let mux = Multiplexer::new(
        TransportConfig::tcp(host, port.parse()?),
        MultiplexerConfig::default(),
    );
    mux.register_session(&session)?;

    match rx.recv_timeout(Duration::from_secs(5))? {
        Event::Started => eprintln!(
            "RPC session {} started (protocol v{})",
            session.session_id(),
            session.version()
        ),
        Event::Message(_) => return Err("message before session start".into()),
    }

    let request = ProtocolMessage::rpc_json(
        RpcType::Request,
        1,
        1,
        &serde_json::json!({ "appName": "carlink example" }),
    )?;
    mux.send(&session, request)?;

    if let Event::Message(response) = rx.recv_timeout(Duration::from_secs(5))? {
        eprintln!(
            "Response to function {}: {}",
            response.function_id,
            response.json()?
        );
    }

    mux.unregister_session(&session);
    Ok(())
}
