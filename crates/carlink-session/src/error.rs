use carlink_protocol::ServiceType;

/// Errors returned by session and multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] carlink_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] carlink_protocol::FrameError),

    /// No live link to the head unit.
    #[error("not connected to head unit")]
    NotConnected,

    /// The session is already in the registry.
    #[error("session already registered")]
    AlreadyRegistered,

    /// The session is not in the registry.
    #[error("session not registered")]
    NotRegistered,

    /// The service has not been granted to this session.
    #[error("{0} service not started for this session")]
    ServiceNotStarted(ServiceType),

    /// The service cannot be streamed through a packetizer.
    #[error("{0} service does not carry media streams")]
    NotStreamable(ServiceType),

    /// The head unit rejected a service start.
    #[error("{0} service start rejected by head unit")]
    Rejected(ServiceType),

    /// The request cannot be used as a streaming template.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error outside the transport (thread spawn, stream source).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("config error: {0}")]
    Config(String),

    /// A blocking wait timed out.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, SessionError>;
