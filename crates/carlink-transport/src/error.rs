use std::path::PathBuf;

/// Errors that can occur in head-unit transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to connect to a network endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to open a device node (RFCOMM tty, USB accessory).
    #[error("failed to open device {path}: {source}")]
    OpenDevice {
        path: PathBuf,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration cannot be turned into a transport.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// `send` was called before the link was established.
    #[error("transport not connected")]
    NotConnected,

    /// The transport has been closed and cannot be reused.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
