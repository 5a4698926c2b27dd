use std::fmt;
use std::io;

use carlink_protocol::FrameError;
use carlink_session::SessionError;
use carlink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::OpenDevice { source, .. }
            if source.kind() == io::ErrorKind::TimedOut =>
        {
            CliError::new(TIMEOUT, format!("{context}: {source}"))
        }
        TransportError::InvalidConfig(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. }
        | FrameError::Json(_)
        | FrameError::BulkDataUnsupported { .. }
        | FrameError::BulkDataNotAllowed(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Transport(err) => transport_error(context, err),
        SessionError::Frame(err) => frame_error(context, err),
        SessionError::NotConnected => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        SessionError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SessionError::Json(_) | SessionError::InvalidRequest(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SessionError::Config(_) => CliError::new(USAGE, format!("{context}: {err}")),
        SessionError::Rejected(_) | SessionError::ServiceNotStarted(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
        SessionError::Io(source) => io_error(context, source),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use carlink_protocol::ServiceType;

    use super::*;

    #[test]
    fn refused_connection_is_a_transport_error() {
        let err = TransportError::Connect {
            endpoint: "127.0.0.1:1".to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(transport_error("connect", err).code, TRANSPORT_ERROR);
    }

    #[test]
    fn session_errors_map_to_exit_codes() {
        assert_eq!(
            session_error("wait", SessionError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            session_error("start", SessionError::Rejected(ServiceType::Video)).code,
            FAILURE
        );
        assert_eq!(
            session_error("load", SessionError::Config("missing".to_string())).code,
            USAGE
        );
        assert_eq!(
            session_error(
                "send",
                SessionError::Frame(FrameError::PayloadTooLarge { size: 10, max: 1 })
            )
            .code,
            DATA_INVALID
        );
    }
}
