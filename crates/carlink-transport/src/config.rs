use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Physical transport family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Bluetooth,
    Tcp,
    Usb,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Bluetooth => "bluetooth",
            TransportType::Tcp => "tcp",
            TransportType::Usb => "usb",
        };
        f.write_str(name)
    }
}

/// Kind-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportKind {
    /// RFCOMM serial device already bound to the head unit (e.g. `/dev/rfcomm0`).
    Bluetooth { device: PathBuf },
    /// Head unit reachable over TCP/IP.
    Tcp { host: String, port: u16 },
    /// USB accessory device node (e.g. `/dev/usb_accessory`).
    Usb { device: PathBuf },
}

impl TransportKind {
    pub fn transport_type(&self) -> TransportType {
        match self {
            TransportKind::Bluetooth { .. } => TransportType::Bluetooth,
            TransportKind::Tcp { .. } => TransportType::Tcp,
            TransportKind::Usb { .. } => TransportType::Usb,
        }
    }

    /// Human-readable endpoint used in logs and `describe()`.
    pub fn endpoint(&self) -> String {
        match self {
            TransportKind::Bluetooth { device } | TransportKind::Usb { device } => {
                device.display().to_string()
            }
            TransportKind::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

/// Transport selection plus connection behaviour.
///
/// Immutable once built; consumed by a [`TransportFactory`](crate::TransportFactory)
/// each time the multiplexer needs a fresh link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Retry failed connection attempts before reporting an error.
    #[serde(default)]
    pub keep_alive: bool,
    /// Number of extra connection attempts when `keep_alive` is set.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Delay between connection attempts, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Per-attempt connect timeout for network transports, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// A TCP write that makes no progress for this long fails the link.
    /// 0 waits forever.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_connect_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

impl TransportConfig {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            keep_alive: false,
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }

    /// TCP transport to `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Tcp {
            host: host.into(),
            port,
        })
    }

    /// Bluetooth transport over a bound RFCOMM device node.
    pub fn bluetooth(device: impl Into<PathBuf>) -> Self {
        Self::new(TransportKind::Bluetooth {
            device: device.into(),
        })
    }

    /// USB accessory transport over a device node.
    pub fn usb(device: impl Into<PathBuf>) -> Self {
        Self::new(TransportKind::Usb {
            device: device.into(),
        })
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn transport_type(&self) -> TransportType {
        self.kind.transport_type()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    /// Total connection attempts for one `open()`.
    pub fn connect_attempts(&self) -> u32 {
        if self.keep_alive {
            self.connect_retries.saturating_add(1)
        } else {
            1
        }
    }
}
