use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use carlink_protocol::{RpcType, ServiceType};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod link;
pub mod probe;
pub mod send;
pub mod stream;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the RPC session and print the negotiated parameters.
    Probe(ProbeArgs),
    /// Send one RPC message.
    Send(SendArgs),
    /// Stream a file as audio or video.
    Stream(StreamArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Probe(args) => probe::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Stream(args) => stream::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Where and how to reach the head unit.
#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Head unit TCP endpoint (host:port). Overrides the config file transport.
    pub endpoint: Option<String>,
    /// JSON link configuration (transport and multiplexer settings).
    #[arg(long, value_name = "FILE", env = "CARLINK_CONFIG")]
    pub config: Option<PathBuf>,
    /// Highest protocol version to negotiate (1-5).
    #[arg(long, value_name = "N")]
    pub max_version: Option<u8>,
    /// Do not run the heartbeat monitor.
    #[arg(long)]
    pub no_heartbeat: bool,
    /// Maximum time to wait for each head unit answer (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub link: LinkArgs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum RpcKind {
    Request,
    Notification,
}

impl From<RpcKind> for RpcType {
    fn from(kind: RpcKind) -> Self {
        match kind {
            RpcKind::Request => RpcType::Request,
            RpcKind::Notification => RpcType::Notification,
        }
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub link: LinkArgs,
    /// RPC function id.
    #[arg(long, short = 'f')]
    pub function_id: u32,
    /// Message kind.
    #[arg(long, value_enum, default_value = "request")]
    pub kind: RpcKind,
    /// Correlation id echoed by the response.
    #[arg(long, default_value = "1")]
    pub correlation_id: u32,
    /// JSON parameters.
    #[arg(long, conflicts_with = "data")]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with = "json")]
    pub data: Option<String>,
    /// Attach a file as bulk data.
    #[arg(long, value_name = "FILE")]
    pub bulk: Option<PathBuf>,
    /// Wait for the matching response and print it.
    #[arg(long)]
    pub wait: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum StreamService {
    Audio,
    Video,
}

impl From<StreamService> for ServiceType {
    fn from(service: StreamService) -> Self {
        match service {
            StreamService::Audio => ServiceType::Audio,
            StreamService::Video => ServiceType::Video,
        }
    }
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    #[command(flatten)]
    pub link: LinkArgs,
    /// Media service to start.
    #[arg(long, value_enum)]
    pub service: StreamService,
    /// File to stream.
    #[arg(long, value_name = "FILE")]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
