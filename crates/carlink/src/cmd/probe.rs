use serde::Serialize;

use crate::cmd::link::Link;
use crate::cmd::ProbeArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_fields, print_json, OutputFormat};

#[derive(Serialize)]
struct ProbeOutput {
    endpoint: String,
    session_id: u8,
    protocol_version: u8,
    hash_id: u32,
    heartbeat: bool,
    connected: bool,
}

pub fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let link = Link::open(&args.link)?;
    let mux = link.multiplexer();
    let session = link.session();

    let out = ProbeOutput {
        endpoint: mux.describe().unwrap_or_default(),
        session_id: session.session_id(),
        protocol_version: session.version(),
        hash_id: session.hash_id(),
        heartbeat: mux.config().heartbeat.enabled && session.version() >= 3,
        connected: mux.is_connected(),
    };
    link.close();

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_fields(&[
            ("endpoint", out.endpoint.clone()),
            ("session id", out.session_id.to_string()),
            ("protocol version", out.protocol_version.to_string()),
            ("hash id", format!("0x{:08X}", out.hash_id)),
            ("heartbeat", out.heartbeat.to_string()),
        ]),
        OutputFormat::Pretty => {
            println!("Head Unit:");
            println!("  Endpoint:         {}", out.endpoint);
            println!("  Session ID:       {}", out.session_id);
            println!("  Protocol:         v{}", out.protocol_version);
            println!("  Hash ID:          0x{:08X}", out.hash_id);
            println!("  Heartbeat:        {}", if out.heartbeat { "on" } else { "off" });
        }
        OutputFormat::Raw => println!("{}", out.session_id),
    }
    Ok(SUCCESS)
}
