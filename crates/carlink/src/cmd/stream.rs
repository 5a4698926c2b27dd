use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use carlink_protocol::ServiceType;
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::link::{Link, LinkEvent};
use crate::cmd::StreamArgs;
use crate::exit::{io_error, session_error, CliError, CliResult, FAILURE, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_fields, print_json, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct StreamOutput {
    service: String,
    session_id: u8,
    bytes: u64,
    elapsed_ms: u128,
    completed: bool,
}

pub fn run(args: StreamArgs, format: OutputFormat) -> CliResult<i32> {
    let service: ServiceType = args.service.into();
    let file = File::open(&args.file)
        .map_err(|err| io_error(&format!("failed opening {}", args.file.display()), err))?;
    let bytes = file
        .metadata()
        .map_err(|err| io_error(&format!("failed reading {}", args.file.display()), err))?
        .len();

    let link = Link::open(&args.link)?;
    let mux = link.multiplexer();
    let session = link.session();

    mux.start_service(session, service)
        .map_err(|err| session_error("start service failed", err))?;
    link.wait_started(service)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(error = %err, "could not install Ctrl-C handler");
    }

    let started = Instant::now();
    mux.start_stream(session, service, file)
        .map_err(|err| session_error("stream failed", err))?;
    info!(%service, bytes, "streaming");

    let mut failure = None;
    while mux.is_streaming(service) && !interrupted.load(Ordering::SeqCst) {
        match link.next_event(POLL_INTERVAL) {
            Some(LinkEvent::Lost(reason)) => {
                failure = Some(CliError::new(TRANSPORT_ERROR, format!("link lost: {reason}")));
                break;
            }
            Some(LinkEvent::HeartbeatTimedOut) => {
                failure = Some(CliError::new(FAILURE, "head unit stopped answering heartbeats"));
                break;
            }
            Some(LinkEvent::Ended(ended)) if ended == service => {
                failure = Some(CliError::new(FAILURE, format!("head unit ended the {service} service")));
                break;
            }
            _ => {}
        }
    }

    let completed = failure.is_none() && !interrupted.load(Ordering::SeqCst);
    mux.stop_stream(service);
    if session.has_service(service) {
        if let Err(err) = mux.end_service(session, service) {
            warn!(error = %err, %service, "end service failed");
        }
    }

    let out = StreamOutput {
        service: service.to_string(),
        session_id: session.session_id(),
        bytes,
        elapsed_ms: started.elapsed().as_millis(),
        completed,
    };
    link.close();

    if let Some(err) = failure {
        return Err(err);
    }

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_fields(&[
            ("service", out.service.clone()),
            ("session id", out.session_id.to_string()),
            ("bytes", out.bytes.to_string()),
            ("elapsed", format!("{}ms", out.elapsed_ms)),
            ("completed", out.completed.to_string()),
        ]),
        OutputFormat::Pretty => println!(
            "service={} session={} bytes={} elapsed={}ms completed={}",
            out.service, out.session_id, out.bytes, out.elapsed_ms, out.completed
        ),
        OutputFormat::Raw => println!("{}", out.bytes),
    }
    Ok(SUCCESS)
}
