use std::fs;

use carlink_protocol::ProtocolMessage;
use tracing::info;

use crate::cmd::link::Link;
use crate::cmd::SendArgs;
use crate::exit::{io_error, session_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let message = build_message(&args)?;
    let link = Link::open(&args.link)?;

    link.multiplexer()
        .send(link.session(), message)
        .map_err(|err| session_error("send failed", err))?;
    info!(
        function_id = args.function_id,
        correlation_id = args.correlation_id,
        "message sent"
    );

    if args.wait {
        let response = link.wait_response(args.correlation_id);
        link.close();
        print_message(&response?, format);
    } else {
        link.close();
    }
    Ok(SUCCESS)
}

fn build_message(args: &SendArgs) -> CliResult<ProtocolMessage> {
    if args.function_id > carlink_protocol::MAX_FUNCTION_ID {
        return Err(CliError::new(
            USAGE,
            format!("function id {} exceeds 28 bits", args.function_id),
        ));
    }

    let payload = match (&args.json, &args.data) {
        (Some(json), _) => {
            serde_json::from_str::<serde_json::Value>(json).map_err(|err| {
                CliError::new(DATA_INVALID, format!("--json is not valid JSON: {err}"))
            })?;
            json.as_bytes().to_vec()
        }
        (None, Some(data)) => data.as_bytes().to_vec(),
        (None, None) => Vec::new(),
    };

    let message = ProtocolMessage::rpc(
        args.kind.into(),
        args.function_id,
        args.correlation_id,
        payload,
    );
    match &args.bulk {
        Some(path) => {
            let bulk = fs::read(path)
                .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
            Ok(message.with_bulk_data(bulk))
        }
        None => Ok(message),
    }
}

#[cfg(test)]
mod tests {
    use carlink_protocol::{RpcType, ServiceType};

    use super::*;
    use crate::cmd::{LinkArgs, RpcKind};

    fn send_args() -> SendArgs {
        SendArgs {
            link: LinkArgs {
                endpoint: Some("127.0.0.1:4000".to_string()),
                config: None,
                max_version: None,
                no_heartbeat: false,
                timeout: "1s".to_string(),
            },
            function_id: 42,
            kind: RpcKind::Request,
            correlation_id: 9,
            json: None,
            data: None,
            bulk: None,
            wait: false,
        }
    }

    #[test]
    fn json_payload_is_validated() {
        let mut args = send_args();
        args.json = Some("{\"ok\":true}".to_string());
        let message = build_message(&args).unwrap();
        assert_eq!(message.rpc_type, RpcType::Request);
        assert_eq!(message.function_id, 42);
        assert_eq!(message.correlation_id, 9);
        assert_eq!(&message.payload[..], b"{\"ok\":true}");

        args.json = Some("{not json".to_string());
        assert_eq!(build_message(&args).unwrap_err().code, DATA_INVALID);
    }

    #[test]
    fn oversized_function_id_is_usage_error() {
        let mut args = send_args();
        args.function_id = 0x1000_0000;
        assert_eq!(build_message(&args).unwrap_err().code, USAGE);
    }

    #[test]
    fn bulk_file_moves_message_to_bulk_service() {
        let path = std::env::temp_dir().join(format!("carlink-bulk-{}.bin", std::process::id()));
        fs::write(&path, [1u8, 2, 3, 4]).unwrap();

        let mut args = send_args();
        args.kind = RpcKind::Notification;
        args.bulk = Some(path.clone());
        let message = build_message(&args).unwrap();
        assert_eq!(message.service_type, ServiceType::BulkData);
        assert_eq!(message.rpc_type, RpcType::Notification);
        assert_eq!(message.bulk_len(), 4);

        let _ = fs::remove_file(&path);
    }
}
