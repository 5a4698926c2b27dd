use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use carlink_protocol::{ProtocolMessage, RpcType};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput {
    service: String,
    session_id: u8,
    version: u8,
    rpc_type: &'static str,
    function_id: u32,
    correlation_id: u32,
    payload: serde_json::Value,
    bulk_size: usize,
}

pub fn print_message(message: &ProtocolMessage, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                service: message.service_type.to_string(),
                session_id: message.session_id,
                version: message.version,
                rpc_type: rpc_type_name(message.rpc_type),
                function_id: message.function_id,
                correlation_id: message.correlation_id,
                payload: message
                    .json()
                    .unwrap_or_else(|_| serde_json::Value::String(payload_preview(&message.payload))),
                bulk_size: message.bulk_len(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "SESSION", "TYPE", "FUNCTION", "CORRELATION", "BULK", "PAYLOAD"])
                .add_row(vec![
                    message.service_type.to_string(),
                    message.session_id.to_string(),
                    rpc_type_name(message.rpc_type).to_string(),
                    message.function_id.to_string(),
                    message.correlation_id.to_string(),
                    message.bulk_len().to_string(),
                    payload_preview(&message.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "service={} session={} type={} function={} correlation={} bulk={} payload={}",
                message.service_type,
                message.session_id,
                rpc_type_name(message.rpc_type),
                message.function_id,
                message.correlation_id,
                message.bulk_len(),
                payload_preview(&message.payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(&message.payload);
            if let Some(bulk) = &message.bulk_data {
                print_raw(bulk);
            }
        }
    }
}

/// Two-column table of `(field, value)` rows.
pub fn print_fields(rows: &[(&str, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["FIELD", "VALUE"]);
    for (field, value) in rows {
        table.add_row(vec![field.to_string(), value.clone()]);
    }
    println!("{table}");
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn rpc_type_name(rpc_type: RpcType) -> &'static str {
    match rpc_type {
        RpcType::Request => "request",
        RpcType::Response => "response",
        RpcType::Notification => "notification",
    }
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_marks_binary_payloads() {
        assert_eq!(payload_preview(b"{\"a\":1}"), "{\"a\":1}");
        assert_eq!(payload_preview(&[0xff, 0xfe, 0x00]), "<binary 3 bytes>");
    }
}
