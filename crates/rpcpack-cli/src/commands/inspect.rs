//! Inspect command: decode one captured message and print it.

use std::io::Read;
use std::path::Path;

use tracing::debug;

use rpcpack_protocol::{Arguments, Message, MessagePackFormatter};

use crate::config::CliConfig;
use crate::error::CliResult;

/// Reads a message from `file` (or stdin) and prints it.
pub fn run(file: Option<&Path>, hex: bool, summary: bool, config: &CliConfig) -> CliResult<()> {
    let input = match file {
        Some(path) => std::fs::read(path)?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };
    println!("{}", render(&input, hex, summary, config)?);
    Ok(())
}

/// Decodes `input` and returns its text representation or summary.
pub fn render(input: &[u8], hex: bool, summary: bool, config: &CliConfig) -> CliResult<String> {
    let bytes = if hex { decode_hex(input)? } else { input.to_vec() };
    debug!(bytes = bytes.len(), "inspecting message");

    let formatter = MessagePackFormatter::builder()
        .options(config.codec.clone())
        .build();
    let mut message = formatter.decode(bytes)?;
    let output = if summary {
        summarize(&message)
    } else {
        formatter.text_representation(&message)?
    };
    message.deserialization_complete();
    Ok(output)
}

/// Hex text with whitespace allowed anywhere.
fn decode_hex(input: &[u8]) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = input
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    Ok(hex::decode(digits)?)
}

/// One line describing the message kind, id and method or error code.
pub fn summarize(message: &Message) -> String {
    let id = message
        .id()
        .map_or_else(|| "-".to_string(), ToString::to_string);
    match message {
        Message::Request(request) if request.is_notification() => format!(
            "notification method={} {}",
            request.method,
            describe_arguments(&request.arguments)
        ),
        Message::Request(request) => format!(
            "request id={} method={} {}",
            id,
            request.method,
            describe_arguments(&request.arguments)
        ),
        Message::Result(_) => format!("result id={}", id),
        Message::Error(error) => format!(
            "error id={} code={} ({}) message={:?}",
            id,
            error.error.code.code(),
            error.error.code.description(),
            error.error.message
        ),
    }
}

fn describe_arguments(arguments: &Arguments) -> String {
    match arguments {
        Arguments::None => "params=none".to_string(),
        Arguments::Positional(values) => format!("params=positional[{}]", values.len()),
        Arguments::Named(values) => {
            let names: Vec<&str> = values.keys().map(String::as_str).collect();
            format!("params=named[{}]", names.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcpack_protocol::{AnyValue, ErrorCode, ErrorDetail, ErrorMessage, Request};

    fn encoded(message: impl Into<Message>) -> Vec<u8> {
        MessagePackFormatter::new().encode(&message.into()).unwrap()
    }

    fn add_request() -> Vec<u8> {
        encoded(Request::new(
            1,
            "add",
            Arguments::positional([AnyValue::new(2i64), AnyValue::new(3i64)]),
        ))
    }

    #[test]
    fn renders_raw_bytes() {
        let output = render(&add_request(), false, false, &CliConfig::default()).unwrap();
        assert_eq!(output, r#"{"id":1,"jsonrpc":"2.0","method":"add","params":[2,3]}"#);
    }

    #[test]
    fn renders_hex_with_whitespace() {
        let text = hex::encode(add_request());
        let spaced: String = text
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let input = format!("{}\n", spaced);
        let output = render(input.as_bytes(), true, true, &CliConfig::default()).unwrap();
        assert_eq!(output, "request id=1 method=add params=positional[2]");
    }

    #[test]
    fn summarizes_every_kind() {
        let config = CliConfig::default();
        let note = encoded(Request::notification(
            "log",
            Arguments::named([("level", AnyValue::new(1i64)), ("text", AnyValue::new("hi".to_string()))]),
        ));
        assert_eq!(
            render(&note, false, true, &config).unwrap(),
            "notification method=log params=named[level,text]"
        );

        let error = encoded(ErrorMessage::new(
            "x",
            ErrorDetail::new(ErrorCode::MethodNotFound, "not found"),
        ));
        assert_eq!(
            render(&error, false, true, &config).unwrap(),
            r#"error id="x" code=-32601 (Method not found) message="not found""#
        );
    }

    #[test]
    fn size_limit_comes_from_config() {
        let mut config = CliConfig::default();
        config.codec.max_message_size = 8;
        let err = render(&add_request(), false, false, &config).unwrap_err();
        assert!(err.to_string().contains("message too large"));
    }

    #[test]
    fn bad_hex_is_reported() {
        let err = render(b"0g", true, false, &CliConfig::default()).unwrap_err();
        assert!(err.to_string().starts_with("invalid hex input"));
    }

    #[test]
    fn unrecognized_message_is_reported() {
        let bytes = rmp_serde::to_vec(&serde_json::json!({"jsonrpc": "2.0"})).unwrap();
        let err = render(&bytes, false, false, &CliConfig::default()).unwrap_err();
        assert!(err.to_string().contains("unrecognized message"));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msg.bin");
        std::fs::write(&path, add_request()).unwrap();
        run(Some(&path), false, true, &CliConfig::default()).unwrap();
    }
}
