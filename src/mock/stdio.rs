//! Stdio mock tool server.
//!
//! This is the loop behind `muster-test mock-server --config <yaml>`: the
//! aggregator spawns this binary as a stdio child server, NDJSON framed.
//! Empty lines are skipped; unparseable lines are logged to stderr and
//! skipped; EOF is a clean shutdown.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, warn};

use crate::client::jsonrpc::JsonRpcMessage;
use crate::error::{ConfigError, HarnessError};
use crate::mock::handle_mcp_request;
use crate::mock::tools::{MockServerConfig, ToolRegistry};

/// Loads the side-car config and runs the stdio server until EOF.
///
/// # Errors
///
/// Returns an error if the config cannot be read or stdout write fails.
pub async fn run_stdio_server(config_path: &Path) -> Result<(), HarnessError> {
    let text = std::fs::read_to_string(config_path).map_err(|e| ConfigError::Parse {
        path: config_path.to_path_buf(),
        message: e.to_string(),
    })?;
    let config: MockServerConfig =
        serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: config_path.to_path_buf(),
            message: e.to_string(),
        })?;

    let registry = ToolRegistry::new(config.name, config.tools);
    serve(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Runs the NDJSON request loop over arbitrary reader/writer pairs.
///
/// # Errors
///
/// Returns an error when writing a response fails; read errors terminate
/// the loop cleanly.
pub async fn serve<R, W>(registry: ToolRegistry, reader: R, writer: W) -> Result<(), HarnessError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut line = String::new();

    loop {
        line.clear();
        let read = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "stdin read failed, shutting down");
                break;
            }
        };
        if read == 0 {
            debug!("stdin EOF, shutting down");
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: JsonRpcMessage = match serde_json::from_str(trimmed) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "invalid JSON-RPC line, skipping");
                continue;
            }
        };

        let request = match message {
            JsonRpcMessage::Request(req) => req,
            JsonRpcMessage::Notification(notif) => {
                debug!(method = %notif.method, "notification ignored");
                continue;
            }
            JsonRpcMessage::Response(_) => {
                debug!("unexpected response message ignored");
                continue;
            }
        };

        let (delay, response) = handle_mcp_request(&registry, &request);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let serialized = serde_json::to_string(&response)?;
        writer.write_all(serialized.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tools::ToolSpec;

    fn registry() -> ToolRegistry {
        let tool: ToolSpec = serde_yaml::from_str(
            r#"
name: greet
responses:
  - condition: {lang: fr}
    response: bonjour
  - response: hello
"#,
        )
        .unwrap();
        ToolRegistry::new("greeter", vec![tool])
    }

    async fn run_lines(input: &str) -> Vec<serde_json::Value> {
        let mut output = Vec::new();
        serve(registry(), input.as_bytes(), &mut output)
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn initialize_then_call() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":0}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"greet","arguments":{"lang":"fr"}},"id":1}"#,
            "\n",
        );
        let responses = run_lines(input).await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "greeter");
        assert_eq!(responses[1]["result"]["content"][0]["text"], "bonjour");
    }

    #[tokio::test]
    async fn blank_and_invalid_lines_are_skipped() {
        let input = concat!(
            "\n",
            "not json at all\n",
            r#"{"jsonrpc":"2.0","method":"tools/list","id":2}"#,
            "\n",
        );
        let responses = run_lines(input).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["result"]["tools"][0]["name"], "greet");
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
        );
        let responses = run_lines(input).await;
        assert!(responses.is_empty());
    }
}
