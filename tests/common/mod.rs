//! Shared integration-test harness: spawning the binary as a stdio mock
//! tool server and talking JSON-RPC to it over pipes.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

/// Default timeout for reading a single message from the server.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Grabs a free port by binding to port 0 and dropping the listener.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind to ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}

/// A running `muster-test mock-server` process with JSON-RPC helpers.
///
/// The child process is killed on drop via `kill_on_drop(true)`.
pub struct MockServerProcess {
    child: Child,
    stdin: tokio::process::ChildStdin,
    reader: BufReader<tokio::process::ChildStdout>,
    next_id: i64,
}

impl MockServerProcess {
    /// Spawns the binary in mock-server mode with the given config.
    pub fn spawn(config_path: &Path) -> Self {
        let bin = env!("CARGO_BIN_EXE_muster-test");
        let mut child = Command::new(bin)
            .args([
                "mock-server",
                "--config",
                config_path.to_str().expect("non-UTF-8 config path"),
                "--quiet",
            ])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn muster-test");

        let stdin = child.stdin.take().expect("stdin not captured");
        let stdout = child.stdout.take().expect("stdout not captured");

        Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 1,
        }
    }

    /// Sends a JSON-RPC request and returns the response.
    pub async fn send_request(&mut self, method: &str, params: Option<Value>) -> Value {
        let id = self.next_id;
        self.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut buf = serde_json::to_string(&request).expect("serialize request");
        buf.push('\n');
        self.stdin
            .write_all(buf.as_bytes())
            .await
            .expect("write to mock server stdin");
        self.stdin.flush().await.expect("flush stdin");

        self.read_message(DEFAULT_TIMEOUT).await
    }

    /// Reads one NDJSON message from the server's stdout.
    pub async fn read_message(&mut self, timeout: Duration) -> Value {
        let mut line = String::new();
        let result = tokio::time::timeout(timeout, async {
            loop {
                line.clear();
                let n = self
                    .reader
                    .read_line(&mut line)
                    .await
                    .expect("read_line I/O error");
                assert!(n > 0, "unexpected EOF from mock server");
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    return serde_json::from_str::<Value>(trimmed)
                        .unwrap_or_else(|e| panic!("invalid JSON from server: {e}\nline: {line}"));
                }
            }
        })
        .await;
        result.expect("timed out waiting for mock server message")
    }

    /// Closes stdin so the server sees EOF, then waits for exit.
    pub async fn shutdown(mut self) {
        drop(self.stdin);
        let _ = tokio::time::timeout(DEFAULT_TIMEOUT, self.child.wait()).await;
    }
}
