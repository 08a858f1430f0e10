//! Captures a child process's stdout and stderr into snapshot-able buffers.
//!
//! Two appender tasks read line-framed text from the child's pipes into
//! growing byte buffers under a read/write lock. Snapshots copy out, so
//! callers never alias the live buffers.

use std::sync::{Arc, RwLock};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tracing::trace;

/// A point-in-time copy of the captured output.
#[derive(Debug, Clone, Default)]
pub struct LogSnapshot {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl LogSnapshot {
    /// Stdout and stderr concatenated with delimiting preludes.
    #[must_use]
    pub fn combined(&self) -> String {
        format!(
            "=== STDOUT ===\n{}\n=== STDERR ===\n{}",
            self.stdout, self.stderr
        )
    }
}

/// Tees a child's stdout/stderr into in-memory buffers.
pub struct LogCapture {
    stdout: Arc<RwLock<Vec<u8>>>,
    stderr: Arc<RwLock<Vec<u8>>>,
    appenders: Vec<JoinHandle<()>>,
}

impl LogCapture {
    /// Starts appender tasks for the given pipes.
    #[must_use]
    pub fn start(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>) -> Self {
        let stdout_buf = Arc::new(RwLock::new(Vec::new()));
        let stderr_buf = Arc::new(RwLock::new(Vec::new()));
        let mut appenders = Vec::new();

        if let Some(pipe) = stdout {
            appenders.push(spawn_appender(
                BufReader::new(pipe),
                Arc::clone(&stdout_buf),
            ));
        }
        if let Some(pipe) = stderr {
            appenders.push(spawn_appender(
                BufReader::new(pipe),
                Arc::clone(&stderr_buf),
            ));
        }

        Self {
            stdout: stdout_buf,
            stderr: stderr_buf,
            appenders,
        }
    }

    /// Returns a copy of the current buffers.
    ///
    /// # Panics
    ///
    /// Panics if a buffer lock is poisoned.
    #[must_use]
    pub fn snapshot(&self) -> LogSnapshot {
        let stdout = self.stdout.read().expect("stdout buffer lock poisoned");
        let stderr = self.stderr.read().expect("stderr buffer lock poisoned");
        LogSnapshot {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }
    }

    /// Waits for the appenders to observe EOF and exit.
    ///
    /// The pipes close when the child exits, so this is called after the
    /// process has been reaped.
    pub async fn close(mut self) -> LogSnapshot {
        for handle in self.appenders.drain(..) {
            let _ = handle.await;
        }
        self.snapshot()
    }
}

impl std::fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCapture")
            .field("appenders", &self.appenders.len())
            .finish_non_exhaustive()
    }
}

fn spawn_appender<R>(mut reader: BufReader<R>, buffer: Arc<RwLock<Vec<u8>>>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    trace!(line = %line.trim_end(), "captured");
                    let mut buf = buffer.write().expect("log buffer lock poisoned");
                    buf.extend_from_slice(line.as_bytes());
                }
                Err(e) => {
                    trace!(error = %e, "log pipe read failed");
                    break;
                }
            }
        }
    })
}
