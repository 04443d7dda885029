//! Helper process plumbing.
//!
//! [`ProcessRunner`] starts a helper and hands back a [`HelperProcess`] whose
//! stdout can be read one line at a time while the process keeps running.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// A running helper with an incrementally readable stdout.
#[async_trait]
pub trait HelperProcess: Send {
    /// Next stdout line without its terminator, or `None` once the stream
    /// closes. Invalid UTF-8 is replaced, never an error.
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;

    /// Wait for the process to exit and return its exit code, if any.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Terminate the process.
    async fn kill(&mut self) -> std::io::Result<()>;

    /// Leave the process running. Output is drained and the exit status
    /// reaped in the background.
    fn detach(self: Box<Self>);
}

/// Starts helper processes.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, program: &str, args: &[String])
        -> std::io::Result<Box<dyn HelperProcess>>;
}

// ─── tokio::process runner ────────────────────────────────────────────────────

/// Runs helpers as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(
        &self,
        program: &str,
        args: &[String],
    ) -> std::io::Result<Box<dyn HelperProcess>> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("helper stdout not captured"))?;

        debug!(program, pid = ?child.id(), "helper spawned");
        Ok(Box::new(ChildHelper {
            child,
            stdout: BufReader::new(stdout),
        }))
    }
}

struct ChildHelper {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

#[async_trait]
impl HelperProcess for ChildHelper {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let mut buf = Vec::new();
        let n = self.stdout.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.child.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    fn detach(self: Box<Self>) {
        let ChildHelper { mut child, mut stdout } = *self;
        let pid = child.id();
        tokio::spawn(async move {
            // A full pipe would stall the helper, so keep reading until EOF.
            let mut buf = Vec::new();
            while matches!(stdout.read_until(b'\n', &mut buf).await, Ok(n) if n > 0) {
                buf.clear();
            }
            match child.wait().await {
                Ok(status) => debug!(?pid, code = ?status.code(), "detached helper exited"),
                Err(e) => warn!(?pid, error = %e, "failed to reap detached helper"),
            }
        });
    }
}
