//! Peer processes connected over stdio.
//!
//! The parent spawns a child with piped stdin/stdout and holds the master end
//! of a `RequestPipe` over them; the child adopts its own stdio with
//! `RequestPipe::from_stdio()`. The child's stderr is inherited so its logs
//! reach the parent's terminal without touching the pipe.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Result, RpcError};
use crate::pipe::RequestPipe;
use crate::request::Role;

/// A spawned peer process.
#[derive(Debug)]
pub struct PeerProcess {
    name: String,
    child: Child,
}

impl PeerProcess {
    /// Spawn `command` and connect to it.
    ///
    /// Returns the process handle and the master end of the pipe to it. The
    /// child is killed if the handle is dropped while it still runs.
    pub fn spawn(name: impl Into<String>, mut command: Command) -> Result<(Self, RequestPipe)> {
        let name = name.into();
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| RpcError::Io {
            message: format!("Failed to spawn {}: {}", name, e),
            source: Some(e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| RpcError::Io {
            message: format!("{} has no stdin pipe", name),
            source: None,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| RpcError::Io {
            message: format!("{} has no stdout pipe", name),
            source: None,
        })?;

        info!("Spawned {} (pid {:?})", name, child.id());
        let pipe = RequestPipe::new(Role::Master, stdout, stdin);
        Ok((Self { name, child }, pipe))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit, killing it after `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> Result<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("{} exited with {}", self.name, status);
                Ok(status)
            }
            Err(_) => {
                warn!("{} did not exit within {:?}, killing", self.name, timeout);
                self.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }

    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}
