//! Node launcher backed by a child process.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{NodeArgs, NodeError, NodeProcess};

/// Runs the node binary as a child process.
///
/// The node counts as ready once its RPC port accepts TCP connections, which
/// is when it starts serving the wallet unlocker. If the process exits or the
/// timeout passes first, startup fails.
#[derive(Debug)]
pub struct ChildProcessNode {
    program: PathBuf,
    prefix_args: Vec<String>,
    rpc_addr: String,
    probe_interval: Duration,
    ready_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl ChildProcessNode {
    /// Launch `program`, probing `rpc_addr` (`host:port`) for readiness.
    pub fn new(program: impl Into<PathBuf>, rpc_addr: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
            rpc_addr: rpc_addr.into(),
            probe_interval: Duration::from_millis(250),
            ready_timeout: Duration::from_secs(120),
            child: Mutex::new(None),
        }
    }

    /// Arguments passed before the node arguments.
    pub fn prefix_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// How often the RPC port is probed.
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// How long to wait for readiness before giving up.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Returns true while a started child is being held.
    pub async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the child process if one is running.
    pub async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        tracing::info!(pid = ?child.id(), "Stopping node process");
        if let Err(e) = child.start_kill() {
            tracing::warn!(error = %e, "Failed to signal node process");
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "Node process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Error waiting for node process"),
            Err(_) => tracing::warn!("Node process did not exit in time"),
        }
    }
}

async fn wait_for_rpc(addr: &str, interval: Duration) {
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(interval).await;
    }
}

#[async_trait]
impl NodeProcess for ChildProcessNode {
    async fn start(&self, args: NodeArgs) -> Result<(), NodeError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(args.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| NodeError::Launch(format!("{}: {e}", self.program.display())))?;
        tracing::info!(program = %self.program.display(), pid = ?child.id(), "Node process spawned");

        let outcome = tokio::time::timeout(self.ready_timeout, async {
            tokio::select! {
                status = child.wait() => Err(NodeError::Exited(match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                })),
                () = wait_for_rpc(&self.rpc_addr, self.probe_interval) => Ok(()),
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => {
                tracing::info!(rpc = %self.rpc_addr, "Node RPC accepting connections");
                *self.child.lock().await = Some(child);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = child.start_kill();
                Err(NodeError::ReadyTimeout(self.ready_timeout))
            }
        }
    }
}
