//! Node lifecycle.
//!
//! [`NodeController`] prepares a node's data directory, starts tailing its
//! log, and launches it through a [`NodeProcess`]. Starting resolves exactly
//! once: when the node is ready for its wallet to be unlocked, or with the
//! reason it could not get there.

pub mod config;
pub mod paths;
pub mod process;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::events::{EventSink, LogLine};
use crate::logtail::{LogTail, SetupError};

pub use config::{ConfigError, ConfigWriter, DEFAULT_NODE_CONFIG, NodeConfig, parse_override};
pub use paths::NodePaths;
pub use process::ChildProcessNode;

/// Errors from starting a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// `start` was called while the node is starting or running.
    #[error("node is already started")]
    AlreadyStarted,
    /// The configuration file could not be written.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The log watcher could not be set up.
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// The node executable could not be launched.
    #[error("failed to launch node: {0}")]
    Launch(String),
    /// The node exited before it became ready.
    #[error("node exited before becoming ready: {0}")]
    Exited(String),
    /// The node did not become ready in time.
    #[error("node not ready after {0:?}")]
    ReadyTimeout(Duration),
    /// The node reported a startup failure.
    #[error("node startup failed: {0}")]
    Startup(String),
    /// The startup task ended without reporting an outcome.
    #[error("node startup ended without a result")]
    ReadinessLost,
}

/// Command-line arguments handed to the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeArgs {
    lnddir: PathBuf,
    extra: Vec<String>,
}

impl NodeArgs {
    /// Arguments pointing the node at `lnddir`.
    pub fn new(lnddir: impl Into<PathBuf>) -> Self {
        Self {
            lnddir: lnddir.into(),
            extra: Vec::new(),
        }
    }

    /// Append further arguments after `--lnddir`.
    pub fn with_extra(mut self, extra: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra.extend(extra.into_iter().map(Into::into));
        self
    }

    /// The data directory.
    pub fn lnddir(&self) -> &Path {
        &self.lnddir
    }

    /// Render as an argument vector.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(1 + self.extra.len());
        args.push(format!("--lnddir={}", self.lnddir.display()));
        args.extend(self.extra.iter().cloned());
        args
    }
}

impl fmt::Display for NodeArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_args().join(" "))
    }
}

/// Something that can launch a node.
///
/// `start` resolves once: `Ok` when the node is ready for its wallet to be
/// unlocked, `Err` if it fails before that.
#[async_trait]
pub trait NodeProcess: Send + Sync + fmt::Debug {
    /// Launch the node with `args`.
    async fn start(&self, args: NodeArgs) -> Result<(), NodeError>;
}

/// Where a started node keeps its files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Readiness {
    /// The configuration file that was written.
    pub config_file: PathBuf,
    /// The log file being tailed.
    pub log_file: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Ready,
}

/// Drives a single node from configuration to readiness.
pub struct NodeController {
    paths: NodePaths,
    node: Arc<dyn NodeProcess>,
    log_sink: Arc<dyn EventSink<LogLine>>,
    extra_args: Vec<String>,
    phase: Mutex<Phase>,
    log_tail: tokio::sync::Mutex<Option<LogTail>>,
}

impl fmt::Debug for NodeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeController")
            .field("paths", &self.paths)
            .field("node", &self.node)
            .field("phase", &*self.phase())
            .finish_non_exhaustive()
    }
}

impl NodeController {
    /// Create a controller. Log lines from the node are delivered to `log_sink`.
    pub fn new(
        paths: NodePaths,
        node: Arc<dyn NodeProcess>,
        log_sink: Arc<dyn EventSink<LogLine>>,
    ) -> Self {
        Self {
            paths,
            node,
            log_sink,
            extra_args: Vec::new(),
            phase: Mutex::new(Phase::Idle),
            log_tail: tokio::sync::Mutex::new(None),
        }
    }

    /// Pass additional arguments to the node on start.
    pub fn with_extra_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The node's file layout.
    pub fn paths(&self) -> &NodePaths {
        &self.paths
    }

    /// Returns true once a start has succeeded.
    pub fn is_started(&self) -> bool {
        *self.phase() == Phase::Ready
    }

    /// Returns true if a wallet exists for `network` in this node's data directory.
    pub fn wallet_exists(&self, network: &str) -> bool {
        self.paths.wallet_exists(network)
    }

    /// Write `config`, start tailing the node log, launch the node and wait
    /// until it is ready to unlock.
    ///
    /// A failed start leaves the controller idle so that start can be
    /// attempted again.
    pub async fn start(&self, config: &NodeConfig) -> Result<Readiness, NodeError> {
        {
            let mut phase = self.phase();
            if *phase != Phase::Idle {
                return Err(NodeError::AlreadyStarted);
            }
            *phase = Phase::Starting;
        }

        let result = self.launch(config).await;
        *self.phase() = if result.is_ok() {
            Phase::Ready
        } else {
            Phase::Idle
        };
        result
    }

    /// Returns true while the node log is being followed.
    pub async fn is_tailing_log(&self) -> bool {
        self.log_tail.lock().await.is_some()
    }

    /// Stop tailing the node log.
    pub async fn stop_log_tail(&self) {
        if let Some(mut tail) = self.log_tail.lock().await.take() {
            tail.stop();
        }
    }

    async fn launch(&self, config: &NodeConfig) -> Result<Readiness, NodeError> {
        let config_file = ConfigWriter::write(&self.paths, config).await?;

        let log_file = self.paths.log_file();
        let tail = LogTail::start(&log_file, Arc::clone(&self.log_sink)).await?;
        if let Some(mut previous) = self.log_tail.lock().await.replace(tail) {
            previous.stop();
        }

        let args = NodeArgs::new(self.paths.app_dir()).with_extra(self.extra_args.iter().cloned());
        tracing::info!(args = %args, "Starting node");

        let (tx, rx) = oneshot::channel();
        let node = Arc::clone(&self.node);
        tokio::spawn(async move {
            let _ = tx.send(node.start(args).await);
        });

        match rx.await {
            Ok(Ok(())) => {
                tracing::info!("Node ready to unlock wallet");
                Ok(Readiness {
                    config_file,
                    log_file,
                })
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Node failed to start");
                self.stop_log_tail().await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!("Node startup task ended without a result");
                self.stop_log_tail().await;
                Err(NodeError::ReadinessLost)
            }
        }
    }

    fn phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
