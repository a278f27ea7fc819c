//! Node configuration file rendering.

use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::paths::NodePaths;

/// Baseline configuration every node starts from.
pub const DEFAULT_NODE_CONFIG: &str = "\
[Application Options]
debuglevel=info
no-macaroons=1
maxbackoff=2s
nolisten=1
norest=1
sync-freelist=1
accept-keysend=1

[Routing]
routing.assumechanvalid=1

[Bitcoin]
bitcoin.active=1
bitcoin.regtest=1
bitcoin.testnet=0
bitcoin.node=bitcoind

[Bitcoind]
bitcoind.rpchost=127.0.0.1:18443
bitcoind.rpcuser=polaruser
bitcoind.rpcpass=polarpass
bitcoind.zmqpubrawblock=127.0.0.1:28334
bitcoind.zmqpubrawtx=127.0.0.1:29335

[Neutrino]
neutrino.addpeer=faucet.lightning.community
neutrino.feeurl=https://nodes.lightning.computer/fees/v1/btc-fee-estimates.json

[autopilot]
autopilot.active=0
autopilot.private=0
autopilot.minconfs=0
autopilot.conftarget=30
autopilot.allocation=1.0
autopilot.heuristic=externalscore:0.95
autopilot.heuristic=preferential:0.05
";

/// Errors from building or persisting node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An override was not of the form `key=value`.
    #[error("invalid config override {0:?}: expected key=value")]
    InvalidOverride(String),
    /// The configuration file could not be written.
    #[error("failed to write config file {}: {source}", path.display())]
    Write {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Parse a `key=value` override. Whitespace around the key is trimmed.
pub fn parse_override(raw: &str) -> Result<(String, String), ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ConfigError::InvalidOverride(raw.to_string())),
    }
}

/// An INI-style node configuration kept line by line.
///
/// Overrides replace the first existing `key=` line in place, keeping its
/// section, or are appended at the end when the key is new.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    lines: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_text(DEFAULT_NODE_CONFIG)
    }
}

impl NodeConfig {
    /// Parse configuration text.
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    /// Set `key` to `value`.
    pub fn set(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        let line = format!("{key}={value}");
        match self.position(key) {
            Some(idx) => self.lines[idx] = line,
            None => self.lines.push(line),
        }
        self
    }

    /// Apply many overrides in order.
    pub fn apply<K, V>(&mut self, overrides: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: AsRef<str>,
        V: std::fmt::Display,
    {
        for (key, value) in overrides {
            self.set(key.as_ref(), value);
        }
        self
    }

    /// The first value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key)
            .and_then(|idx| self.lines[idx].split_once('='))
            .map(|(_, value)| value)
    }

    /// Render the file contents.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            let _ = writeln!(out, "{line}");
        }
        out
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.lines.iter().position(|line| {
            line.split_once('=')
                .is_some_and(|(existing, _)| existing.trim() == key)
        })
    }
}

/// Persists node configuration where the node expects it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigWriter;

impl ConfigWriter {
    /// Write `config` to `<app_dir>/lnd.conf`, creating the app directory if needed.
    pub async fn write(paths: &NodePaths, config: &NodeConfig) -> Result<PathBuf, ConfigError> {
        let path = paths.config_file();
        let write_err = |source| ConfigError::Write {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(paths.app_dir())
            .await
            .map_err(write_err)?;
        tokio::fs::write(&path, config.render())
            .await
            .map_err(write_err)?;

        tracing::debug!(path = %path.display(), "Wrote node config");
        Ok(path)
    }
}
