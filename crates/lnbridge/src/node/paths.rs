//! On-disk layout of a node's data directory.

use std::path::{Path, PathBuf};

/// Name of the node configuration file inside the app directory.
pub const CONFIG_FILE_NAME: &str = "lnd.conf";

/// Resolves the well-known files under one node data directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePaths {
    app_dir: PathBuf,
    network: String,
}

impl NodePaths {
    /// Layout for `app_dir` running on `network` (`mainnet`, `testnet`, `regtest`, ...).
    pub fn new(app_dir: impl Into<PathBuf>, network: impl Into<String>) -> Self {
        Self {
            app_dir: app_dir.into(),
            network: network.into(),
        }
    }

    /// The node's data directory.
    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// The network this layout was created for.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// `<app_dir>/lnd.conf`
    pub fn config_file(&self) -> PathBuf {
        self.app_dir.join(CONFIG_FILE_NAME)
    }

    /// `<app_dir>/logs/bitcoin/<network>/lnd.log`
    pub fn log_file(&self) -> PathBuf {
        self.app_dir
            .join("logs")
            .join("bitcoin")
            .join(&self.network)
            .join("lnd.log")
    }

    /// `<app_dir>/data/chain/bitcoin/<network>/wallet.db`
    pub fn wallet_db(&self, network: &str) -> PathBuf {
        self.app_dir
            .join("data")
            .join("chain")
            .join("bitcoin")
            .join(network)
            .join("wallet.db")
    }

    /// Returns true if a wallet database exists for `network`.
    ///
    /// A missing directory anywhere along the path simply means no wallet.
    pub fn wallet_exists(&self, network: &str) -> bool {
        let exists = self.wallet_db(network).is_file();
        tracing::debug!(network, exists, "Checked wallet existence");
        exists
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = NodePaths::new("/data/app", "testnet");
        assert_eq!(paths.config_file(), PathBuf::from("/data/app/lnd.conf"));
        assert_eq!(
            paths.log_file(),
            PathBuf::from("/data/app/logs/bitcoin/testnet/lnd.log")
        );
        assert_eq!(
            paths.wallet_db("regtest"),
            PathBuf::from("/data/app/data/chain/bitcoin/regtest/wallet.db")
        );
    }

    #[test]
    fn test_wallet_exists_tracks_wallet_db() {
        let dir = tempfile::tempdir().unwrap();
        let paths = NodePaths::new(dir.path(), "testnet");

        // No parent directories at all.
        assert!(!paths.wallet_exists("testnet"));

        let db = paths.wallet_db("testnet");
        std::fs::create_dir_all(db.parent().unwrap()).unwrap();
        assert!(!paths.wallet_exists("testnet"));

        std::fs::write(&db, b"").unwrap();
        assert!(paths.wallet_exists("testnet"));
        assert!(!paths.wallet_exists("mainnet"));
    }
}
