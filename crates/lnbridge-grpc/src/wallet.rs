//! Wallet unlocker helpers on top of the unary bridge.

use prost::Message;

use lnbridge::{DispatchError, UnaryBridge};

use crate::lnrpc;

/// Error text the node returns when it tears down the unlocker connection
/// while the unlock itself succeeds.
const TRANSPORT_CLOSING: &str = "transport is closing";

/// How an unlock attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// The node answered the unlock request.
    Unlocked,
    /// The node closed the unlocker connection while unlocking.
    UnlockedTransportClosed,
}

/// Typed access to the node's wallet unlocker methods.
#[derive(Clone, Debug)]
pub struct WalletClient {
    bridge: UnaryBridge,
}

fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, DispatchError> {
    M::decode(bytes).map_err(|e| DispatchError::Decode(e.to_string()))
}

impl WalletClient {
    /// Create a client dispatching through `bridge`.
    pub fn new(bridge: UnaryBridge) -> Self {
        Self { bridge }
    }

    /// Generate a new seed mnemonic, words separated by single spaces.
    pub async fn gen_seed(&self) -> Result<String, DispatchError> {
        let request = lnrpc::GenSeedRequest::default().encode_to_vec();
        let response: lnrpc::GenSeedResponse =
            decode(&self.bridge.call("GenSeed", request).await?)?;
        Ok(response.cipher_seed_mnemonic.join(" "))
    }

    /// Create the wallet from `seed` (whitespace separated words).
    pub async fn init_wallet(&self, password: &str, seed: &str) -> Result<(), DispatchError> {
        let request = lnrpc::InitWalletRequest {
            wallet_password: password.as_bytes().to_vec(),
            cipher_seed_mnemonic: seed.split_whitespace().map(str::to_string).collect(),
            ..Default::default()
        };
        let _: lnrpc::InitWalletResponse =
            decode(&self.bridge.call("InitWallet", request.encode_to_vec()).await?)?;
        tracing::info!("Wallet initialized");
        Ok(())
    }

    /// Unlock an existing wallet.
    pub async fn unlock(&self, password: &str) -> Result<UnlockOutcome, DispatchError> {
        let request = lnrpc::UnlockWalletRequest {
            wallet_password: password.as_bytes().to_vec(),
            ..Default::default()
        };
        match self.bridge.call("UnlockWallet", request.encode_to_vec()).await {
            Ok(bytes) => {
                let _: lnrpc::UnlockWalletResponse = decode(&bytes)?;
                tracing::info!("Wallet unlocked");
                Ok(UnlockOutcome::Unlocked)
            }
            Err(DispatchError::Invocation(e)) if e.message().contains(TRANSPORT_CLOSING) => {
                tracing::warn!(error = %e, "Unlocker connection closed during unlock");
                Ok(UnlockOutcome::UnlockedTransportClosed)
            }
            Err(e) => Err(e),
        }
    }
}
