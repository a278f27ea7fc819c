//! lnbridge gRPC server
//!
//! Exposes a background Lightning node to a host process over gRPC. The host
//! calls node methods by name with base64 encoded protobuf payloads; the
//! bridge forwards them to the node's own gRPC services through a
//! pass-through codec, so it never needs the node's message types.
//!
//! # Example Flow
//!
//! ```text
//! Host                                      Bridge                       Node
//! │                                           │                            │
//! │  Start{overrides}                         │                            │
//! │ ─────────────────────────────────────────>│  write lnd.conf, tail log  │
//! │                                           │  spawn ──────────────────> │
//! │                 StartResponse{..}         │<─── RPC port accepting ─── │
//! │<───────────────────────────────────────── │                            │
//! │                                           │                            │
//! │  OpenStream{SubscribeInvoices, "s1"}      │                            │
//! │ ─────────────────────────────────────────>│  /lnrpc.Lightning/...  ──> │
//! │                                           │                            │
//! │       StreamEvent{"s1", "data", ..}       │<────────── invoice ─────── │
//! │<───────────────────────────────────────── │                            │
//! ```

/// Bridge service messages.
pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("lnbridge.v1");
}

/// Wallet unlocker messages of the node.
pub mod lnrpc {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("lnrpc");
}

mod backend;
mod codec;
mod hub;
mod methods;
mod server;
mod wallet;

pub use backend::{BackendError, GrpcBackend, status_to_invocation};
pub use codec::RawCodec;
pub use hub::EventHub;
pub use methods::{ManifestError, MethodSpec, MethodTable, SpecKind};
pub use server::{BridgeServer, BridgeService, BridgeSettings};
pub use wallet::{UnlockOutcome, WalletClient};

// Re-export proto types for convenience
pub use proto::{bridge_client::BridgeClient, bridge_server::BridgeServer as BridgeGrpcServer};
