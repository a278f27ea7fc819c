//! The node's RPC surface: which methods exist and how they stream.

use std::path::{Path, PathBuf};

use lnbridge::{MethodKind, normalize_method_name};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a method streams, as written in a manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecKind {
    /// One request, one response.
    Unary,
    /// One request, many responses.
    ServerStream,
    /// Many requests, many responses.
    BidiStream,
}

impl From<SpecKind> for MethodKind {
    fn from(kind: SpecKind) -> Self {
        match kind {
            SpecKind::Unary => MethodKind::Unary,
            SpecKind::ServerStream => MethodKind::ServerStream,
            SpecKind::BidiStream => MethodKind::BidiStream,
        }
    }
}

/// One method of a node gRPC service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Fully qualified service, e.g. `lnrpc.Lightning`.
    pub service: String,
    /// Method name, e.g. `GetInfo`.
    pub method: String,
    /// Streaming shape.
    pub kind: SpecKind,
}

impl MethodSpec {
    /// Create a spec.
    pub fn new(service: impl Into<String>, method: impl Into<String>, kind: SpecKind) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
        }
    }

    /// The gRPC request path, `/<service>/<method>`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Errors loading a method manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest could not be read.
    #[error("failed to read method manifest {}: {source}", path.display())]
    Read {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The manifest is not a JSON list of method specs.
    #[error("invalid method manifest {}: {source}", path.display())]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

use SpecKind::{BidiStream, ServerStream, Unary};

const LIGHTNING: &[(&str, SpecKind)] = &[
    ("WalletBalance", Unary),
    ("ChannelBalance", Unary),
    ("GetTransactions", Unary),
    ("EstimateFee", Unary),
    ("SendCoins", Unary),
    ("ListUnspent", Unary),
    ("SubscribeTransactions", ServerStream),
    ("SendMany", Unary),
    ("NewAddress", Unary),
    ("SignMessage", Unary),
    ("VerifyMessage", Unary),
    ("ConnectPeer", Unary),
    ("DisconnectPeer", Unary),
    ("ListPeers", Unary),
    ("SubscribePeerEvents", ServerStream),
    ("GetInfo", Unary),
    ("GetRecoveryInfo", Unary),
    ("PendingChannels", Unary),
    ("ListChannels", Unary),
    ("SubscribeChannelEvents", ServerStream),
    ("ClosedChannels", Unary),
    ("OpenChannelSync", Unary),
    ("OpenChannel", ServerStream),
    ("BatchOpenChannel", Unary),
    ("FundingStateStep", Unary),
    ("ChannelAcceptor", BidiStream),
    ("CloseChannel", ServerStream),
    ("AbandonChannel", Unary),
    ("SendPayment", BidiStream),
    ("SendPaymentSync", Unary),
    ("SendToRoute", BidiStream),
    ("SendToRouteSync", Unary),
    ("AddInvoice", Unary),
    ("ListInvoices", Unary),
    ("LookupInvoice", Unary),
    ("SubscribeInvoices", ServerStream),
    ("DecodePayReq", Unary),
    ("ListPayments", Unary),
    ("DeletePayment", Unary),
    ("DeleteAllPayments", Unary),
    ("DescribeGraph", Unary),
    ("GetNodeMetrics", Unary),
    ("GetChanInfo", Unary),
    ("GetNodeInfo", Unary),
    ("QueryRoutes", Unary),
    ("GetNetworkInfo", Unary),
    ("StopDaemon", Unary),
    ("SubscribeChannelGraph", ServerStream),
    ("DebugLevel", Unary),
    ("FeeReport", Unary),
    ("UpdateChannelPolicy", Unary),
    ("ForwardingHistory", Unary),
    ("ExportChannelBackup", Unary),
    ("ExportAllChannelBackups", Unary),
    ("VerifyChanBackup", Unary),
    ("RestoreChannelBackups", Unary),
    ("SubscribeChannelBackups", ServerStream),
    ("BakeMacaroon", Unary),
    ("ListMacaroonIDs", Unary),
    ("DeleteMacaroonID", Unary),
    ("ListPermissions", Unary),
    ("CheckMacaroonPermissions", Unary),
    ("RegisterRPCMiddleware", BidiStream),
    ("SendCustomMessage", Unary),
    ("SubscribeCustomMessages", ServerStream),
];

const WALLET_UNLOCKER: &[(&str, SpecKind)] = &[
    ("GenSeed", Unary),
    ("InitWallet", Unary),
    ("UnlockWallet", Unary),
    ("ChangePassword", Unary),
];

const STATE: &[(&str, SpecKind)] = &[("SubscribeState", ServerStream), ("GetState", Unary)];

const ROUTER: &[(&str, SpecKind)] = &[
    ("SendPaymentV2", ServerStream),
    ("TrackPaymentV2", ServerStream),
    ("TrackPayments", ServerStream),
    ("EstimateRouteFee", Unary),
    ("SendToRouteV2", Unary),
    ("ResetMissionControl", Unary),
    ("QueryMissionControl", Unary),
    ("XImportMissionControl", Unary),
    ("GetMissionControlConfig", Unary),
    ("SetMissionControlConfig", Unary),
    ("QueryProbability", Unary),
    ("BuildRoute", Unary),
    ("SubscribeHtlcEvents", ServerStream),
    ("HtlcInterceptor", BidiStream),
    ("UpdateChanStatus", Unary),
];

const INVOICES: &[(&str, SpecKind)] = &[
    ("SubscribeSingleInvoice", ServerStream),
    ("CancelInvoice", Unary),
    ("AddHoldInvoice", Unary),
    ("SettleInvoice", Unary),
    ("LookupInvoiceV2", Unary),
];

const SERVICES: &[(&str, &[(&str, SpecKind)])] = &[
    ("lnrpc.Lightning", LIGHTNING),
    ("lnrpc.WalletUnlocker", WALLET_UNLOCKER),
    ("lnrpc.State", STATE),
    ("routerrpc.Router", ROUTER),
    ("invoicesrpc.Invoices", INVOICES),
];

/// The methods the bridge exposes.
///
/// Method names must be unique across services since callers address
/// methods by name alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MethodTable {
    specs: Vec<MethodSpec>,
}

impl MethodTable {
    /// The node's standard services.
    pub fn builtin() -> Self {
        let specs = SERVICES
            .iter()
            .flat_map(|(service, methods)| {
                methods
                    .iter()
                    .map(move |(method, kind)| MethodSpec::new(*service, *method, *kind))
            })
            .collect();
        Self { specs }
    }

    /// A table holding exactly `specs`.
    pub fn from_specs(specs: Vec<MethodSpec>) -> Self {
        Self { specs }
    }

    /// Add `specs`, replacing any existing method of the same name.
    pub fn merge(&mut self, specs: impl IntoIterator<Item = MethodSpec>) -> &mut Self {
        for spec in specs {
            let name = normalize_method_name(&spec.method);
            match self
                .specs
                .iter_mut()
                .find(|existing| normalize_method_name(&existing.method) == name)
            {
                Some(existing) => *existing = spec,
                None => self.specs.push(spec),
            }
        }
        self
    }

    /// Load a JSON manifest (`[{"service": .., "method": .., "kind": ..}]`) and merge it.
    pub fn merge_manifest(&mut self, path: &Path) -> Result<&mut Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let specs: Vec<MethodSpec> =
            serde_json::from_str(&text).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::info!(path = %path.display(), count = specs.len(), "Loaded method manifest");
        Ok(self.merge(specs))
    }

    /// All specs.
    pub fn specs(&self) -> &[MethodSpec] {
        &self.specs
    }

    /// Look a method up by (normalized) name.
    pub fn get(&self, method: &str) -> Option<&MethodSpec> {
        let name = normalize_method_name(method);
        self.specs
            .iter()
            .find(|spec| normalize_method_name(&spec.method) == name)
    }
}
