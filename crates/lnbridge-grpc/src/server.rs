//! gRPC server implementation for the Bridge service.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use lnbridge::{
    DispatchError, LogLine, MethodRegistry, NodeConfig, NodeController, NodeError, NodePaths,
    NodeProcess, StreamEvent, StreamManager, UnaryBridge, decode_payload, encode_payload,
};

use crate::hub::EventHub;
use crate::proto;
use crate::wallet::{UnlockOutcome, WalletClient};

/// Everything the service needs besides the node's methods.
#[derive(Clone, Debug)]
pub struct BridgeSettings {
    /// Node data directory layout. Its network is the default for wallet checks.
    pub paths: NodePaths,
    /// Configuration that `Start` overrides are applied to.
    pub node_config: NodeConfig,
    /// Extra command-line arguments for the node.
    pub node_args: Vec<String>,
    /// Bound on concurrently running unary calls.
    pub max_concurrent: Option<usize>,
}

impl BridgeSettings {
    /// Defaults for a node living in `paths`.
    pub fn new(paths: NodePaths) -> Self {
        Self {
            paths,
            node_config: NodeConfig::default(),
            node_args: Vec::new(),
            max_concurrent: None,
        }
    }
}

/// The Bridge gRPC service implementation.
#[derive(Clone, Debug)]
pub struct BridgeService {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    calls: UnaryBridge,
    streams: StreamManager,
    stream_events: EventHub<StreamEvent>,
    logs: EventHub<LogLine>,
    node: NodeController,
    wallet: WalletClient,
    node_config: NodeConfig,
    next_stream_id: AtomicU64,
}

impl BridgeService {
    /// Create a service dispatching to `registry` and launching `node` on start.
    pub fn new(
        registry: MethodRegistry,
        node: Arc<dyn NodeProcess>,
        settings: BridgeSettings,
    ) -> Self {
        let registry = Arc::new(registry);
        let stream_events = EventHub::new();
        let logs = EventHub::new();

        let mut calls = UnaryBridge::new(Arc::clone(&registry));
        if let Some(max) = settings.max_concurrent {
            calls = calls.with_max_concurrent(max);
        }
        let streams = StreamManager::new(registry, Arc::new(stream_events.clone()));
        let node = NodeController::new(settings.paths, node, Arc::new(logs.clone()))
            .with_extra_args(settings.node_args);

        Self {
            inner: Arc::new(Inner {
                wallet: WalletClient::new(calls.clone()),
                calls,
                streams,
                stream_events,
                logs,
                node,
                node_config: settings.node_config,
                next_stream_id: AtomicU64::new(1),
            }),
        }
    }

    /// Close every stream session, stop following the node log, and end the
    /// `StreamEvents` and `Logs` feeds of connected subscribers.
    pub async fn shutdown(&self) {
        self.inner.streams.close_all();
        self.inner.node.stop_log_tail().await;
        self.inner.stream_events.close();
        self.inner.logs.close();
    }

    fn default_network(&self) -> &str {
        self.inner.node.paths().network()
    }
}

fn dispatch_status(err: DispatchError) -> Status {
    match err {
        DispatchError::MethodNotFound(_) | DispatchError::SessionNotFound(_) => {
            Status::not_found(err.to_string())
        }
        DispatchError::Invocation(e) => Status::unknown(e.message()),
        DispatchError::Decode(_) => Status::invalid_argument(err.to_string()),
    }
}

fn node_status(err: NodeError) -> Status {
    match err {
        NodeError::AlreadyStarted => Status::failed_precondition(err.to_string()),
        _ => Status::internal(err.to_string()),
    }
}

fn decode(payload: &str) -> Result<Vec<u8>, Status> {
    decode_payload(payload).map_err(dispatch_status)
}

fn to_proto_event(event: StreamEvent) -> proto::StreamEvent {
    proto::StreamEvent {
        event: event.event_type().to_string(),
        data: event.encoded_data().unwrap_or_default(),
        error: event.error_message().unwrap_or_default().to_string(),
        stream_id: event.session_id,
    }
}

type StreamEventsStream = Pin<Box<dyn Stream<Item = Result<proto::StreamEvent, Status>> + Send>>;
type LogsStream = Pin<Box<dyn Stream<Item = Result<proto::LogLine, Status>> + Send>>;

#[tonic::async_trait]
impl proto::bridge_server::Bridge for BridgeService {
    type StreamEventsStream = StreamEventsStream;
    type LogsStream = LogsStream;

    async fn start(
        &self,
        request: Request<proto::StartRequest>,
    ) -> Result<Response<proto::StartResponse>, Status> {
        let overrides: BTreeMap<String, String> = request.into_inner().overrides.into_iter().collect();
        let mut config = self.inner.node_config.clone();
        config.apply(overrides);

        let ready = self.inner.node.start(&config).await.map_err(node_status)?;
        Ok(Response::new(proto::StartResponse {
            config_file: ready.config_file.display().to_string(),
            log_file: ready.log_file.display().to_string(),
        }))
    }

    async fn call(
        &self,
        request: Request<proto::CallRequest>,
    ) -> Result<Response<proto::CallResponse>, Status> {
        let req = request.into_inner();
        let payload = decode(&req.payload)?;
        let response = self
            .inner
            .calls
            .call(&req.method, payload)
            .await
            .map_err(dispatch_status)?;
        Ok(Response::new(proto::CallResponse {
            data: encode_payload(&response),
        }))
    }

    async fn open_stream(
        &self,
        request: Request<proto::OpenStreamRequest>,
    ) -> Result<Response<proto::OpenStreamResponse>, Status> {
        let req = request.into_inner();
        let payload = decode(&req.payload)?;
        let stream_id = if req.stream_id.is_empty() {
            self.inner
                .next_stream_id
                .fetch_add(1, Ordering::Relaxed)
                .to_string()
        } else {
            req.stream_id
        };

        self.inner.streams.open(&req.method, &stream_id, payload);
        Ok(Response::new(proto::OpenStreamResponse { stream_id }))
    }

    async fn write_stream(
        &self,
        request: Request<proto::WriteStreamRequest>,
    ) -> Result<Response<proto::Ack>, Status> {
        let req = request.into_inner();
        let payload = decode(&req.payload)?;
        self.inner.streams.write(&req.stream_id, payload);
        Ok(Response::new(proto::Ack {}))
    }

    async fn close_stream(
        &self,
        request: Request<proto::CloseStreamRequest>,
    ) -> Result<Response<proto::CloseStreamResponse>, Status> {
        let closed = self.inner.streams.close(&request.into_inner().stream_id);
        Ok(Response::new(proto::CloseStreamResponse { closed }))
    }

    async fn stream_events(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<Self::StreamEventsStream>, Status> {
        let events = UnboundedReceiverStream::new(self.inner.stream_events.subscribe())
            .map(|event| Ok::<_, Status>(to_proto_event(event)));
        Ok(Response::new(Box::pin(events) as Self::StreamEventsStream))
    }

    async fn logs(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<Self::LogsStream>, Status> {
        let lines = UnboundedReceiverStream::new(self.inner.logs.subscribe())
            .map(|LogLine(line)| Ok::<_, Status>(proto::LogLine { line }));
        Ok(Response::new(Box::pin(lines) as Self::LogsStream))
    }

    async fn wallet_exists(
        &self,
        request: Request<proto::WalletExistsRequest>,
    ) -> Result<Response<proto::WalletExistsResponse>, Status> {
        let req = request.into_inner();
        let network = if req.network.is_empty() {
            self.default_network()
        } else {
            req.network.as_str()
        };
        let exists = self.inner.node.wallet_exists(network);
        Ok(Response::new(proto::WalletExistsResponse { exists }))
    }

    async fn gen_seed(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::GenSeedResponse>, Status> {
        let seed = self.inner.wallet.gen_seed().await.map_err(dispatch_status)?;
        Ok(Response::new(proto::GenSeedResponse { seed }))
    }

    async fn init_wallet(
        &self,
        request: Request<proto::InitWalletRequest>,
    ) -> Result<Response<proto::InitWalletResponse>, Status> {
        let req = request.into_inner();
        if self.inner.node.wallet_exists(self.default_network()) {
            return Err(Status::failed_precondition("wallet already initialised"));
        }

        let seed = if req.seed.trim().is_empty() {
            self.inner.wallet.gen_seed().await.map_err(dispatch_status)?
        } else {
            req.seed
        };
        self.inner
            .wallet
            .init_wallet(&req.password, &seed)
            .await
            .map_err(dispatch_status)?;
        Ok(Response::new(proto::InitWalletResponse { seed }))
    }

    async fn unlock_wallet(
        &self,
        request: Request<proto::UnlockWalletRequest>,
    ) -> Result<Response<proto::UnlockWalletResponse>, Status> {
        let outcome = self
            .inner
            .wallet
            .unlock(&request.into_inner().password)
            .await
            .map_err(dispatch_status)?;
        Ok(Response::new(proto::UnlockWalletResponse {
            transport_closed: outcome == UnlockOutcome::UnlockedTransportClosed,
        }))
    }
}

/// Server configuration and runner.
#[derive(Debug)]
pub struct BridgeServer {
    addr: std::net::SocketAddr,
    service: BridgeService,
}

impl BridgeServer {
    /// Create a new server bound to the given address.
    pub fn new(addr: std::net::SocketAddr, service: BridgeService) -> Self {
        Self { addr, service }
    }

    /// Run the server until Ctrl+C or SIGTERM.
    ///
    /// On a signal, stream sessions are closed and the event feeds end so
    /// that connected subscribers do not hold up the graceful drain.
    pub async fn run(self) -> Result<(), tonic::transport::Error> {
        tracing::info!("Starting gRPC server on {}", self.addr);

        let service = self.service.clone();
        let stop = async move {
            let signal = termination_signal().await;
            tracing::info!(signal, "Shutting down bridge");
            service.shutdown().await;
        };

        let result = tonic::transport::Server::builder()
            .add_service(proto::bridge_server::BridgeServer::new(self.service))
            .serve_with_shutdown(self.addr, stop)
            .await;
        tracing::info!("gRPC server shut down");
        result
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

/// Resolves with the name of the first termination signal received.
async fn termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                () = ctrl_c() => "Ctrl+C",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                ctrl_c().await;
                "Ctrl+C"
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
        "Ctrl+C"
    }
}
