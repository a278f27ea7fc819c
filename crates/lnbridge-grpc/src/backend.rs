//! Binds method specs to a live gRPC connection to the node.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tokio::sync::OnceCell;
use tonic::{Request, Status};

use lnbridge::{
    BidiStreamMethod, Callable, Handler, InvocationError, MethodKind, RequestStream,
    ResponseStream, ServerStreamMethod, UnaryMethod,
};

use crate::codec::RawCodec;
use crate::methods::MethodSpec;

/// Errors setting up the node connection.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The node address is not a valid URI.
    #[error("invalid node address {0:?}")]
    InvalidAddress(String),
    /// The TLS certificate could not be read.
    #[error("failed to read TLS certificate {}: {source}", path.display())]
    ReadCert {
        /// Certificate path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The transport could not be configured.
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    /// A method path is not a valid gRPC path.
    #[error("invalid method path {0:?}")]
    InvalidPath(String),
}

/// Convert a gRPC status into the failure reported to callers.
pub fn status_to_invocation(status: Status) -> InvocationError {
    if status.message().is_empty() {
        InvocationError::new(status.code().description())
    } else {
        InvocationError::new(status.message())
    }
}

fn unavailable(e: tonic::transport::Error) -> InvocationError {
    InvocationError::new(format!("node unavailable: {e}"))
}

/// A lazily connected channel to the node.
///
/// Nothing touches the network or the TLS certificate until the first call,
/// so the bridge can be up before the node has started or written its
/// certificate. A failed setup is retried on the next call.
#[derive(Clone, Debug)]
pub struct GrpcBackend {
    source: Arc<ChannelSource>,
}

#[derive(Debug)]
struct ChannelSource {
    endpoint: Endpoint,
    tls_cert: Option<PathBuf>,
    channel: OnceCell<Channel>,
}

impl ChannelSource {
    async fn channel(&self) -> Result<Channel, BackendError> {
        self.channel
            .get_or_try_init(|| async {
                let mut endpoint = self.endpoint.clone();
                if let Some(path) = &self.tls_cert {
                    let pem = tokio::fs::read(path)
                        .await
                        .map_err(|source| BackendError::ReadCert {
                            path: path.clone(),
                            source,
                        })?;
                    let tls = ClientTlsConfig::new()
                        .ca_certificate(Certificate::from_pem(pem))
                        .domain_name("localhost");
                    endpoint = endpoint.tls_config(tls)?;
                    tracing::debug!(cert = %path.display(), "Loaded node TLS certificate");
                }
                Ok::<_, BackendError>(endpoint.connect_lazy())
            })
            .await
            .cloned()
    }
}

impl GrpcBackend {
    /// Prepare a connection to `address` (`http://host:port` or `https://host:port`).
    ///
    /// With `tls_cert`, the connection is verified against that PEM CA
    /// certificate, read when the first call is made.
    pub fn connect(address: &str, tls_cert: Option<&Path>) -> Result<Self, BackendError> {
        let endpoint = Endpoint::from_shared(address.to_string())
            .map_err(|_| BackendError::InvalidAddress(address.to_string()))?;

        tracing::info!(address, tls = tls_cert.is_some(), "Configured node connection");
        Ok(Self {
            source: Arc::new(ChannelSource {
                endpoint,
                tls_cert: tls_cert.map(Path::to_path_buf),
                channel: OnceCell::new(),
            }),
        })
    }

    /// One callable per spec, invoking `/<service>/<method>` on the node.
    pub fn callables<'a>(
        &self,
        specs: impl IntoIterator<Item = &'a MethodSpec>,
    ) -> Result<Vec<Callable>, BackendError> {
        specs.into_iter().map(|spec| self.callable(spec)).collect()
    }

    fn callable(&self, spec: &MethodSpec) -> Result<Callable, BackendError> {
        let raw = spec.path();
        let path =
            PathAndQuery::try_from(raw.clone()).map_err(|_| BackendError::InvalidPath(raw))?;
        let method = GrpcMethod {
            source: Arc::clone(&self.source),
            path,
        };
        let handler = match MethodKind::from(spec.kind) {
            MethodKind::Unary => Handler::Unary(Arc::new(method)),
            MethodKind::ServerStream => Handler::ServerStream(Arc::new(method)),
            MethodKind::BidiStream => Handler::BidiStream(Arc::new(method)),
        };
        Ok(Callable::new(spec.method.clone(), handler))
    }
}

struct GrpcMethod {
    source: Arc<ChannelSource>,
    path: PathAndQuery,
}

impl GrpcMethod {
    async fn client(&self) -> Result<tonic::client::Grpc<Channel>, InvocationError> {
        let channel = self
            .source
            .channel()
            .await
            .map_err(|e| InvocationError::new(format!("node unavailable: {e}")))?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready().await.map_err(unavailable)?;
        Ok(grpc)
    }
}

fn into_response_stream(stream: tonic::Streaming<Vec<u8>>) -> ResponseStream {
    Box::pin(stream.map(|item| item.map_err(status_to_invocation)))
}

#[async_trait]
impl UnaryMethod for GrpcMethod {
    async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        let mut grpc = self.client().await?;
        let response = grpc
            .unary(Request::new(request), self.path.clone(), RawCodec)
            .await
            .map_err(status_to_invocation)?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl ServerStreamMethod for GrpcMethod {
    async fn open(&self, request: Vec<u8>) -> Result<ResponseStream, InvocationError> {
        let mut grpc = self.client().await?;
        let response = grpc
            .server_streaming(Request::new(request), self.path.clone(), RawCodec)
            .await
            .map_err(status_to_invocation)?;
        Ok(into_response_stream(response.into_inner()))
    }
}

#[async_trait]
impl BidiStreamMethod for GrpcMethod {
    async fn open(&self, outbound: RequestStream) -> Result<ResponseStream, InvocationError> {
        let mut grpc = self.client().await?;
        let response = grpc
            .streaming(Request::new(outbound), self.path.clone(), RawCodec)
            .await
            .map_err(status_to_invocation)?;
        Ok(into_response_stream(response.into_inner()))
    }
}
