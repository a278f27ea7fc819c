//! Method registry: name-based lookup of remote operations.
//!
//! The registry is built once from the set of callables the node exposes and
//! is read-only afterwards. Each callable carries a typed handler, and the
//! handler's shape decides its kind: a handler that takes a plain request and
//! returns one response is unary, one that returns a response stream is a
//! server stream, and one that also consumes an outbound message stream is a
//! bidirectional stream.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{DispatchError, InvocationError};

/// Stream of responses produced by a streaming operation.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, InvocationError>> + Send>>;

/// Stream of caller messages pushed into a bidirectional operation.
pub type RequestStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A single request, single response operation.
#[async_trait]
pub trait UnaryMethod: Send + Sync {
    /// Invoke the operation with opaque request bytes.
    async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, InvocationError>;
}

/// An operation that takes one request and answers with a stream.
#[async_trait]
pub trait ServerStreamMethod: Send + Sync {
    /// Open the stream with opaque request bytes.
    async fn open(&self, request: Vec<u8>) -> Result<ResponseStream, InvocationError>;
}

/// An operation that consumes a stream of caller messages and answers with a stream.
#[async_trait]
pub trait BidiStreamMethod: Send + Sync {
    /// Open the stream. `outbound` yields every message the caller writes.
    async fn open(&self, outbound: RequestStream) -> Result<ResponseStream, InvocationError>;
}

/// Classification of a registered operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MethodKind {
    /// One request, one response.
    Unary,
    /// One request, many responses.
    ServerStream,
    /// Many requests, many responses.
    BidiStream,
}

impl MethodKind {
    /// Returns true for either streaming kind.
    pub fn is_stream(&self) -> bool {
        !matches!(self, MethodKind::Unary)
    }

    /// The session direction for streaming kinds, `None` for unary.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            MethodKind::Unary => None,
            MethodKind::ServerStream => Some(Direction::ReceiveOnly),
            MethodKind::BidiStream => Some(Direction::SendAndReceive),
        }
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodKind::Unary => f.write_str("unary"),
            MethodKind::ServerStream => f.write_str("server-stream"),
            MethodKind::BidiStream => f.write_str("bidi-stream"),
        }
    }
}

/// Which way messages flow in an open stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// The caller only receives events.
    ReceiveOnly,
    /// The caller may also write messages into the session.
    SendAndReceive,
}

/// A typed handler bound to a method at registration time.
#[derive(Clone)]
pub enum Handler {
    /// Unary handler.
    Unary(Arc<dyn UnaryMethod>),
    /// Server-streaming handler.
    ServerStream(Arc<dyn ServerStreamMethod>),
    /// Bidirectional-streaming handler.
    BidiStream(Arc<dyn BidiStreamMethod>),
}

impl Handler {
    /// The kind implied by the handler's shape.
    pub fn kind(&self) -> MethodKind {
        match self {
            Handler::Unary(_) => MethodKind::Unary,
            Handler::ServerStream(_) => MethodKind::ServerStream,
            Handler::BidiStream(_) => MethodKind::BidiStream,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// One operation offered by the discovery surface.
#[derive(Clone, Debug)]
pub struct Callable {
    /// Name as reported by the discovery surface (not yet normalized).
    pub name: String,
    /// The bound handler.
    pub handler: Handler,
}

impl Callable {
    /// Create a callable from a name and handler.
    pub fn new(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    /// Unary callable backed by an async closure.
    pub fn unary_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, InvocationError>> + Send + 'static,
    {
        Self::new(name, Handler::Unary(Arc::new(FnUnary(f))))
    }

    /// Server-streaming callable backed by an async closure.
    pub fn server_stream_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseStream, InvocationError>> + Send + 'static,
    {
        Self::new(name, Handler::ServerStream(Arc::new(FnServerStream(f))))
    }

    /// Bidirectional-streaming callable backed by an async closure.
    pub fn bidi_stream_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(RequestStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseStream, InvocationError>> + Send + 'static,
    {
        Self::new(name, Handler::BidiStream(Arc::new(FnBidiStream(f))))
    }
}

struct FnUnary<F>(F);

#[async_trait]
impl<F, Fut> UnaryMethod for FnUnary<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, InvocationError>> + Send + 'static,
{
    async fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        (self.0)(request).await
    }
}

struct FnServerStream<F>(F);

#[async_trait]
impl<F, Fut> ServerStreamMethod for FnServerStream<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseStream, InvocationError>> + Send + 'static,
{
    async fn open(&self, request: Vec<u8>) -> Result<ResponseStream, InvocationError> {
        (self.0)(request).await
    }
}

struct FnBidiStream<F>(F);

#[async_trait]
impl<F, Fut> BidiStreamMethod for FnBidiStream<F>
where
    F: Fn(RequestStream) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseStream, InvocationError>> + Send + 'static,
{
    async fn open(&self, outbound: RequestStream) -> Result<ResponseStream, InvocationError> {
        (self.0)(outbound).await
    }
}

/// A registered operation.
#[derive(Clone, Debug)]
pub struct MethodDescriptor {
    name: String,
    handler: Handler,
}

impl MethodDescriptor {
    /// Normalized method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classification of the operation.
    pub fn kind(&self) -> MethodKind {
        self.handler.kind()
    }

    /// The bound handler.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

/// Capitalize the first character of a method name.
///
/// Node methods are exported in UpperCamelCase while callers commonly use
/// lowerCamelCase (`getInfo`); both resolve to `GetInfo`.
pub fn normalize_method_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Write-once table of every callable operation, keyed by normalized name.
#[derive(Clone, Debug, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodDescriptor>,
}

impl MethodRegistry {
    /// Classify and index every callable.
    ///
    /// Empty names are skipped. When two callables normalize to the same
    /// name the first one wins.
    pub fn register(callables: impl IntoIterator<Item = Callable>) -> Self {
        let mut methods = HashMap::new();

        for callable in callables {
            let name = normalize_method_name(callable.name.trim());
            if name.is_empty() {
                tracing::warn!("Skipping callable with empty name");
                continue;
            }
            if methods.contains_key(&name) {
                tracing::warn!(method = %name, "Duplicate method name, keeping first registration");
                continue;
            }
            tracing::trace!(method = %name, kind = %callable.handler.kind(), "Registered method");
            methods.insert(
                name.clone(),
                MethodDescriptor {
                    name,
                    handler: callable.handler,
                },
            );
        }

        tracing::debug!(count = methods.len(), "Method registry built");
        Self { methods }
    }

    /// Look up a unary method.
    pub fn lookup_unary(&self, name: &str) -> Result<&MethodDescriptor, DispatchError> {
        self.lookup(name, |kind| !kind.is_stream())
    }

    /// Look up a server- or bidirectional-stream method.
    pub fn lookup_stream(&self, name: &str) -> Result<&MethodDescriptor, DispatchError> {
        self.lookup(name, |kind| kind.is_stream())
    }

    /// The kind of a registered method, if any.
    pub fn kind_of(&self, name: &str) -> Option<MethodKind> {
        self.methods
            .get(&normalize_method_name(name))
            .map(MethodDescriptor::kind)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn lookup(
        &self,
        name: &str,
        accept: impl Fn(MethodKind) -> bool,
    ) -> Result<&MethodDescriptor, DispatchError> {
        let normalized = normalize_method_name(name);
        match self.methods.get(&normalized) {
            Some(desc) if accept(desc.kind()) => Ok(desc),
            _ => Err(DispatchError::MethodNotFound(normalized)),
        }
    }
}
