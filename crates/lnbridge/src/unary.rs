//! Unary call bridge.
//!
//! Every call runs on its own tokio task and reports back through a oneshot
//! channel, so the caller never blocks on the remote operation and each call
//! resolves exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{Semaphore, oneshot};

use crate::error::DispatchError;
use crate::registry::{Handler, MethodRegistry};

type CallResult = Result<Vec<u8>, DispatchError>;

/// The caller's half of one in-flight unary call.
///
/// Resolves to the raw response bytes or the failure. If the invocation task
/// goes away without answering (for example because the handler panicked) the
/// call resolves to an invocation failure instead of hanging.
#[derive(Debug)]
pub struct PendingCall {
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Failed(Option<DispatchError>),
    Waiting(oneshot::Receiver<CallResult>),
}

impl PendingCall {
    fn failed(err: DispatchError) -> Self {
        Self {
            state: PendingState::Failed(Some(err)),
        }
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            PendingState::Failed(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| DispatchError::invocation("call already resolved")))),
            PendingState::Waiting(rx) => Pin::new(rx).poll(cx).map(|res| {
                res.unwrap_or_else(|_| Err(DispatchError::invocation("call abandoned")))
            }),
        }
    }
}

/// Dispatches unary calls by method name.
#[derive(Clone, Debug)]
pub struct UnaryBridge {
    registry: Arc<MethodRegistry>,
    limiter: Option<Arc<Semaphore>>,
}

impl UnaryBridge {
    /// Create a bridge over a registry with unbounded concurrency.
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self {
            registry,
            limiter: None,
        }
    }

    /// Bound the number of invocations running at once.
    ///
    /// Calls beyond the bound are queued on their own task; dispatch still
    /// returns immediately.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max_concurrent.max(1))));
        self
    }

    /// The registry calls are resolved against.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Start a call and return its pending result without waiting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, method: &str, request: Vec<u8>) -> PendingCall {
        let desc = match self.registry.lookup_unary(method) {
            Ok(desc) => desc,
            Err(e) => {
                tracing::debug!(method, "Unary lookup failed");
                return PendingCall::failed(e);
            }
        };
        let Handler::Unary(handler) = desc.handler() else {
            return PendingCall::failed(DispatchError::MethodNotFound(desc.name().to_string()));
        };

        let handler = Arc::clone(handler);
        let limiter = self.limiter.clone();
        let name = desc.name().to_string();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(sem) => match sem.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        let _ = tx.send(Err(DispatchError::invocation("dispatcher closed")));
                        return;
                    }
                },
                None => None,
            };

            tracing::debug!(method = %name, request_bytes = request.len(), "Invoking unary method");
            let result = handler.call(request).await.map_err(DispatchError::from);
            match &result {
                Ok(bytes) => {
                    tracing::debug!(method = %name, response_bytes = bytes.len(), "Unary method completed");
                }
                Err(e) => tracing::debug!(method = %name, error = %e, "Unary method failed"),
            }

            // The caller may have stopped waiting; that is not an error here.
            let _ = tx.send(result);
        });

        PendingCall {
            state: PendingState::Waiting(rx),
        }
    }

    /// Invoke a unary method and wait for its result.
    pub async fn call(&self, method: &str, request: Vec<u8>) -> CallResult {
        self.dispatch(method, request).await
    }
}
