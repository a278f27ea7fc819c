//! Streaming session manager.
//!
//! A session is one open instance of a streaming method, keyed by a
//! caller-chosen id. Each session is driven by its own task that forwards
//! every response item to the event sink, in order, tagged with the session
//! id. The first error ends the session with exactly one error event; a
//! stream that simply ends produces no terminal event.
//!
//! Bidirectional sessions also hold a writable handle so callers can push
//! messages into the remote stream. Opening an unknown method and writing to
//! an unknown session are deliberately silent towards the caller and only
//! logged.
//!
//! All session bookkeeping goes through one mutex, so a write racing with a
//! session ending either lands in the live session or finds it gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::DispatchError;
use crate::events::{EventSink, StreamEvent};
use crate::registry::{
    BidiStreamMethod, Direction, Handler, MethodRegistry, RequestStream, ServerStreamMethod,
};

type SessionTable = Mutex<HashMap<String, SessionEntry>>;

struct SessionEntry {
    generation: u64,
    method: String,
    direction: Direction,
    /// Present only for bidirectional sessions.
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: AbortHandle,
}

impl SessionEntry {
    fn shutdown(self) {
        self.task.abort();
    }
}

/// Summary of an open session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Caller-chosen id.
    pub session_id: String,
    /// Normalized method name the session was opened against.
    pub method: String,
    /// Whether the session accepts writes.
    pub direction: Direction,
}

enum Opener {
    Server(Arc<dyn ServerStreamMethod>, Vec<u8>),
    Bidi(Arc<dyn BidiStreamMethod>, RequestStream),
}

/// Owns every open stream session.
pub struct StreamManager {
    registry: Arc<MethodRegistry>,
    events: Arc<dyn EventSink<StreamEvent>>,
    sessions: Arc<SessionTable>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("open_sessions", &lock(&self.sessions).len())
            .finish_non_exhaustive()
    }
}

fn lock(sessions: &SessionTable) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamManager {
    /// Create a manager that publishes session events to `events`.
    pub fn new(registry: Arc<MethodRegistry>, events: Arc<dyn EventSink<StreamEvent>>) -> Self {
        Self {
            registry,
            events,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Open a session for a streaming method.
    ///
    /// Server-streaming methods are invoked with `initial_request`;
    /// bidirectional methods ignore it and receive later writes instead.
    /// Unknown methods are logged and otherwise ignored. Opening an id that
    /// is still open replaces the old session without emitting anything for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, method: &str, session_id: &str, initial_request: Vec<u8>) {
        let desc = match self.registry.lookup_stream(method) {
            Ok(desc) => desc,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Ignoring stream open");
                return;
            }
        };

        let (opener, writer) = match desc.handler() {
            Handler::ServerStream(handler) => {
                (Opener::Server(Arc::clone(handler), initial_request), None)
            }
            Handler::BidiStream(handler) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let outbound: RequestStream = Box::pin(UnboundedReceiverStream::new(rx));
                (Opener::Bidi(Arc::clone(handler), outbound), Some(tx))
            }
            Handler::Unary(_) => {
                tracing::warn!(session_id, method = desc.name(), "Ignoring stream open for unary method");
                return;
            }
        };

        let direction = if writer.is_some() {
            Direction::SendAndReceive
        } else {
            Direction::ReceiveOnly
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session_id = session_id.to_string();

        // Hold the table lock across spawn and insert so the task cannot
        // finish and clean up before its entry exists.
        let mut sessions = lock(&self.sessions);
        if let Some(previous) = sessions.remove(&session_id) {
            tracing::warn!(
                session_id = %session_id,
                previous_method = %previous.method,
                "Session id reused while open, closing previous session"
            );
            previous.shutdown();
        }

        let task = tokio::spawn(run_session(
            session_id.clone(),
            desc.name().to_string(),
            opener,
            Arc::clone(&self.events),
            Arc::clone(&self.sessions),
            generation,
        ));

        tracing::debug!(session_id = %session_id, method = desc.name(), ?direction, "Stream session opened");
        sessions.insert(
            session_id,
            SessionEntry {
                generation,
                method: desc.name().to_string(),
                direction,
                writer,
                task: task.abort_handle(),
            },
        );
    }

    /// Push a message into a bidirectional session.
    ///
    /// Writes to sessions that were never opened, are receive-only, or have
    /// already ended are dropped; failures are logged, never surfaced.
    pub fn write(&self, session_id: &str, message: Vec<u8>) {
        match self.try_write(session_id, message) {
            Ok(()) => {}
            Err(e @ DispatchError::SessionNotFound(_)) => {
                tracing::debug!(session_id, error = %e, "Dropping stream write");
            }
            Err(e) => tracing::warn!(session_id, error = %e, "Stream write failed"),
        }
    }

    /// Push a message into a bidirectional session, reporting why it failed.
    pub fn try_write(&self, session_id: &str, message: Vec<u8>) -> Result<(), DispatchError> {
        let mut sessions = lock(&self.sessions);
        let writer = sessions
            .get(session_id)
            .and_then(|entry| entry.writer.as_ref())
            .ok_or_else(|| DispatchError::SessionNotFound(session_id.to_string()))?;

        if writer.send(message).is_ok() {
            return Ok(());
        }
        if let Some(entry) = sessions.remove(session_id) {
            tracing::warn!(session_id, method = %entry.method, "Session stopped reading writes, dropping it");
            entry.shutdown();
        }
        Err(DispatchError::invocation("session no longer accepts writes"))
    }

    /// Close a session, cancelling the remote stream.
    ///
    /// Returns true if a session was open under this id. No event is emitted
    /// for a caller-initiated close.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = lock(&self.sessions).remove(session_id);
        match removed {
            Some(entry) => {
                tracing::debug!(session_id, method = %entry.method, "Stream session closed by caller");
                entry.shutdown();
                true
            }
            None => false,
        }
    }

    /// Close every open session.
    pub fn close_all(&self) {
        let drained: Vec<SessionEntry> = lock(&self.sessions).drain().map(|(_, e)| e).collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Closing all stream sessions");
        }
        for entry in drained {
            entry.shutdown();
        }
    }

    /// Returns true if a session is open under this id.
    pub fn is_open(&self, session_id: &str) -> bool {
        lock(&self.sessions).contains_key(session_id)
    }

    /// Snapshot of the open sessions, sorted by id.
    pub fn open_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = lock(&self.sessions)
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: id.clone(),
                method: entry.method.clone(),
                direction: entry.direction,
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Drive one session until its stream errors or ends.
async fn run_session(
    session_id: String,
    method: String,
    opener: Opener,
    events: Arc<dyn EventSink<StreamEvent>>,
    sessions: Arc<SessionTable>,
    generation: u64,
) {
    let opened = match opener {
        Opener::Server(handler, request) => handler.open(request).await,
        Opener::Bidi(handler, outbound) => handler.open(outbound).await,
    };

    let terminal = match opened {
        Ok(mut stream) => {
            let mut delivered = 0usize;
            let mut failure = None;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(payload) => {
                        delivered += 1;
                        events.emit(StreamEvent::data(session_id.clone(), payload));
                    }
                    Err(e) => {
                        tracing::debug!(session_id = %session_id, method = %method, error = %e, "Stream failed");
                        failure = Some(StreamEvent::error(session_id.clone(), e.message()));
                        break;
                    }
                }
            }
            tracing::debug!(session_id = %session_id, method = %method, delivered, "Stream session finished");
            failure
        }
        Err(e) => {
            tracing::debug!(session_id = %session_id, method = %method, error = %e, "Stream open failed");
            Some(StreamEvent::error(session_id.clone(), e.message()))
        }
    };

    // Writers must not find the session once its error event is out.
    {
        let mut table = lock(&sessions);
        if table
            .get(&session_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            table.remove(&session_id);
        }
    }

    if let Some(event) = terminal {
        events.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::error::InvocationError;
    use crate::events::StreamEventKind;
    use crate::registry::{Callable, ResponseStream};

    const WAIT: Duration = Duration::from_secs(2);

    fn registry() -> Arc<MethodRegistry> {
        Arc::new(MethodRegistry::register(vec![
            Callable::server_stream_fn("SubscribeInvoices", |_req| async move {
                let items: Vec<Result<Vec<u8>, InvocationError>> = vec![
                    Ok(b"one".to_vec()),
                    Ok(b"two".to_vec()),
                    Ok(b"three".to_vec()),
                    Err(InvocationError::new("rpc error: EOF")),
                    Ok(b"never".to_vec()),
                ];
                Ok(Box::pin(futures::stream::iter(items)) as ResponseStream)
            }),
            Callable::server_stream_fn("EchoRequest", |req| async move {
                let items: Vec<Result<Vec<u8>, InvocationError>> = vec![Ok(req)];
                Ok(Box::pin(futures::stream::iter(items)) as ResponseStream)
            }),
            Callable::server_stream_fn("Counter", |_req| async move {
                let items = (0..100u8).map(|i| Ok::<_, InvocationError>(vec![i]));
                Ok(Box::pin(futures::stream::iter(items)) as ResponseStream)
            }),
            Callable::server_stream_fn("Forever", |_req| async move {
                Ok(Box::pin(futures::stream::pending::<Result<Vec<u8>, InvocationError>>()) as ResponseStream)
            }),
            Callable::server_stream_fn("Refused", |_req| async move {
                Err(InvocationError::new("permission denied"))
            }),
            Callable::bidi_stream_fn("SendPayment", |outbound| async move {
                Ok(Box::pin(outbound.map(Ok::<_, InvocationError>)) as ResponseStream)
            }),
            Callable::bidi_stream_fn("RejectFirst", |outbound| async move {
                let replies = outbound.map(|_| Err::<Vec<u8>, _>(InvocationError::new("htlc rejected")));
                Ok(Box::pin(replies) as ResponseStream)
            }),
            Callable::bidi_stream_fn("Deaf", |outbound| async move {
                drop(outbound);
                Ok(Box::pin(futures::stream::pending::<Result<Vec<u8>, InvocationError>>()) as ResponseStream)
            }),
            Callable::unary_fn("GetInfo", |req| async move { Ok(req) }),
        ]))
    }

    fn manager() -> (StreamManager, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamManager::new(registry(), Arc::new(tx)), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) {
        let extra = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(extra.is_err(), "unexpected event: {:?}", extra);
    }

    async fn wait_closed(manager: &StreamManager, id: &str) {
        timeout(WAIT, async {
            while manager.is_open(id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_server_stream_data_then_single_error() {
        let (manager, mut rx) = manager();
        manager.open("SubscribeInvoices", "s1", Vec::new());

        for expected in [&b"one"[..], b"two", b"three"] {
            assert_eq!(next_event(&mut rx).await, StreamEvent::data("s1", expected.to_vec()));
        }
        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::error("s1", "rpc error: EOF")
        );
        assert_quiet(&mut rx).await;
        wait_closed(&manager, "s1").await;
    }

    #[tokio::test]
    async fn test_initial_request_reaches_server_stream() {
        let (manager, mut rx) = manager();
        manager.open("echoRequest", "s1", b"req".to_vec());
        assert_eq!(next_event(&mut rx).await, StreamEvent::data("s1", b"req".to_vec()));
    }

    #[tokio::test]
    async fn test_completion_without_error_emits_nothing_and_closes() {
        let (manager, mut rx) = manager();
        manager.open("EchoRequest", "s1", b"x".to_vec());
        assert!(matches!(next_event(&mut rx).await.kind, StreamEventKind::Data(_)));
        assert_quiet(&mut rx).await;
        wait_closed(&manager, "s1").await;
    }

    #[tokio::test]
    async fn test_events_keep_source_order() {
        let (manager, mut rx) = manager();
        manager.open("Counter", "c", Vec::new());
        for i in 0..100u8 {
            assert_eq!(next_event(&mut rx).await, StreamEvent::data("c", vec![i]));
        }
    }

    #[tokio::test]
    async fn test_open_failure_emits_one_error() {
        let (manager, mut rx) = manager();
        manager.open("Refused", "r", Vec::new());
        assert_eq!(
            next_event(&mut rx).await,
            StreamEvent::error("r", "permission denied")
        );
        assert_quiet(&mut rx).await;
        wait_closed(&manager, "r").await;
    }

    #[tokio::test]
    async fn test_unknown_method_registers_nothing() {
        let (manager, mut rx) = manager();
        manager.open("SubscribeNothing", "s1", Vec::new());
        manager.open("GetInfo", "s2", Vec::new());
        assert!(!manager.is_open("s1"));
        assert!(!manager.is_open("s2"));
        assert!(manager.open_sessions().is_empty());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_bidi_writes_flow_through_in_order() {
        let (manager, mut rx) = manager();
        manager.open("sendPayment", "p", Vec::new());
        assert_eq!(
            manager.open_sessions(),
            vec![SessionInfo {
                session_id: "p".to_string(),
                method: "SendPayment".to_string(),
                direction: Direction::SendAndReceive,
            }]
        );

        manager.write("p", b"a".to_vec());
        manager.write("p", b"b".to_vec());
        assert_eq!(next_event(&mut rx).await, StreamEvent::data("p", b"a".to_vec()));
        assert_eq!(next_event(&mut rx).await, StreamEvent::data("p", b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_write_to_unknown_or_receive_only_session_is_noop() {
        let (manager, mut rx) = manager();
        manager.write("never-opened", b"x".to_vec());
        assert_eq!(
            manager.try_write("never-opened", Vec::new()),
            Err(DispatchError::SessionNotFound("never-opened".to_string()))
        );

        manager.open("Forever", "f", Vec::new());
        assert!(manager.is_open("f"));
        manager.write("f", b"x".to_vec());
        assert!(matches!(
            manager.try_write("f", Vec::new()),
            Err(DispatchError::SessionNotFound(_))
        ));
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_write_after_stream_error_is_noop() {
        let (manager, mut rx) = manager();
        manager.open("SubscribeInvoices", "s1", Vec::new());
        for _ in 0..4 {
            next_event(&mut rx).await;
        }
        wait_closed(&manager, "s1").await;
        manager.write("s1", b"late".to_vec());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_write_rejected_once_error_is_seen() {
        let (manager, mut rx) = manager();
        manager.open("RejectFirst", "h", Vec::new());
        manager.try_write("h", b"htlc".to_vec()).unwrap();

        assert_eq!(next_event(&mut rx).await, StreamEvent::error("h", "htlc rejected"));
        assert_eq!(
            manager.try_write("h", b"again".to_vec()),
            Err(DispatchError::SessionNotFound("h".to_string()))
        );
        assert!(!manager.is_open("h"));
    }

    #[tokio::test]
    async fn test_failed_write_drops_session() {
        let (manager, mut rx) = manager();
        manager.open("Deaf", "d", Vec::new());

        let err = timeout(WAIT, async {
            loop {
                match manager.try_write("d", b"x".to_vec()) {
                    Ok(()) => tokio::time::sleep(Duration::from_millis(5)).await,
                    Err(e) => break e,
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(err, DispatchError::Invocation(_)));
        assert!(!manager.is_open("d"));
        assert_eq!(
            manager.try_write("d", Vec::new()),
            Err(DispatchError::SessionNotFound("d".to_string()))
        );
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_close_cancels_session() {
        let (manager, mut rx) = manager();
        manager.open("SendPayment", "p", Vec::new());
        assert!(manager.close("p"));
        assert!(!manager.is_open("p"));
        assert!(!manager.close("p"));

        manager.write("p", b"after-close".to_vec());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_reopening_id_replaces_previous_session() {
        let (manager, mut rx) = manager();
        manager.open("Forever", "s", Vec::new());
        manager.open("SendPayment", "s", Vec::new());

        let sessions = manager.open_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].method, "SendPayment");

        manager.write("s", b"new".to_vec());
        assert_eq!(next_event(&mut rx).await, StreamEvent::data("s", b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_close_all() {
        let (manager, _rx) = manager();
        manager.open("Forever", "a", Vec::new());
        manager.open("SendPayment", "b", Vec::new());
        assert_eq!(manager.open_sessions().len(), 2);
        manager.close_all();
        assert!(manager.open_sessions().is_empty());
    }
}
