//! End-to-end tests for the dispatch bridge, driven the way a host would use
//! it: base64 payloads in, events out.

#![allow(clippy::unwrap_used, clippy::expect_used)] // acceptable in tests

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use lnbridge::{
    Callable, DispatchError, InvocationError, LogLine, MethodKind, MethodRegistry, NodeArgs,
    NodeConfig, NodeController, NodeError, NodePaths, NodeProcess, RequestStream, ResponseStream,
    StreamEvent, StreamEventKind, StreamManager, UnaryBridge, decode_payload, encode_payload,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("lnbridge=debug")
            .with_test_writer()
            .init();
    });
}

/// Macro to log messages in tests (visible with --nocapture)
macro_rules! test_log {
    ($($arg:tt)*) => {
        eprintln!("[TEST] {}", format!($($arg)*));
    };
}

/// A small stand-in for the node's RPC surface.
fn node_methods() -> MethodRegistry {
    MethodRegistry::register(vec![
        Callable::unary_fn("getInfo", |_req| async move { Ok(b"alias=test".to_vec()) }),
        Callable::unary_fn("WalletBalance", |req| async move {
            if req.is_empty() {
                Err(InvocationError::new("wallet locked"))
            } else {
                Ok(req)
            }
        }),
        Callable::server_stream_fn("SubscribeInvoices", |_req| async move {
            let items: Vec<Result<Vec<u8>, InvocationError>> = vec![
                Ok(b"inv-1".to_vec()),
                Ok(b"inv-2".to_vec()),
                Ok(b"inv-3".to_vec()),
                Err(InvocationError::new("EOF")),
                Ok(b"never".to_vec()),
            ];
            Ok(Box::pin(futures::stream::iter(items)) as ResponseStream)
        }),
        Callable::server_stream_fn("SubscribeChannelEvents", |_req| async move {
            let items = (0..3u8).map(|i| Ok::<_, InvocationError>(vec![i]));
            Ok(Box::pin(futures::stream::iter(items)) as ResponseStream)
        }),
        Callable::bidi_stream_fn("OpenChannel", |requests: RequestStream| async move {
            let replies = requests.map(|mut msg| {
                msg.extend_from_slice(b"-ack");
                Ok::<_, InvocationError>(msg)
            });
            Ok(Box::pin(replies) as ResponseStream)
        }),
    ])
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) {
    let extra = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected event: {extra:?}");
}

#[test]
fn test_registry_classifies_methods() {
    let registry = node_methods();
    assert_eq!(registry.kind_of("GetInfo"), Some(MethodKind::Unary));
    assert_eq!(registry.kind_of("subscribeInvoices"), Some(MethodKind::ServerStream));
    assert_eq!(registry.kind_of("OpenChannel"), Some(MethodKind::BidiStream));
    assert!(registry.lookup_unary("SubscribeInvoices").is_err());
    assert!(registry.lookup_stream("GetInfo").is_err());
    assert_eq!(registry.len(), 5);
}

#[tokio::test]
async fn test_unary_call_with_base64_payloads() {
    init_tracing();
    let bridge = UnaryBridge::new(Arc::new(node_methods()));

    let request = decode_payload("").unwrap();
    let response = bridge.call("GetInfo", request).await.unwrap();
    assert_eq!(encode_payload(&response), encode_payload(b"alias=test"));

    let err = bridge.call("WalletBalance", Vec::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "invocation failed: wallet locked");
}

#[tokio::test]
async fn test_unknown_unary_method_is_rejected() {
    init_tracing();
    let bridge = UnaryBridge::new(Arc::new(MethodRegistry::register(Vec::new())));

    let err = bridge
        .call("GetInfo", decode_payload("").unwrap())
        .await
        .unwrap_err();
    test_log!("unknown method error: {err}");
    assert!(err.is_method_not_found());
    assert!(err.to_string().contains("method not found"));
}

#[test]
fn test_malformed_payload_fails_decoding() {
    let err = decode_payload("not base64!").unwrap_err();
    assert!(matches!(err, DispatchError::Decode(_)));
}

#[tokio::test]
async fn test_every_unary_call_resolves_once() {
    init_tracing();
    let bridge = UnaryBridge::new(Arc::new(node_methods()));

    let calls: Vec<_> = (1..=20u8)
        .map(|i| bridge.dispatch("WalletBalance", vec![i]))
        .collect();
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), vec![i as u8 + 1]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_invoices_three_items_then_error() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = StreamManager::new(Arc::new(node_methods()), Arc::new(tx));

    manager.open("SubscribeInvoices", "s1", decode_payload("").unwrap());

    for expected in ["inv-1", "inv-2", "inv-3"] {
        let event = next_event(&mut rx).await;
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.kind, StreamEventKind::Data(expected.as_bytes().to_vec()));
        assert_eq!(event.event_type(), "data");
        assert_eq!(event.encoded_data(), Some(encode_payload(expected.as_bytes())));
    }

    let event = next_event(&mut rx).await;
    assert_eq!(event, StreamEvent::error("s1", "EOF"));
    assert_eq!(event.event_type(), "error");
    assert_no_event(&mut rx).await;
    assert!(!manager.is_open("s1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sessions_are_tagged_independently() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = StreamManager::new(Arc::new(node_methods()), Arc::new(tx));

    manager.open("SubscribeChannelEvents", "a", Vec::new());
    manager.open("SubscribeChannelEvents", "b", Vec::new());

    let mut per_session: std::collections::HashMap<String, Vec<Vec<u8>>> = Default::default();
    for _ in 0..6 {
        let event = next_event(&mut rx).await;
        if let StreamEventKind::Data(bytes) = event.kind {
            per_session.entry(event.session_id).or_default().push(bytes);
        }
    }
    assert_eq!(per_session["a"], vec![vec![0], vec![1], vec![2]]);
    assert_eq!(per_session["b"], vec![vec![0], vec![1], vec![2]]);
    assert_no_event(&mut rx).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bidi_session_round_trip() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = StreamManager::new(Arc::new(node_methods()), Arc::new(tx));

    manager.open("OpenChannel", "chan", decode_payload("aWdub3JlZA==").unwrap());
    manager.write("chan", b"open".to_vec());
    manager.write("chan", b"fund".to_vec());

    assert_eq!(
        next_event(&mut rx).await,
        StreamEvent::data("chan", b"open-ack".to_vec())
    );
    assert_eq!(
        next_event(&mut rx).await,
        StreamEvent::data("chan", b"fund-ack".to_vec())
    );

    assert!(manager.close("chan"));
    manager.write("chan", b"late".to_vec());
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn test_best_effort_stream_operations_are_silent() {
    init_tracing();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let manager = StreamManager::new(Arc::new(node_methods()), Arc::new(tx));

    manager.open("SubscribePeers", "p", Vec::new());
    manager.write("never-opened", b"x".to_vec());
    assert!(!manager.is_open("p"));
    assert!(manager.open_sessions().is_empty());
    assert!(matches!(
        manager.try_write("never-opened", Vec::new()),
        Err(DispatchError::SessionNotFound(_))
    ));
    assert_no_event(&mut rx).await;
}

#[test]
fn test_wallet_exists_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let paths = NodePaths::new(dir.path(), "testnet");
    assert!(!paths.wallet_exists("testnet"));

    let db = dir.path().join("data/chain/bitcoin/testnet/wallet.db");
    std::fs::create_dir_all(db.parent().unwrap()).unwrap();
    std::fs::write(&db, b"wallet").unwrap();
    assert!(paths.wallet_exists("testnet"));
}

/// Node double that records its arguments and reports a fixed outcome.
#[derive(Debug)]
struct FakeNode {
    starts: AtomicUsize,
    fail_first: bool,
    args: std::sync::Mutex<Vec<Vec<String>>>,
}

impl FakeNode {
    fn new(fail_first: bool) -> Self {
        Self {
            starts: AtomicUsize::new(0),
            fail_first,
            args: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl NodeProcess for FakeNode {
    async fn start(&self, args: NodeArgs) -> Result<(), NodeError> {
        self.args.lock().unwrap().push(args.to_args());
        let attempt = self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.fail_first && attempt == 0 {
            Err(NodeError::Startup("chain backend unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_controller_start() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let app_dir = dir.path().join("lnd");
    let paths = NodePaths::new(&app_dir, "testnet");
    let node = Arc::new(FakeNode::new(false));
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogLine>();

    let controller = NodeController::new(paths.clone(), node.clone(), Arc::new(log_tx))
        .with_extra_args(["--bitcoin.testnet"]);
    let mut config = NodeConfig::default();
    config.set("bitcoin.testnet", 1);

    let ready = controller.start(&config).await.unwrap();
    assert!(controller.is_started());
    assert_eq!(ready.config_file, paths.config_file());
    assert_eq!(ready.log_file, paths.log_file());
    assert!(
        std::fs::read_to_string(paths.config_file())
            .unwrap()
            .contains("bitcoin.testnet=1\n")
    );
    assert_eq!(
        node.args.lock().unwrap().as_slice(),
        &[vec![
            format!("--lnddir={}", app_dir.display()),
            "--bitcoin.testnet".to_string()
        ]]
    );

    let err = controller.start(&config).await.unwrap_err();
    assert!(matches!(err, NodeError::AlreadyStarted));
    assert_eq!(node.starts.load(Ordering::SeqCst), 1);

    // The log tail is live once start has returned.
    use std::io::Write;
    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(paths.log_file())
        .unwrap();
    log.write_all(b"Waiting for wallet encryption password\n").unwrap();
    log.flush().unwrap();
    let line = timeout(Duration::from_secs(5), log_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.as_str(), "Waiting for wallet encryption password");

    controller.stop_log_tail().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_controller_failed_start_can_be_retried() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let paths = NodePaths::new(dir.path(), "regtest");
    let node = Arc::new(FakeNode::new(true));
    let (log_tx, _log_rx) = mpsc::unbounded_channel::<LogLine>();
    let controller = NodeController::new(paths, node.clone(), Arc::new(log_tx));

    let err = controller.start(&NodeConfig::default()).await.unwrap_err();
    test_log!("first start failed: {err}");
    assert!(matches!(err, NodeError::Startup(_)));
    assert!(!controller.is_started());
    assert!(!controller.is_tailing_log().await);

    controller.start(&NodeConfig::default()).await.unwrap();
    assert!(controller.is_started());
    assert!(controller.is_tailing_log().await);
    assert_eq!(node.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_node_controller_setup_failure_is_fatal() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    // A file where the log directory tree should go.
    std::fs::write(dir.path().join("logs"), b"").unwrap();
    let node = Arc::new(FakeNode::new(false));
    let (log_tx, _log_rx) = mpsc::unbounded_channel::<LogLine>();
    let controller =
        NodeController::new(NodePaths::new(dir.path(), "testnet"), node.clone(), Arc::new(log_tx));

    let err = controller.start(&NodeConfig::default()).await.unwrap_err();
    assert!(matches!(err, NodeError::Setup(_)), "got {err:?}");
    assert_eq!(node.starts.load(Ordering::SeqCst), 0);
    assert!(!controller.is_started());
}
