//! lnbridge: dynamic RPC dispatch for a background Lightning node.
//!
//! The crate bridges a host application to a node's RPC surface by method
//! name. Unary calls resolve through [`UnaryBridge`], streaming methods run as
//! long-lived sessions in [`StreamManager`] and report through an
//! [`EventSink`], and [`NodeController`] brings the node up while
//! [`LogTail`] follows its log. Payloads cross the host boundary as base64
//! (see [`payload`]).

pub mod error;
pub mod events;
pub mod logtail;
pub mod node;
pub mod payload;
pub mod registry;
pub mod session;
pub mod unary;

pub use error::{DispatchError, InvocationError};
pub use events::{EventSink, LogLine, StreamEvent, StreamEventKind};
pub use logtail::{LogTail, SetupError};
pub use node::{
    ChildProcessNode, NodeArgs, NodeConfig, NodeController, NodeError, NodePaths, NodeProcess,
    Readiness,
};
pub use payload::{decode_payload, encode_payload};
pub use registry::{
    BidiStreamMethod, Callable, Direction, Handler, MethodDescriptor, MethodKind, MethodRegistry,
    RequestStream, ResponseStream, ServerStreamMethod, UnaryMethod, normalize_method_name,
};
pub use session::{SessionInfo, StreamManager};
pub use unary::{PendingCall, UnaryBridge};
