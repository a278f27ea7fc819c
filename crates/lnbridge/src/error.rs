//! Error types shared by the dispatch layer.

use thiserror::Error;

/// A failure reported by the remote operation itself.
///
/// The message is carried verbatim so callers can surface it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InvocationError {
    message: String,
}

impl InvocationError {
    /// Create an invocation error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The underlying error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors produced while dispatching calls and stream writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No method is registered under the (normalized) name.
    #[error("method not found: {0}")]
    MethodNotFound(String),
    /// The remote operation failed.
    #[error("invocation failed: {0}")]
    Invocation(#[from] InvocationError),
    /// No open session accepts writes under this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),
    /// A transport-encoded payload could not be decoded.
    #[error("malformed payload: {0}")]
    Decode(String),
}

impl DispatchError {
    /// Shorthand for an invocation failure with the given message.
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation(InvocationError::new(message))
    }

    /// Returns true if this is a lookup miss.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::MethodNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_not_found_message() {
        let err = DispatchError::MethodNotFound("GetInfo".to_string());
        assert_eq!(err.to_string(), "method not found: GetInfo");
        assert!(err.is_method_not_found());
    }

    #[test]
    fn test_invocation_message_is_preserved() {
        let err = DispatchError::invocation("transport is closing");
        assert!(!err.is_method_not_found());
        match err {
            DispatchError::Invocation(inner) => assert_eq!(inner.message(), "transport is closing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
