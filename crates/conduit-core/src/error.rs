//! Error types for conduit-core.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Result type for conduit-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in conduit-core.
///
/// Cloneable so a single failure (a closed channel, a dead worker) can
/// reject every waiter that depends on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The transport failed to deliver a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// The OS process failed or exited unexpectedly.
    #[error("process error: {0}")]
    Process(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// An inbound message could not be decoded as a protocol envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer advertised methods outside the declared remote interface.
    #[error("handshake rejected: peer advertised undeclared methods {unexpected:?}")]
    Handshake { unexpected: Vec<String> },

    /// The remote method implementation failed.
    #[error("remote exception: {0}")]
    Remote(RemoteException),

    /// The named method is not part of the interface.
    #[error("method `{0}` does not exist")]
    MethodNotFound(String),

    /// A call argument or result failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// No acknowledgement arrived for a call in time.
    #[error("call `{method}` timed out after {timeout:?}")]
    CallTimeout { method: String, timeout: Duration },

    /// The peer never completed the connection in time.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The channel was already closed when the call was issued.
    #[error("channel is closed")]
    ChannelClosed,

    /// The channel closed while the call was in flight.
    #[error("channel closed before call returned")]
    ClosedBeforeReturn,

    /// The worker process went away.
    #[error("worker disconnected: {0}")]
    Disconnected(String),

    /// A deferred was dropped without ever being settled.
    #[error("deferred dropped before it was settled")]
    Abandoned,

    /// Invalid configuration or a handle without IPC support.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pool has been shut down.
    #[error("worker pool is shutting down")]
    PoolClosed,

    /// Every slot is held by a worker that is still shutting down.
    #[error("worker pool is at capacity ({0} workers) while workers shut down")]
    PoolFull(usize),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// The error value carried by an `exception` response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteException {
    /// Human readable message extracted from the payload.
    pub message: String,
    /// The raw error payload as sent by the peer.
    pub value: Value,
}

impl RemoteException {
    /// Build from the raw payload of an `exception` message.
    ///
    /// Accepts `{ "message": .. }` objects and bare strings; anything else is
    /// rendered as JSON.
    pub fn from_value(value: Value) -> Self {
        let message = match &value {
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("message") {
                Some(Value::String(s)) => s.clone(),
                _ => value.to_string(),
            },
            other => other.to_string(),
        };
        Self { message, value }
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
