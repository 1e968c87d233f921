//! Process-level transport and the wrappers that bind a channel to it.
//!
//! A transport is anything that implements [`ProcessHandle`] and delivers
//! inbound [`ProcessEvent`]s through an [`Endpoint`]. Two are provided:
//! stdio pipes of an OS process ([`child`]) and an in-memory pair
//! ([`memory`]). Data and control traffic share the transport, multiplexed
//! by [`Envelope`].

pub mod child;
pub mod master;
pub mod memory;
pub mod worker;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Control or data message carried over a process transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// The child finished bootstrapping and is ready for the handshake.
    Ready,
    /// A channel message.
    Rpc { message: Value },
}

impl Envelope {
    /// Encode as a single newline-terminated JSON line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line produced by [`Envelope::to_line`].
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| Error::Protocol(format!("malformed envelope: {}", e)))
    }
}

/// Termination signal requested on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
    Interrupt,
}

impl Signal {
    #[cfg(unix)]
    pub(crate) fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Interrupt => libc::SIGINT,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Interrupt => "SIGINT",
        };
        f.write_str(name)
    }
}

/// Inbound lifecycle and data events from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// An envelope arrived.
    Message(Envelope),
    /// The IPC link closed.
    Disconnect,
    /// The process exited with the given code, if any.
    Exit(Option<i32>),
    /// The transport failed.
    Error(String),
}

/// Outbound half of a process transport.
pub trait ProcessHandle: Send + Sync + 'static {
    /// Deliver an envelope. Fails if it could not be written.
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>>;

    /// Close the IPC link and ask the process to terminate with `signal`.
    fn disconnect(&self, signal: Signal);

    /// OS process id of the far side, when there is one.
    fn pid(&self) -> Option<u32>;
}

/// A connected transport: its outbound handle and inbound event stream.
pub struct Endpoint {
    pub handle: Arc<dyn ProcessHandle>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("pid", &self.handle.pid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_lines() {
        let ready = Envelope::Ready.to_line().unwrap();
        assert_eq!(ready, "{\"type\":\"ready\"}\n");

        let rpc = Envelope::Rpc {
            message: json!({ "type": "ack", "id": "4" }),
        };
        let line = rpc.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(Envelope::from_line(&line).unwrap(), rpc);
    }

    #[test]
    fn test_malformed_line_is_protocol_error() {
        assert!(matches!(
            Envelope::from_line("not json"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Envelope::from_line("{\"type\":\"rpc\"}"),
            Err(Error::Protocol(_))
        ));
    }
}
