//! In-process transport: two endpoints joined by unbounded queues.
//!
//! Behaves like a pipe pair without an OS process behind it. Disconnecting
//! either side disconnects both, which is how tests simulate a worker dying.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::{Endpoint, Envelope, ProcessEvent, ProcessHandle, Signal};
use crate::error::{Error, Result};

struct MemoryHandle {
    own: mpsc::UnboundedSender<ProcessEvent>,
    peer: mpsc::UnboundedSender<ProcessEvent>,
    connected: Arc<AtomicBool>,
}

/// Create two connected endpoints.
pub fn pair() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));

    let a = MemoryHandle {
        own: a_tx.clone(),
        peer: b_tx.clone(),
        connected: Arc::clone(&connected),
    };
    let b = MemoryHandle {
        own: b_tx,
        peer: a_tx,
        connected,
    };

    (
        Endpoint {
            handle: Arc::new(a),
            events: a_rx,
        },
        Endpoint {
            handle: Arc::new(b),
            events: b_rx,
        },
    )
}

impl ProcessHandle for MemoryHandle {
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        let outcome = if !self.connected.load(Ordering::SeqCst) {
            Err(Error::Transport("endpoint is disconnected".to_string()))
        } else {
            self.peer
                .send(ProcessEvent::Message(envelope))
                .map_err(|_| Error::Transport("peer endpoint was dropped".to_string()))
        };
        futures::future::ready(outcome).boxed()
    }

    fn disconnect(&self, signal: Signal) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::trace!(%signal, "Disconnecting in-memory endpoint");
            let _ = self.own.send(ProcessEvent::Disconnect);
            let _ = self.peer.send(ProcessEvent::Disconnect);
        }
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}
