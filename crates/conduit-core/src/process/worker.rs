//! Parent-side wrapper around one worker process.
//!
//! The worker moves through `AwaitingReady → Handshaking → Connected →
//! Disconnected`. Nothing is sent until the child announces `ready`; the
//! parent then opens the channel handshake. The connect timeout covers both
//! the wait for `ready` and the handshake.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Endpoint, Envelope, ProcessEvent, ProcessHandle, Signal};
use crate::channel::{
    Channel, ChannelEvent, ChannelOptions, LocalInterface, Message, Remote, RemoteInterface,
    send_fn, DEFAULT_CALL_TIMEOUT,
};
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::events::EventBus;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(0);

/// Default time a worker has to become ready and finish the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Configuration for a [`WorkerProcess`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Methods the parent serves to the worker.
    pub local: LocalInterface,
    /// Methods the worker is expected to serve.
    pub remote: RemoteInterface,
    /// Unacknowledged call timeout for the channel.
    pub call_timeout: Duration,
    /// Deadline for `ready` plus the handshake.
    pub connect_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            local: LocalInterface::new(),
            remote: RemoteInterface::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingReady,
    Handshaking,
    Connected,
    Disconnected,
}

/// Why a worker went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`WorkerProcess::kill`] was called.
    Killed,
    /// The process exited on its own.
    Exited(Option<i32>),
    /// The transport failed or closed unexpectedly.
    TransportError(String),
    /// The worker closed the channel.
    ChannelClosed,
    /// No `ready` or handshake within the connect timeout.
    ConnectTimeout,
    /// The worker sent something that is not valid protocol.
    ProtocolError(String),
}

impl DisconnectReason {
    /// Whether the process may still be running and must be told to stop.
    fn needs_shutdown(&self) -> bool {
        !matches!(self, DisconnectReason::Killed | DisconnectReason::Exited(_))
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Killed => write!(f, "killed"),
            DisconnectReason::Exited(Some(code)) => write!(f, "exited with code {}", code),
            DisconnectReason::Exited(None) => write!(f, "exited"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
            DisconnectReason::ChannelClosed => write!(f, "channel closed"),
            DisconnectReason::ConnectTimeout => write!(f, "connection timed out"),
            DisconnectReason::ProtocolError(e) => write!(f, "protocol error: {}", e),
        }
    }
}

/// Lifecycle and load events of a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The handshake finished; [`WorkerProcess::remote`] is available.
    Connect,
    /// A call to the worker was issued.
    TaskStart { id: String, method: String },
    /// A call to the worker returned.
    TaskEnd { id: String, method: String },
    /// A call to the worker failed.
    TaskFail {
        id: String,
        method: String,
        error: Error,
    },
    /// The worker is gone. Always the last event.
    Disconnect { reason: DisconnectReason },
}

/// Receiver of [`WorkerEvent`]s.
pub type WorkerEvents = mpsc::UnboundedReceiver<WorkerEvent>;

/// Handle to a worker process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WorkerProcess {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    handle: Arc<dyn ProcessHandle>,
    options: WorkerOptions,
    slot: Mutex<Slot>,
    remote: Deferred<Remote>,
    disconnected: Deferred<DisconnectReason>,
    events: EventBus<WorkerEvent>,
}

struct Slot {
    state: WorkerState,
    channel: Option<Channel>,
    killing: bool,
    connect_timer: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    /// Start driving `endpoint` and return the worker with its first event
    /// subscription, which sees every event from the start.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(endpoint: Endpoint, options: WorkerOptions) -> (Self, WorkerEvents) {
        let Endpoint { handle, events } = endpoint;
        let worker = Self {
            inner: Arc::new(Inner {
                id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
                handle,
                options,
                slot: Mutex::new(Slot {
                    state: WorkerState::AwaitingReady,
                    channel: None,
                    killing: false,
                    connect_timer: None,
                }),
                remote: Deferred::new(),
                disconnected: Deferred::new(),
                events: EventBus::new(),
            }),
        };
        let subscription = worker.inner.events.subscribe();

        worker.arm_connect_timer();
        tokio::spawn(worker.clone().drive(events));
        tracing::debug!(worker = worker.id(), pid = ?worker.pid(), "Worker started");

        (worker, subscription)
    }

    /// Process-wide unique id of this worker.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.handle.pid()
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn is_disconnected(&self) -> bool {
        self.state() == WorkerState::Disconnected
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> WorkerEvents {
        self.inner.events.subscribe()
    }

    /// Wait until the worker is ready and the handshake completed.
    pub async fn remote(&self) -> Result<Remote> {
        self.inner.remote.promise().wait().await
    }

    /// Wait until the worker is gone.
    pub async fn closed(&self) -> DisconnectReason {
        self.inner
            .disconnected
            .promise()
            .wait()
            .await
            .unwrap_or(DisconnectReason::Killed)
    }

    /// Ask the process to disconnect and terminate, then wait until it is
    /// gone. Killing a worker that is already gone returns at once.
    pub async fn kill(&self, signal: Signal) -> DisconnectReason {
        let already_gone = {
            let mut slot = self.lock();
            let gone = slot.state == WorkerState::Disconnected;
            if !gone {
                slot.killing = true;
            }
            gone
        };

        if !already_gone {
            tracing::info!(worker = self.id(), %signal, "Killing worker");
            self.inner.handle.disconnect(signal);
        }
        self.closed().await
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drive(self, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Message(Envelope::Ready) => self.on_ready().await,
                ProcessEvent::Message(Envelope::Rpc { message }) => self.on_rpc(message).await,
                ProcessEvent::Disconnect => {
                    self.mark_disconnected(DisconnectReason::TransportError(
                        "IPC channel disconnected".to_string(),
                    ));
                }
                ProcessEvent::Exit(code) => self.mark_disconnected(DisconnectReason::Exited(code)),
                ProcessEvent::Error(e) => {
                    tracing::warn!(worker = self.id(), "Worker transport error: {}", e);
                    self.mark_disconnected(DisconnectReason::TransportError(e));
                }
            }

            if self.is_disconnected() {
                return;
            }
        }

        self.mark_disconnected(DisconnectReason::TransportError(
            "process event stream ended".to_string(),
        ));
    }

    async fn on_ready(&self) {
        let channel = {
            let mut slot = self.lock();
            if slot.state != WorkerState::AwaitingReady {
                tracing::trace!(worker = self.id(), "Ignoring repeated ready");
                return;
            }
            slot.state = WorkerState::Handshaking;

            let handle = Arc::clone(&self.inner.handle);
            let send = send_fn(move |message: Message| {
                let handle = Arc::clone(&handle);
                let encoded = serde_json::to_value(&message);
                async move {
                    match encoded {
                        Ok(message) => handle.send(Envelope::Rpc { message }).await,
                        Err(e) => Err(Error::from(e)),
                    }
                }
            });
            let channel = Channel::create(
                send,
                self.inner.options.local.clone(),
                self.inner.options.remote.clone(),
                ChannelOptions {
                    call_timeout: self.inner.options.call_timeout,
                    connect_timeout: None,
                },
            );
            slot.channel = Some(channel.clone());
            channel
        };
        tracing::debug!(worker = self.id(), "Worker ready, starting handshake");

        self.forward_channel_events(&channel);
        if let Err(e) = channel.handshake().await {
            self.mark_disconnected(DisconnectReason::TransportError(e.to_string()));
            return;
        }

        let worker = self.clone();
        tokio::spawn(async move {
            match channel.remote().await {
                Ok(remote) => worker.on_connected(remote),
                Err(Error::Handshake { unexpected }) => {
                    worker.mark_disconnected(DisconnectReason::ProtocolError(format!(
                        "worker advertised undeclared methods {:?}",
                        unexpected
                    )));
                }
                Err(Error::ChannelClosed) => {
                    worker.mark_disconnected(DisconnectReason::ChannelClosed);
                }
                Err(e) => worker.mark_disconnected(DisconnectReason::TransportError(e.to_string())),
            }
        });
    }

    async fn on_rpc(&self, message: Value) {
        let channel = self.lock().channel.clone();
        let Some(channel) = channel else {
            tracing::warn!(worker = self.id(), "Worker sent rpc traffic before ready");
            self.mark_disconnected(DisconnectReason::ProtocolError(
                "rpc message before ready".to_string(),
            ));
            return;
        };

        match channel.on_message(message).await {
            Ok(()) if channel.is_closed() => {
                self.mark_disconnected(DisconnectReason::ChannelClosed);
            }
            Ok(()) => {}
            Err(Error::Protocol(e)) => {
                tracing::warn!(worker = self.id(), "Worker protocol error: {}", e);
                self.mark_disconnected(DisconnectReason::ProtocolError(e));
            }
            Err(e) => self.mark_disconnected(DisconnectReason::TransportError(e.to_string())),
        }
    }

    fn on_connected(&self, remote: Remote) {
        let timer = {
            let mut slot = self.lock();
            if slot.state != WorkerState::Handshaking {
                return;
            }
            slot.state = WorkerState::Connected;
            slot.connect_timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        self.inner.remote.resolve(remote);
        tracing::info!(worker = self.id(), pid = ?self.pid(), "Worker connected");
        self.inner.events.emit(WorkerEvent::Connect);
    }

    /// Mirror channel call events as task events.
    fn forward_channel_events(&self, channel: &Channel) {
        let mut events = channel.subscribe();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let worker = WorkerProcess { inner };
                let forwarded = match event {
                    ChannelEvent::MessageCall { id, method } => WorkerEvent::TaskStart { id, method },
                    ChannelEvent::MessageResult { id, method } => WorkerEvent::TaskEnd { id, method },
                    ChannelEvent::MessageFail { id, method, error } => {
                        WorkerEvent::TaskFail { id, method, error }
                    }
                    ChannelEvent::Close => {
                        worker.mark_disconnected(DisconnectReason::ChannelClosed);
                        continue;
                    }
                    ChannelEvent::MessageTimeout { .. } | ChannelEvent::ConnectionTimeout => {
                        continue;
                    }
                };
                worker.inner.events.emit(forwarded);
            }
        });
    }

    fn arm_connect_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.options.connect_timeout;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let worker = WorkerProcess { inner };
            let state = worker.state();
            if matches!(state, WorkerState::AwaitingReady | WorkerState::Handshaking) {
                tracing::warn!(worker = worker.id(), ?state, ?timeout, "Worker failed to connect in time");
                worker.mark_disconnected(DisconnectReason::ConnectTimeout);
            }
        });
        self.lock().connect_timer = Some(timer);
    }

    /// Move to `Disconnected`. Every call after the first is a no-op.
    fn mark_disconnected(&self, reason: DisconnectReason) {
        let (channel, timer, killing) = {
            let mut slot = self.lock();
            if slot.state == WorkerState::Disconnected {
                return;
            }
            slot.state = WorkerState::Disconnected;
            (slot.channel.clone(), slot.connect_timer.take(), slot.killing)
        };
        let reason = if killing {
            DisconnectReason::Killed
        } else {
            reason
        };

        if let Some(timer) = timer {
            timer.abort();
        }
        if let Some(channel) = channel {
            channel.terminate();
        }
        if !killing && reason.needs_shutdown() {
            self.inner.handle.disconnect(Signal::Term);
        }

        let error = match reason {
            DisconnectReason::ConnectTimeout => {
                Error::ConnectTimeout(self.inner.options.connect_timeout)
            }
            ref other => Error::Disconnected(other.to_string()),
        };
        self.inner.remote.reject(error);
        self.inner.disconnected.resolve(reason.clone());

        match reason {
            DisconnectReason::Killed | DisconnectReason::Exited(Some(0)) => {
                tracing::info!(worker = self.id(), %reason, "Worker disconnected");
            }
            _ => tracing::warn!(worker = self.id(), %reason, "Worker disconnected"),
        }
        self.inner.events.emit(WorkerEvent::Disconnect { reason });
    }
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("id", &self.id())
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish()
    }
}
