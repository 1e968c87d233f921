//! Bidirectional RPC over an opaque, ordered message transport.
//!
//! A [`Channel`] frames calls, acknowledgements, results and exceptions
//! (see [`Message`]) and keeps the table of calls this side has in flight.
//! It never touches the transport itself: the owner supplies a [`SendFn`]
//! for outbound traffic and feeds inbound traffic into
//! [`Channel::on_message`].
//!
//! # Call lifecycle
//!
//! ```text
//!   caller                          callee
//!     │ ── call {id, method, arg} ──▶ │
//!     │ ◀──────── ack {id} ────────── │   clears the caller's timeout
//!     │ ◀── return | exception {id} ─ │   settles the call
//! ```
//!
//! A call that is not acknowledged within [`ChannelOptions::call_timeout`]
//! fails with [`Error::CallTimeout`]. Once acknowledged, the call waits for
//! its result without a deadline.

mod interface;
mod message;

pub use interface::{Decoder, LocalInterface, RemoteInterface};
pub use message::Message;

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::deferred::{Deferred, PromiseTracker};
use crate::error::{Error, RemoteException, Result};
use crate::events::EventBus;

use interface::error_value;

/// Outbound half of the transport. Must fail if the message was not delivered.
pub type SendFn = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a closure as a [`SendFn`].
pub fn send_fn<F, Fut>(f: F) -> SendFn
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Default time a call may wait for its acknowledgement.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(2000);

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// How long an issued call may go unacknowledged.
    pub call_timeout: Duration,
    /// Optional deadline for the handshake. `None` waits forever.
    pub connect_timeout: Option<Duration>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: None,
        }
    }
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Handshake in flight.
    Connecting,
    /// Remote interface resolved.
    Connected,
    /// Terminal.
    Closed,
}

/// Protocol transitions observable from outside the channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// An outbound call was issued.
    MessageCall { id: String, method: String },
    /// An outbound call returned successfully.
    MessageResult { id: String, method: String },
    /// An outbound call failed, for any reason.
    MessageFail {
        id: String,
        method: String,
        error: Error,
    },
    /// An outbound call was never acknowledged.
    MessageTimeout { id: String, method: String },
    /// The handshake did not complete within `connect_timeout`.
    ConnectionTimeout,
    /// The channel closed.
    Close,
}

/// One end of an RPC channel. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    send: SendFn,
    local: LocalInterface,
    remote: RemoteInterface,
    options: ChannelOptions,
    state: Mutex<State>,
    /// Methods advertised by the peer, once the handshake completed.
    remote_methods: Deferred<Arc<BTreeSet<String>>>,
    events: EventBus<ChannelEvent>,
}

struct State {
    phase: ChannelState,
    calls: PromiseTracker<Value>,
    /// Unacknowledged-call timers, keyed by call id.
    timers: FxHashMap<String, JoinHandle<()>>,
    connect_timer: Option<JoinHandle<()>>,
}

impl Channel {
    /// Create a passive channel that waits for the peer's `connect`.
    ///
    /// Must be called inside a tokio runtime when a connect timeout is set.
    pub fn create(
        send: SendFn,
        local: LocalInterface,
        remote: RemoteInterface,
        options: ChannelOptions,
    ) -> Self {
        let connect_timeout = options.connect_timeout;
        let channel = Self {
            inner: Arc::new(Inner {
                send,
                local,
                remote,
                options,
                state: Mutex::new(State {
                    phase: ChannelState::Connecting,
                    calls: PromiseTracker::new(),
                    timers: FxHashMap::default(),
                    connect_timer: None,
                }),
                remote_methods: Deferred::new(),
                events: EventBus::new(),
            }),
        };

        if let Some(timeout) = connect_timeout {
            channel.arm_connect_timer(timeout);
        }
        channel
    }

    /// Create an active channel that immediately sends its `connect`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(
        send: SendFn,
        local: LocalInterface,
        remote: RemoteInterface,
        options: ChannelOptions,
    ) -> Self {
        let channel = Self::create(send, local, remote, options);
        let initiator = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = initiator.handshake().await {
                tracing::warn!(error = %e, "Failed to send channel handshake");
            }
        });
        channel
    }

    /// Send this side's `connect` handshake.
    ///
    /// A failed send rejects the remote interface with the transport error.
    pub async fn handshake(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let methods = self.inner.local.method_names();
        tracing::debug!(?methods, "Sending channel handshake");

        if let Err(e) = self.send(Message::Connect { methods }).await {
            self.inner.remote_methods.reject(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /// Wait for the handshake and get a handle to the peer's methods.
    ///
    /// Never resolves if the peer never connects and no connect timeout is
    /// configured.
    pub async fn remote(&self) -> Result<Remote> {
        let methods = self.inner.remote_methods.promise().wait().await?;
        Ok(Remote {
            channel: self.clone(),
            methods,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.lock().phase
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Number of outbound calls still waiting for a result.
    pub fn pending_calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// Subscribe to protocol events emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// The interface this side serves.
    pub fn local(&self) -> &LocalInterface {
        &self.inner.local
    }

    /// Feed one inbound message from the transport.
    ///
    /// Fails with [`Error::Protocol`] if `raw` is not a valid envelope, and
    /// with the transport error if a protocol reply could not be sent.
    /// Traffic arriving after the channel closed is ignored.
    pub async fn on_message(&self, raw: Value) -> Result<()> {
        let message: Message = serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("malformed channel message: {}", e)))?;

        if self.is_closed() {
            tracing::trace!(kind = message.kind(), "Ignoring message on closed channel");
            return Ok(());
        }
        tracing::trace!(kind = message.kind(), "Channel message received");

        match message {
            Message::Call {
                id,
                method,
                argument,
            } => self.handle_call(id, method, argument).await,

            Message::Closed => {
                tracing::debug!("Peer closed the channel");
                self.transition_closed();
                Ok(())
            }

            Message::Connect { methods } => {
                let ours = self.inner.local.method_names();
                self.send(Message::Connected { methods: ours }).await?;
                self.accept_remote(&methods);
                Ok(())
            }

            Message::Connected { methods } => {
                self.accept_remote(&methods);
                Ok(())
            }

            Message::Ack { id } => {
                let timer = self.lock().timers.remove(&id);
                if let Some(timer) = timer {
                    timer.abort();
                }
                Ok(())
            }

            Message::Return { id, value } => {
                if !self.lock().calls.resolve(&id, value) {
                    tracing::trace!(id, "Dropping result for untracked call");
                }
                Ok(())
            }

            Message::Exception { id, error } => {
                let error = Error::Remote(RemoteException::from_value(error));
                if !self.lock().calls.reject(&id, error) {
                    tracing::trace!(id, "Dropping exception for untracked call");
                }
                Ok(())
            }
        }
    }

    /// Call `method` on the peer and wait for its (decoded) result.
    ///
    /// Does not check the method against the handshake; use [`Remote`] for
    /// that.
    pub async fn remote_call(&self, method: &str, argument: Value) -> Result<Value> {
        let (id, promise) = {
            let mut state = self.lock();
            if state.phase == ChannelState::Closed {
                return Err(Error::ChannelClosed);
            }
            let (id, promise) = state.calls.create();
            let timer = self.arm_call_timer(&id, method);
            state.timers.insert(id.clone(), timer);
            (id, promise)
        };

        let mut guard = CallGuard {
            channel: self,
            id: id.clone(),
            method: method.to_string(),
            finished: false,
        };
        self.inner.events.emit(ChannelEvent::MessageCall {
            id: id.clone(),
            method: method.to_string(),
        });
        tracing::debug!(id, method, "Calling remote method");

        let call = Message::Call {
            id: id.clone(),
            method: method.to_string(),
            argument,
        };
        let outcome = match self.send(call).await {
            Ok(()) => promise.wait().await,
            Err(e) => {
                self.lock().calls.reject(&id, e.clone());
                Err(e)
            }
        };
        let outcome = outcome.and_then(|value| self.inner.remote.decode_result(method, value));

        guard.finish(&outcome);
        outcome
    }

    /// Close the channel, notifying the peer best-effort.
    ///
    /// Every in-flight call fails with [`Error::ClosedBeforeReturn`].
    /// Closing an already closed channel does nothing.
    pub async fn close(&self) {
        if !self.transition_closed() {
            return;
        }
        if let Err(e) = self.send(Message::Closed).await {
            tracing::debug!(error = %e, "Could not deliver close notice");
        }
    }

    /// Close locally without notifying the peer, for when the transport is
    /// already gone.
    pub fn terminate(&self) {
        self.transition_closed();
    }

    async fn send(&self, message: Message) -> Result<()> {
        (self.inner.send)(message).await
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_call(&self, id: String, method: String, argument: Value) -> Result<()> {
        self.send(Message::Ack { id: id.clone() }).await?;

        let invocation = self.inner.local.invoke(&method, argument);
        let channel = self.clone();
        tokio::spawn(async move {
            let reply = match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(Ok(value)) => Message::Return { id, value },
                Ok(Err(error)) => Message::Exception { id, error },
                Err(panic) => Message::Exception {
                    id,
                    error: error_value(format!(
                        "method `{}` panicked: {}",
                        method,
                        panic_message(panic.as_ref())
                    )),
                },
            };

            if channel.is_closed() {
                tracing::trace!(method, "Discarding reply, channel closed");
                return;
            }
            if let Err(e) = channel.send(reply).await {
                tracing::warn!(method, error = %e, "Failed to send call reply");
            }
        });
        Ok(())
    }

    fn accept_remote(&self, advertised: &[String]) {
        let outcome = self.inner.remote.accept(advertised);

        let connect_timer = self.lock().connect_timer.take();
        if let Some(timer) = connect_timer {
            timer.abort();
        }

        match outcome {
            Ok(methods) => {
                if self.inner.remote_methods.resolve(Arc::new(methods)) {
                    let mut state = self.lock();
                    if state.phase == ChannelState::Connecting {
                        state.phase = ChannelState::Connected;
                    }
                    tracing::debug!(methods = ?advertised, "Channel handshake complete");
                } else {
                    tracing::debug!("Ignoring repeated handshake");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting channel handshake");
                self.inner.remote_methods.reject(e);
            }
        }
    }

    /// Move to `Closed`. Returns `false` if the channel was already closed.
    fn transition_closed(&self) -> bool {
        let (timers, connect_timer) = {
            let mut state = self.lock();
            if state.phase == ChannelState::Closed {
                return false;
            }
            state.phase = ChannelState::Closed;
            state.calls.reject_all(Error::ClosedBeforeReturn);
            let timers: Vec<_> = state.timers.drain().map(|(_, timer)| timer).collect();
            (timers, state.connect_timer.take())
        };

        for timer in timers.into_iter().chain(connect_timer) {
            timer.abort();
        }
        self.inner.remote_methods.reject(Error::ChannelClosed);
        self.inner.events.emit(ChannelEvent::Close);
        tracing::debug!("Channel closed");
        true
    }

    fn arm_call_timer(&self, id: &str, method: &str) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timeout = self.inner.options.call_timeout;
        let id = id.to_string();
        let method = method.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                Channel { inner }.on_call_timeout(&id, &method, timeout);
            }
        })
    }

    fn on_call_timeout(&self, id: &str, method: &str, timeout: Duration) {
        let rejected = {
            let mut state = self.lock();
            // An ack that raced the timer removed the entry first.
            state.timers.remove(id).is_some()
                && state.calls.reject(
                    id,
                    Error::CallTimeout {
                        method: method.to_string(),
                        timeout,
                    },
                )
        };

        if rejected {
            tracing::warn!(id, method, ?timeout, "Remote call timed out");
            self.inner.events.emit(ChannelEvent::MessageTimeout {
                id: id.to_string(),
                method: method.to_string(),
            });
        }
    }

    fn arm_connect_timer(&self, timeout: Duration) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.remote_methods.reject(Error::ConnectTimeout(timeout)) {
                tracing::warn!(?timeout, "Channel handshake timed out");
                inner.events.emit(ChannelEvent::ConnectionTimeout);
            }
        });
        self.lock().connect_timer = Some(timer);
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Channel")
            .field("state", &state.phase)
            .field("pending_calls", &state.calls.len())
            .field("local", &self.inner.local)
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        if let Some(timer) = state.connect_timer.take() {
            timer.abort();
        }
    }
}

/// Cleans up a call's table entry and timer however the call ends, and
/// reports its outcome.
struct CallGuard<'a> {
    channel: &'a Channel,
    id: String,
    method: String,
    finished: bool,
}

impl CallGuard<'_> {
    fn finish(&mut self, outcome: &Result<Value>) {
        self.finished = true;
        let id = self.id.clone();
        let method = self.method.clone();
        let event = match outcome {
            Ok(_) => ChannelEvent::MessageResult { id, method },
            Err(error) => {
                tracing::debug!(id, method, error = %error, "Remote call failed");
                ChannelEvent::MessageFail {
                    id,
                    method,
                    error: error.clone(),
                }
            }
        };
        self.channel.inner.events.emit(event);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let timer = {
            let mut state = self.channel.lock();
            state.calls.remove(&self.id);
            state.timers.remove(&self.id)
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        if !self.finished {
            self.channel.inner.events.emit(ChannelEvent::MessageFail {
                id: self.id.clone(),
                method: self.method.clone(),
                error: Error::Abandoned,
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to the peer's methods, available once the handshake completed.
#[derive(Clone)]
pub struct Remote {
    channel: Channel,
    methods: Arc<BTreeSet<String>>,
}

impl Remote {
    /// Methods the peer advertised.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    /// The channel this handle calls through.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Call an advertised method with a raw JSON argument.
    pub async fn call_value(&self, method: &str, argument: Value) -> Result<Value> {
        if !self.has_method(method) {
            return Err(Error::MethodNotFound(method.to_string()));
        }
        self.channel.remote_call(method, argument).await
    }

    /// Call an advertised method with typed argument and result.
    pub async fn call<A, R>(&self, method: &str, argument: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let argument = serde_json::to_value(argument)
            .map_err(|e| Error::Decode(format!("argument of `{}`: {}", method, e)))?;
        let value = self.call_value(method, argument).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Decode(format!("result of `{}`: {}", method, e)))
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("methods", &self.methods)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Sent = Arc<Mutex<Vec<Message>>>;

    fn recorder() -> (SendFn, Sent) {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let send = send_fn(move |message| {
            sink.lock().unwrap().push(message);
            futures::future::ok::<(), Error>(())
        });
        (send, sent)
    }

    async fn wait_for_sent(sent: &Sent, count: usize) {
        for _ in 0..1000 {
            if sent.lock().unwrap().len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {} sent messages, got {:?}", count, sent.lock().unwrap());
    }

    fn echo_channel(send: SendFn) -> Channel {
        let local = LocalInterface::new()
            .method("decrement", |n: i64| async move { Ok::<_, String>(n - 1) })
            .method("explode", |_: ()| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), String>(())
            });
        Channel::create(
            send,
            local,
            RemoteInterface::new(["slow", "decrement"]),
            ChannelOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_call_is_acked_then_answered() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);

        channel
            .on_message(json!({ "type": "call", "id": "7", "method": "decrement", "argument": 5 }))
            .await
            .unwrap();
        wait_for_sent(&sent, 2).await;

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0], Message::Ack { id: "7".into() });
        assert_eq!(
            sent[1],
            Message::Return {
                id: "7".into(),
                value: json!(4)
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_method_yields_exception() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);

        channel
            .on_message(json!({ "type": "call", "id": "0", "method": "nope" }))
            .await
            .unwrap();
        wait_for_sent(&sent, 2).await;

        match &sent.lock().unwrap()[1] {
            Message::Exception { id, error } => {
                assert_eq!(id, "0");
                assert_eq!(error["message"], "method `nope` does not exist");
            }
            other => panic!("expected exception, got {:?}", other),
        }
        assert_eq!(channel.state(), ChannelState::Connecting);
    }

    #[tokio::test]
    async fn test_panicking_method_yields_exception() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);

        channel
            .on_message(json!({ "type": "call", "id": "1", "method": "explode" }))
            .await
            .unwrap();
        wait_for_sent(&sent, 2).await;

        match &sent.lock().unwrap()[1] {
            Message::Exception { error, .. } => {
                assert_eq!(error["message"], "method `explode` panicked: kaboom");
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_message_is_a_protocol_error() {
        let (send, _sent) = recorder();
        let channel = echo_channel(send);

        let err = channel
            .on_message(json!({ "type": "teleport" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_call_times_out_once() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);
        let mut events = channel.subscribe();

        let err = channel.remote_call("slow", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::CallTimeout { ref method, .. } if method == "slow"));
        assert_eq!(channel.pending_calls(), 0);
        assert_eq!(sent.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;

        let mut timeouts = 0;
        let mut fails = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ChannelEvent::MessageTimeout { .. } => timeouts += 1,
                ChannelEvent::MessageFail { .. } => fails += 1,
                _ => {}
            }
        }
        assert_eq!(timeouts, 1);
        assert_eq!(fails, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_disarms_timeout() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);

        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.remote_call("slow", json!(1)).await });
        wait_for_sent(&sent, 1).await;

        channel
            .on_message(json!({ "type": "ack", "id": "0" }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!call.is_finished());

        channel
            .on_message(json!({ "type": "return", "id": "0", "return": "done" }))
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_exception_rejects_call() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);

        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.remote_call("slow", Value::Null).await });
        wait_for_sent(&sent, 1).await;

        channel
            .on_message(json!({ "type": "exception", "id": "0", "error": { "message": "bad" } }))
            .await
            .unwrap();

        match call.await.unwrap() {
            Err(Error::Remote(exc)) => assert_eq!(exc.message, "bad"),
            other => panic!("expected remote exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_response_ids_are_ignored() {
        let (send, _sent) = recorder();
        let channel = echo_channel(send);

        for raw in [
            json!({ "type": "ack", "id": "99" }),
            json!({ "type": "return", "id": "99", "return": 1 }),
            json!({ "type": "exception", "id": "99", "error": "x" }),
        ] {
            channel.on_message(raw).await.unwrap();
        }
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);
        let mut events = channel.subscribe();

        channel.close().await;
        channel.close().await;

        let closed = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| **m == Message::Closed)
            .count();
        assert_eq!(closed, 1);
        assert!(matches!(events.try_recv(), Ok(ChannelEvent::Close)));
        assert!(events.try_recv().is_err());

        assert!(matches!(
            channel.remote_call("slow", Value::Null).await,
            Err(Error::ChannelClosed)
        ));
        assert!(matches!(channel.remote().await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_closed_message_fails_in_flight_calls() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);

        let caller = channel.clone();
        let call = tokio::spawn(async move { caller.remote_call("slow", Value::Null).await });
        wait_for_sent(&sent, 1).await;

        channel
            .on_message(json!({ "type": "closed" }))
            .await
            .unwrap();
        assert!(matches!(call.await.unwrap(), Err(Error::ClosedBeforeReturn)));

        // Further traffic is ignored rather than answered.
        channel
            .on_message(json!({ "type": "call", "id": "5", "method": "decrement", "argument": 1 }))
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_answered_and_resolves_remote() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);

        channel
            .on_message(json!({ "type": "connect", "methods": ["slow"] }))
            .await
            .unwrap();

        assert_eq!(
            sent.lock().unwrap()[0],
            Message::Connected {
                methods: vec!["decrement".into(), "explode".into()]
            }
        );
        let remote = channel.remote().await.unwrap();
        assert!(remote.has_method("slow"));
        assert!(!remote.has_method("decrement"));
        assert_eq!(channel.state(), ChannelState::Connected);

        // A second connect is answered again but keeps the first interface.
        channel
            .on_message(json!({ "type": "connect", "methods": ["decrement"] }))
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap().len(), 2);
        let remote = channel.remote().await.unwrap();
        assert_eq!(remote.methods().collect::<Vec<_>>(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_undeclared_methods_reject_handshake() {
        let (send, _sent) = recorder();
        let channel = echo_channel(send);

        channel
            .on_message(json!({ "type": "connected", "methods": ["slow", "rm_rf"] }))
            .await
            .unwrap();

        match channel.remote().await {
            Err(Error::Handshake { unexpected }) => assert_eq!(unexpected, vec!["rm_rf"]),
            other => panic!("expected handshake rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_refuses_unadvertised_methods() {
        let (send, sent) = recorder();
        let channel = echo_channel(send);
        channel
            .on_message(json!({ "type": "connected", "methods": ["slow"] }))
            .await
            .unwrap();

        let remote = channel.remote().await.unwrap();
        assert!(matches!(
            remote.call_value("decrement", json!(1)).await,
            Err(Error::MethodNotFound(ref m)) if m == "decrement"
        ));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (send, _sent) = recorder();
        let channel = Channel::create(
            send,
            LocalInterface::new(),
            RemoteInterface::default(),
            ChannelOptions {
                connect_timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        );
        let mut events = channel.subscribe();

        assert!(matches!(
            channel.remote().await,
            Err(Error::ConnectTimeout(t)) if t == Duration::from_millis(500)
        ));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::ConnectionTimeout)
        ));
    }

    #[tokio::test]
    async fn test_failed_send_rejects_call() {
        let send = send_fn(|_| futures::future::err::<(), Error>(Error::Transport("pipe broken".into())));
        let channel = echo_channel(send);

        assert!(matches!(
            channel.remote_call("slow", Value::Null).await,
            Err(Error::Transport(_))
        ));
        assert_eq!(channel.pending_calls(), 0);
    }
}
