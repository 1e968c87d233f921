//! Child-side wrapper around the connection to the parent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Endpoint, Envelope, ProcessEvent, ProcessHandle, Signal};
use crate::channel::{
    Channel, ChannelEvent, ChannelOptions, LocalInterface, Message, Remote, RemoteInterface,
    send_fn, DEFAULT_CALL_TIMEOUT,
};
use crate::deferred::Deferred;
use crate::error::{Error, Result};

/// Configuration for a [`MasterProcess`].
#[derive(Debug, Clone)]
pub struct MasterOptions {
    /// Methods this process serves to the parent.
    pub local: LocalInterface,
    /// Methods the parent is expected to serve.
    pub remote: RemoteInterface,
    pub call_timeout: Duration,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            local: LocalInterface::new(),
            remote: RemoteInterface::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Handle held by a worker on its parent. Cheap to clone.
#[derive(Clone)]
pub struct MasterProcess {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Arc<dyn ProcessHandle>,
    channel: Channel,
    closed: Deferred<()>,
    shut_down: AtomicBool,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MasterProcess {
    /// Build the channel, start serving and announce `ready` to the parent.
    ///
    /// The parent opens the handshake once it sees `ready`.
    pub async fn start(endpoint: Endpoint, options: MasterOptions) -> Result<Self> {
        let Endpoint { handle, events } = endpoint;

        let outbound = Arc::clone(&handle);
        let send = send_fn(move |message: Message| {
            let handle = Arc::clone(&outbound);
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
            options.local,
            options.remote,
            ChannelOptions {
                call_timeout: options.call_timeout,
                connect_timeout: None,
            },
        );

        let master = Self {
            inner: Arc::new(Inner {
                handle,
                channel,
                closed: Deferred::new(),
                shut_down: AtomicBool::new(false),
                driver: Mutex::new(None),
            }),
        };

        let channel_events = master.inner.channel.subscribe();
        let driver = tokio::spawn(master.clone().drive(events, channel_events));
        *master.inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(driver);

        if let Err(e) = master.inner.handle.send(Envelope::Ready).await {
            master.finish();
            return Err(e);
        }
        tracing::debug!(methods = ?master.inner.channel.local().method_names(), "Announced ready to parent");

        Ok(master)
    }

    /// Wait for the parent's handshake and get a handle to its methods.
    pub async fn remote(&self) -> Result<Remote> {
        self.inner.channel.remote().await
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Wait until the connection to the parent is gone.
    pub async fn closed(&self) {
        let _ = self.inner.closed.promise().wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_settled()
    }

    /// Stop serving, close the channel and disconnect from the parent.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Shutting down master connection");

        let driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }

        self.inner.channel.close().await;
        self.inner.handle.disconnect(Signal::Term);
        self.inner.closed.resolve(());
    }

    async fn drive(
        self,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ProcessEvent::Message(Envelope::Rpc { message })) => {
                        if let Err(e) = self.inner.channel.on_message(message).await {
                            tracing::warn!("Dropping parent connection: {}", e);
                            break;
                        }
                    }
                    Some(ProcessEvent::Message(Envelope::Ready)) => {
                        tracing::warn!("Parent sent ready; ignoring");
                    }
                    Some(ProcessEvent::Error(e)) => {
                        tracing::warn!("Parent transport error: {}", e);
                        break;
                    }
                    Some(ProcessEvent::Exit(code)) => {
                        tracing::debug!(?code, "Parent connection exited");
                        break;
                    }
                    Some(ProcessEvent::Disconnect) | None => {
                        tracing::debug!("Parent disconnected");
                        break;
                    }
                },
                Some(ChannelEvent::Close) = channel_events.recv() => {
                    tracing::debug!("Parent closed the channel");
                    break;
                }
            }
        }

        self.finish();
    }

    /// Local teardown once the parent is gone.
    fn finish(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.channel.terminate();
        self.inner.handle.disconnect(Signal::Term);
        self.inner.closed.resolve(());
    }
}

impl fmt::Debug for MasterProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterProcess")
            .field("channel", &self.inner.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}
