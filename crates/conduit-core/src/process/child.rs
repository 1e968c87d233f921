//! Stdio transports: a spawned child seen from the parent, and the parent
//! seen from inside the child.
//!
//! Envelopes travel as newline-delimited JSON. The parent writes to the
//! child's stdin and reads its stdout; stderr is left for logging.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};

use super::{Endpoint, Envelope, ProcessEvent, ProcessHandle, Signal};
use crate::error::{Error, Result};

/// Environment variable marking the current process's stdio as an IPC pipe.
pub const IPC_ENV: &str = "CONDUIT_IPC";

/// Writable end of a line-framed pipe. `None` once closed.
struct LineWriter<W> {
    pipe: Arc<Mutex<Option<W>>>,
}

impl<W> Clone for LineWriter<W> {
    fn clone(&self) -> Self {
        Self {
            pipe: Arc::clone(&self.pipe),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> LineWriter<W> {
    fn new(pipe: W) -> Self {
        Self {
            pipe: Arc::new(Mutex::new(Some(pipe))),
        }
    }

    fn send(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        let pipe = Arc::clone(&self.pipe);
        async move {
            let line = envelope.to_line()?;
            let mut guard = pipe.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| Error::Transport("pipe is closed".to_string()))?;
            writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::Transport(format!("failed to write envelope: {}", e)))?;
            writer
                .flush()
                .await
                .map_err(|e| Error::Transport(format!("failed to flush pipe: {}", e)))
        }
        .boxed()
    }

    /// Drop the write end so the reader on the other side sees EOF.
    fn close(&self) {
        let pipe = Arc::clone(&self.pipe);
        tokio::spawn(async move {
            if let Some(mut writer) = pipe.lock().await.take() {
                let _ = writer.shutdown().await;
            }
        });
    }
}

/// Turn lines from `reader` into events until EOF.
fn spawn_reader<R>(reader: R, events: mpsc::UnboundedSender<ProcessEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) if line.trim().is_empty() => continue,
                Ok(_) => {
                    let event = match Envelope::from_line(&line) {
                        Ok(envelope) => ProcessEvent::Message(envelope),
                        Err(e) => ProcessEvent::Error(e.to_string()),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events.send(ProcessEvent::Error(format!("failed to read pipe: {}", e)));
                    break;
                }
            }
        }

        let _ = events.send(ProcessEvent::Disconnect);
    });
}

/// Parent-side handle on a spawned child process.
pub struct ChildHandle {
    pid: Option<u32>,
    stdin: LineWriter<tokio::process::ChildStdin>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl ChildHandle {
    /// Take over a child spawned with piped stdin and stdout.
    ///
    /// Fails with [`Error::Config`] if either pipe is missing, since the
    /// child would have no IPC channel.
    pub fn from_child(mut child: Child) -> Result<Endpoint> {
        let stdin = child.stdin.take().ok_or_else(|| {
            Error::Config("child process stdin is not piped; it has no IPC channel".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Config("child process stdout is not piped; it has no IPC channel".to_string())
        })?;
        let pid = child.id();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        spawn_reader(stdout, events_tx.clone());
        spawn_waiter(child, signals_rx, events_tx);

        let handle = ChildHandle {
            pid,
            stdin: LineWriter::new(stdin),
            signals: signals_tx,
        };
        Ok(Endpoint {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

impl ProcessHandle for ChildHandle {
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        self.stdin.send(envelope)
    }

    fn disconnect(&self, signal: Signal) {
        self.stdin.close();
        // The waiter is gone once the child was reaped.
        let _ = self.signals.send(signal);
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Reap the child, reporting its exit and delivering requested signals.
fn spawn_waiter(
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let event = match status {
                        Ok(status) => ProcessEvent::Exit(status.code()),
                        Err(e) => ProcessEvent::Error(format!("failed to wait for child: {}", e)),
                    };
                    let _ = events.send(event);
                    return;
                }
                Some(signal) = signals.recv() => deliver(&mut child, signal),
            }
        }
    });
}

#[cfg(unix)]
fn deliver(child: &mut Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    tracing::debug!(pid, %signal, "Signalling child process");
    // SAFETY: `pid` belongs to a child we have not reaped yet.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, %signal, "Failed to signal child process: {}", err);
        }
    }
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, signal: Signal) {
    tracing::debug!(pid = ?child.id(), %signal, "Terminating child process");
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to terminate child process: {}", e);
    }
}

/// Child-side handle on the parent, over the current process's stdio.
pub struct ParentHandle {
    stdout: LineWriter<tokio::io::Stdout>,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl ParentHandle {
    /// Use stdin and stdout as the IPC channel to the parent.
    ///
    /// Fails with [`Error::Config`] unless the launcher marked stdio as an
    /// IPC pipe by setting `CONDUIT_IPC=1`.
    pub fn from_stdio() -> Result<Endpoint> {
        match std::env::var(IPC_ENV) {
            Ok(value) if value == "1" => {}
            _ => {
                return Err(Error::Config(format!(
                    "stdio is not an IPC channel ({} is not set); \
                     this process must be started by a worker pool",
                    IPC_ENV
                )));
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        spawn_reader(tokio::io::stdin(), events_tx.clone());

        let handle = ParentHandle {
            stdout: LineWriter::new(tokio::io::stdout()),
            events: events_tx,
        };
        Ok(Endpoint {
            handle: Arc::new(handle),
            events: events_rx,
        })
    }
}

impl ProcessHandle for ParentHandle {
    fn send(&self, envelope: Envelope) -> BoxFuture<'static, Result<()>> {
        self.stdout.send(envelope)
    }

    /// Closes stdout. The parent is never signalled.
    fn disconnect(&self, _signal: Signal) {
        self.stdout.close();
        let _ = self.events.send(ProcessEvent::Disconnect);
    }

    fn pid(&self) -> Option<u32> {
        #[cfg(unix)]
        {
            Some(std::os::unix::process::parent_id())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}
