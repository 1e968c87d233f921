//! Inter-process RPC and worker supervision for conduit.
//!
//! This crate provides:
//! - A bidirectional RPC channel over any ordered message transport
//! - Master/worker wrappers binding a channel to an OS process
//! - An elastic worker pool with least-loaded dispatch and idle retirement

pub mod channel;
pub mod deferred;
pub mod error;
pub mod events;
pub mod launcher;
pub mod pool;
pub mod process;

pub use channel::{
    Channel, ChannelEvent, ChannelOptions, ChannelState, LocalInterface, Message, Remote,
    RemoteInterface, SendFn, send_fn,
};
pub use deferred::{Deferred, Promise, PromiseTracker, Settlement};
pub use error::{Error, RemoteException, Result};
pub use launcher::{Launcher, ProcessLauncher, find_worker_binary};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
pub use process::master::{MasterOptions, MasterProcess};
pub use process::worker::{
    DisconnectReason, WorkerEvent, WorkerEvents, WorkerOptions, WorkerProcess, WorkerState,
};
pub use process::{Endpoint, Envelope, ProcessEvent, ProcessHandle, Signal};
