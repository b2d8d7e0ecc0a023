//! Resumable chunked upload engine.
//!
//! [`UploadCoordinator`] plans a file into chunks, persists the plan to a
//! [`TaskStore`](reelup_task_store::TaskStore), sends chunks through a
//! [`TransportClient`](reelup_transport::TransportClient) with bounded
//! parallelism and retry, and finalizes once every chunk is acknowledged.
//! Progress survives pauses, network loss and process restarts.
//!
//! Chunk transfers can be handed to a [`BackgroundBridge`] such as
//! [`WorkerBridge`], which keeps uploading on its own thread; the
//! coordinator stays the only writer of task state.

mod bridge;
mod config;
mod coordinator;
mod error;
mod events;
mod resolver;
mod retry;
mod sender;
pub mod signals;

#[cfg(test)]
mod testing;

pub use bridge::{BackgroundBridge, BridgeError, DelegatedUpload, ForegroundOnly, WorkerBridge};
pub use config::{RetryConfig, UploaderConfig};
pub use coordinator::{CoordinatorBuilder, UploadCoordinator};
pub use error::UploadError;
pub use events::EventEmitter;
pub use resolver::{PathResolver, SourceResolver};
pub use retry::{RetryError, RetryPolicy};
pub use signals::{NetworkSignals, NetworkState, SignalController};
