//! Error types for cellrun-core.

use thiserror::Error;

/// Result type for cellrun-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the execution core.
#[derive(Debug, Error)]
pub enum Error {
    /// The interactive console already has a submission in flight.
    #[error("console busy")]
    ConsoleBusy,

    /// The component's inbound queue has been closed (via `end()`).
    #[error("submission queue closed")]
    QueueClosed,

    /// Spawning a child process failed.
    #[error("failed to spawn process: {0}")]
    SpawnFailure(#[source] std::io::Error),

    /// `capture_ambient` was requested but would create a feedback loop
    /// (the sink itself writes to the ambient stdout being captured).
    #[error("ambient capture refused: sink writes to stdout, would self-feed")]
    AmbientFeedback,

    /// Generic IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal failure the component cannot recover from; logged and the
    /// owning component shuts down.
    #[error("fatal internal error: {0}")]
    FatalInternal(String),
}
