//! Core engine for cellrun: the per-cell execution scheduler and log-routing
//! subsystem that sits behind a notebook front-end.
//!
//! This crate owns the three components the wider system has no other place
//! to put: [`console`]'s long-lived interactive interpreter, [`jobloop`]'s
//! queued subprocess executor, and [`router`]'s stream-to-event multiplexer.
//! Everything else (HTTP routing, configuration loading, the socket
//! transport) is an external collaborator and lives in `cellrun-server`.

pub mod console;
pub mod emitter;
pub mod error;
pub mod jobloop;
pub mod paths;
pub mod router;
pub mod sink;

pub use console::InteractiveConsoleRunner;
pub use emitter::CellEventEmitter;
pub use error::{Error, Result};
pub use jobloop::QueuedProcessExecutorJobLoop;
pub use paths::secure_relative_file_path;
pub use router::{CaptureScope, LogRouter, StreamKey};
pub use sink::{CellStatus, ForwardingSocketSink, RecordedEvent, SocketSink, TestSocketSink};
