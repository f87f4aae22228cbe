//! Thin adapter binding a [`SocketSink`] to a fixed
//! `(namespace, room, cell_id)` triple and exposing the cell event
//! vocabulary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;

use crate::sink::{CellStatus, SocketSink};

/// Emits the three canonical cell events (`cell_run_start`, `cell_result`,
/// `cell_run_end`) for one execution.
///
/// Invariant: `start` is emitted exactly once before any `stdout`/`stderr`/
/// `done`, and `done` is emitted exactly once as the last event.
/// Re-emission is a programming error in the core itself (never triggered by
/// untrusted input): it panics in debug builds and is silently ignored in
/// release builds.
#[derive(Debug)]
pub struct CellEventEmitter {
    sink: Arc<dyn SocketSink>,
    namespace: String,
    room: String,
    cell_id: String,
    started: AtomicBool,
    done: AtomicBool,
    /// Absolute path prefix stripped from output/error text before it
    /// reaches the sink (file-run submissions strip the file root so a
    /// traceback never leaks the server's absolute directory layout).
    strip_prefix: Option<String>,
}

impl CellEventEmitter {
    pub fn new(sink: Arc<dyn SocketSink>, namespace: impl Into<String>, room: impl Into<String>, cell_id: impl Into<String>) -> Self {
        Self {
            sink,
            namespace: namespace.into(),
            room: room.into(),
            cell_id: cell_id.into(),
            started: AtomicBool::new(false),
            done: AtomicBool::new(false),
            strip_prefix: None,
        }
    }

    /// Configures a path prefix to strip from every emitted output/error
    /// line. Builder-style: call before wrapping the emitter in an `Arc`.
    pub fn with_stripped_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Concatenates `lines` (each already carrying its own line terminator,
    /// if any) and strips `strip_prefix` if configured.
    fn clean(&self, lines: &[String]) -> String {
        let joined = lines.concat();
        match &self.strip_prefix {
            Some(prefix) => joined.replace(prefix.as_str(), ""),
            None => joined,
        }
    }

    pub fn start(&self) {
        let already = self.started.swap(true, Ordering::SeqCst);
        debug_assert!(!already, "cell_run_start emitted twice for cell {}", self.cell_id);
        if already {
            return;
        }
        self.sink.emit(
            "cell_run_start",
            json!({"id": self.cell_id, "status": CellStatus::Busy.as_str()}),
            &self.room,
            &self.namespace,
        );
    }

    pub fn stdout(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        self.sink.emit(
            "cell_result",
            json!({"id": self.cell_id, "output": self.clean(lines)}),
            &self.room,
            &self.namespace,
        );
    }

    pub fn stderr(&self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        self.sink.emit(
            "cell_result",
            json!({"id": self.cell_id, "error": self.clean(lines)}),
            &self.room,
            &self.namespace,
        );
    }

    pub fn done(&self, rc: i32) {
        let already = self.done.swap(true, Ordering::SeqCst);
        debug_assert!(!already, "cell_run_end emitted twice for cell {}", self.cell_id);
        if already {
            return;
        }
        let status = if rc == 0 { CellStatus::Done } else { CellStatus::Error };
        self.sink.emit(
            "cell_run_end",
            json!({"id": self.cell_id, "status": status.as_str()}),
            &self.room,
            &self.namespace,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TestSocketSink;
    use serde_json::json;

    #[test]
    fn emits_start_result_end_in_order() {
        let sink = Arc::new(TestSocketSink::new());
        let emitter = CellEventEmitter::new(sink.clone(), "/cells", "channel", "cid");

        emitter.start();
        emitter.stdout(&["Hello".to_string()]);
        emitter.done(0);

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, "cell_run_start");
        assert_eq!(events[0].payload, json!({"id": "cid", "status": "busy"}));
        assert_eq!(events[1].event, "cell_result");
        assert_eq!(events[1].payload, json!({"id": "cid", "output": "Hello"}));
        assert_eq!(events[2].event, "cell_run_end");
        assert_eq!(events[2].payload, json!({"id": "cid", "status": "done"}));
    }

    #[test]
    fn nonzero_rc_reports_error_status() {
        let sink = Arc::new(TestSocketSink::new());
        let emitter = CellEventEmitter::new(sink.clone(), "/cells", "channel", "cid");
        emitter.start();
        emitter.done(1);

        let events = sink.events();
        assert_eq!(events[1].payload, json!({"id": "cid", "status": "error"}));
    }

    #[test]
    fn empty_batches_do_not_emit() {
        let sink = Arc::new(TestSocketSink::new());
        let emitter = CellEventEmitter::new(sink.clone(), "/cells", "channel", "cid");
        emitter.start();
        emitter.stdout(&[]);
        emitter.stderr(&[]);
        emitter.done(0);

        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn stripped_prefix_removes_file_root_from_output() {
        let sink = Arc::new(TestSocketSink::new());
        let emitter = CellEventEmitter::new(sink.clone(), "/cells", "channel", "cid").with_stripped_prefix("/srv/cellrun/files/");
        emitter.start();
        emitter.stderr(&["Traceback in /srv/cellrun/files/modules/test.py, line 2\n".to_string()]);
        emitter.done(1);

        let events = sink.events();
        assert_eq!(events[1].payload["error"], "Traceback in modules/test.py, line 2\n");
    }

    #[test]
    fn repeated_done_is_a_programming_error() {
        let sink = Arc::new(TestSocketSink::new());
        let emitter = CellEventEmitter::new(sink.clone(), "/cells", "channel", "cid");
        emitter.start();
        emitter.done(0);

        // Debug builds fail loudly on re-emission rather than silently
        // double-emitting `cell_run_end`.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| emitter.done(0)));
        assert!(result.is_err());
        assert_eq!(sink.events().len(), 2);
    }
}
