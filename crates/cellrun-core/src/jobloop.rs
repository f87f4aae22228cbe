//! Owns a set of child processes indexed by cell id, with lifecycle control
//! (submit, interrupt, kill, wait).
//!
//! The status map collapses what the Python original modelled as a cyclic
//! `ProcessRegistryObject ↔ ProcessRegistry` back-reference into a plain
//! lookup: the job loop owns a `HashMap<cell_id, pid>` keyed by cell id, and
//! each per-submission worker only ever borrows its own entry.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;

use crate::emitter::CellEventEmitter;
use crate::error::{Error, Result};
use crate::router::LogRouter;
use crate::sink::SocketSink;

const IDLE: i64 = -1;

struct SubmitRequest {
    cell_id: String,
    channel: String,
    argv: Vec<String>,
    env: HashMap<String, String>,
    strip_prefix: Option<String>,
}

/// `{cell_id, pid, state}` entries, created on first submission and never
/// removed: a terminated cell becomes idle (`pid = -1`) rather than being
/// dropped from the map.
type StatusMap = Arc<Mutex<HashMap<String, i64>>>;

/// Queued subprocess executor enforcing at-most-one live process per cell.
pub struct QueuedProcessExecutorJobLoop {
    sink: Arc<dyn SocketSink>,
    router: Arc<LogRouter>,
    namespace: String,
    status: StatusMap,
    tx: Mutex<Option<mpsc::UnboundedSender<SubmitRequest>>>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueuedProcessExecutorJobLoop {
    pub fn new(sink: Arc<dyn SocketSink>, router: Arc<LogRouter>, namespace: impl Into<String>) -> Self {
        Self {
            sink,
            router,
            namespace: namespace.into(),
            status: Arc::new(Mutex::new(HashMap::new())),
            tx: Mutex::new(None),
            dispatcher: Mutex::new(None),
        }
    }

    /// Starts the dispatcher. Safe to call once; a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tx_guard = self.tx.lock().expect("jobloop tx mutex poisoned");
        if tx_guard.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<SubmitRequest>();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let worker = this.clone();
                tokio::spawn(async move { worker.run_submission(req).await });
            }
        });

        *tx_guard = Some(tx);
        *self.dispatcher.lock().expect("jobloop dispatcher mutex poisoned") = Some(handle);
    }

    /// Enqueues `(cell_id, argv, env)`. Non-blocking; the dispatcher never
    /// blocks on worker completion.
    pub fn submit(&self, cell_id: impl Into<String>, channel: impl Into<String>, argv: Vec<String>, env: HashMap<String, String>) -> Result<()> {
        self.submit_with_stripped_prefix(cell_id, channel, argv, env, None)
    }

    /// Same as [`submit`](Self::submit), but every output/error line has
    /// `strip_prefix` removed before it reaches the sink, used by file-run
    /// submissions so a traceback never leaks the server's file root.
    pub fn submit_with_stripped_prefix(
        &self,
        cell_id: impl Into<String>,
        channel: impl Into<String>,
        argv: Vec<String>,
        env: HashMap<String, String>,
        strip_prefix: Option<String>,
    ) -> Result<()> {
        let tx_guard = self.tx.lock().expect("jobloop tx mutex poisoned");
        let tx = tx_guard.as_ref().ok_or(Error::QueueClosed)?;
        tx.send(SubmitRequest {
            cell_id: cell_id.into(),
            channel: channel.into(),
            argv,
            env,
            strip_prefix,
        })
        .map_err(|_| Error::QueueClosed)
    }

    /// Sends an interrupt signal if the cell has a running pid; no-op
    /// otherwise.
    pub fn interrupt(&self, cell_id: &str) {
        if let Some(pid) = self.running_pid(cell_id) {
            tracing::info!(cell_id, pid, "interrupting cell process");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid, libc::SIGINT);
            }
        }
    }

    /// Kills the cell's process and all of its descendants; no-op if idle.
    pub fn kill(&self, cell_id: &str) {
        if let Some(pid) = self.running_pid(cell_id) {
            tracing::info!(cell_id, pid, "killing cell process tree");
            kill_tree(pid);
        }
    }

    /// Kills any still-running children, stops the dispatcher, closes the
    /// queue. Does not hang: descendants are force-killed, not waited on.
    pub fn end(&self) {
        *self.tx.lock().expect("jobloop tx mutex poisoned") = None;

        let pids: Vec<i32> = self
            .status
            .lock()
            .expect("jobloop status mutex poisoned")
            .values()
            .filter(|&&pid| pid != IDLE)
            .map(|&pid| pid as i32)
            .collect();
        for pid in pids {
            kill_tree(pid);
        }

        if let Some(handle) = self.dispatcher.lock().expect("jobloop dispatcher mutex poisoned").take() {
            handle.abort();
        }
    }

    fn running_pid(&self, cell_id: &str) -> Option<i32> {
        self.status
            .lock()
            .expect("jobloop status mutex poisoned")
            .get(cell_id)
            .copied()
            .filter(|&pid| pid != IDLE)
            .map(|pid| pid as i32)
    }

    async fn run_submission(self: Arc<Self>, req: SubmitRequest) {
        let mut emitter = CellEventEmitter::new(self.sink.clone(), self.namespace.clone(), req.channel, req.cell_id.clone());
        if let Some(prefix) = req.strip_prefix.clone() {
            emitter = emitter.with_stripped_prefix(prefix);
        }

        {
            let mut status = self.status.lock().expect("jobloop status mutex poisoned");
            let current = status.get(&req.cell_id).copied().unwrap_or(IDLE);
            if current != IDLE {
                // Refuse without spawning: publish a raw err record (no
                // start/end, since nothing was ever attempted).
                emitter.stderr(&[format!("cell {} already busy with pid {}", req.cell_id, current)]);
                return;
            }
        }

        emitter.start();

        let Some((program, rest)) = req.argv.split_first() else {
            emitter.stderr(&["empty argv".to_string()]);
            emitter.done(-1);
            return;
        };

        let mut command = Command::new(program);
        command.args(rest).envs(&req.env).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(cell_id = req.cell_id, %err, "failed to spawn cell process");
                emitter.stderr(&[format!("failed to start process: {err}")]);
                emitter.done(-1);
                return;
            }
        };

        let pid = child.id().unwrap_or(0) as i64;
        self.status.lock().expect("jobloop status mutex poisoned").insert(req.cell_id.clone(), pid);

        let emitter = Arc::new(emitter);
        let stdout = child.stdout.take().expect("cell child spawned with piped stdout");
        let stderr = child.stderr.take().expect("cell child spawned with piped stderr");
        let scope = self.router.capture(emitter.clone(), stdout, stderr);

        let rc = match child.wait().await {
            Ok(status) => exit_code(&status),
            Err(err) => {
                tracing::warn!(cell_id = req.cell_id, %err, "error waiting on cell process");
                emitter.stderr(&[format!("error waiting on process: {err}")]);
                -1
            }
        };

        scope.finish().await;
        emitter.done(rc);

        if child.try_wait().ok().flatten().is_none() {
            let _ = child.start_kill();
        }
        self.status.lock().expect("jobloop status mutex poisoned").insert(req.cell_id, IDLE);
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Kills `pid` and all of its descendants. Descendants are enumerated
/// (rather than relying on process-group semantics, which would miss a
/// child that re-parented into its own session) by walking `/proc` on
/// Linux; a no-op with a warning on platforms without procfs.
#[cfg(target_os = "linux")]
fn kill_tree(pid: i32) {
    for child in proc_children(pid) {
        kill_tree(child);
    }
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(target_os = "linux")]
fn proc_children(pid: i32) -> Vec<i32> {
    let mut out = Vec::new();
    let task_dir = format!("/proc/{pid}/task");
    let Ok(entries) = std::fs::read_dir(&task_dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let children_path = entry.path().join("children");
        if let Ok(contents) = std::fs::read_to_string(&children_path) {
            for tok in contents.split_whitespace() {
                if let Ok(child_pid) = tok.parse::<i32>() {
                    out.push(child_pid);
                }
            }
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
fn kill_tree(pid: i32) {
    tracing::warn!(pid, "descendant process enumeration is only implemented on Linux; killing root pid only");
    #[cfg(unix)]
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

/// Grace window `end()` allows a descendant tree to exit cleanly before the
/// caller should consider it leaked. Not currently awaited internally (kill
/// is SIGKILL and immediate); exposed for callers that want to poll.
pub const KILL_GRACE_WINDOW: Duration = Duration::from_secs(2);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TestSocketSink;
    use serde_json::json;

    fn new_loop() -> (Arc<QueuedProcessExecutorJobLoop>, Arc<TestSocketSink>) {
        let sink = Arc::new(TestSocketSink::new());
        let router = Arc::new(LogRouter::default());
        let job_loop = Arc::new(QueuedProcessExecutorJobLoop::new(sink.clone(), router, "/cells"));
        job_loop.start();
        (job_loop, sink)
    }

    #[tokio::test]
    async fn shell_echo_reports_start_result_end() {
        let (job_loop, sink) = new_loop();
        job_loop
            .submit("shcid", "channel", vec!["/bin/bash".into(), "-c".into(), "echo Hello".into()], HashMap::new())
            .unwrap();

        let found = sink
            .find_event_polling("cell_run_end", &json!({"id": "shcid", "status": "done"}), "channel", "/cells")
            .await;
        assert!(found);

        assert!(sink.find_event("cell_run_start", &json!({"id": "shcid", "status": "busy"}), "channel", "/cells"));
        assert!(sink.find_event("cell_result", &json!({"id": "shcid", "output": "Hello\n"}), "channel", "/cells"));

        job_loop.end();
    }

    #[tokio::test]
    async fn unknown_command_reports_stderr_and_error_status() {
        let (job_loop, sink) = new_loop();
        job_loop
            .submit("shcid2", "channel", vec!["/bin/bash".into(), "-c".into(), "lsx".into()], HashMap::new())
            .unwrap();

        let found = sink
            .find_event_polling("cell_run_end", &json!({"id": "shcid2", "status": "error"}), "channel", "/cells")
            .await;
        assert!(found);

        let has_err = sink.events().into_iter().any(|e| {
            e.event == "cell_result" && e.payload.get("error").map(|v| v.as_str().unwrap_or("").contains("lsx")).unwrap_or(false)
        });
        assert!(has_err);

        job_loop.end();
    }

    #[tokio::test]
    async fn stripped_prefix_removes_cwd_from_shell_output() {
        let (job_loop, sink) = new_loop();
        let cwd = std::env::current_dir().unwrap().display().to_string();
        job_loop
            .submit_with_stripped_prefix(
                "cwdcid",
                "channel",
                vec!["/bin/bash".into(), "-c".into(), "pwd".into()],
                HashMap::new(),
                Some(format!("{cwd}/")),
            )
            .unwrap();

        let found = sink
            .find_event_polling("cell_run_end", &json!({"id": "cwdcid", "status": "done"}), "channel", "/cells")
            .await;
        assert!(found);

        let has_stripped = sink.events().into_iter().any(|e| {
            e.event == "cell_result" && e.payload.get("output").map(|v| !v.as_str().unwrap_or("").contains(&cwd)).unwrap_or(false)
        });
        assert!(has_stripped);

        job_loop.end();
    }

    #[tokio::test]
    async fn second_submission_to_busy_cell_is_rejected() {
        let (job_loop, sink) = new_loop();
        job_loop
            .submit("busy1", "channel", vec!["/bin/bash".into(), "-c".into(), "sleep 0.3".into()], HashMap::new())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        job_loop
            .submit("busy1", "channel", vec!["/bin/bash".into(), "-c".into(), "echo should-not-run".into()], HashMap::new())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let has_busy_err = sink.events().into_iter().any(|e| {
            e.event == "cell_result" && e.payload.get("error").map(|v| v.as_str().unwrap_or("").contains("already busy")).unwrap_or(false)
        });
        assert!(has_busy_err);

        job_loop.end();
    }
}
