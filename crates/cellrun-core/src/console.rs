//! A single long-lived interpreter process serialising submitted code
//! strings onto one busy/idle worker.
//!
//! The interpreter runs as a dedicated child process rather than embedded in
//! this process: this is required so `interrupt()` can signal only the
//! interpreter, and so capturing its output never risks the self-feedback
//! hazard `LogRouter::capture_ambient` refuses. Submissions
//! are framed over the child's stdin as a line-count header followed by
//! that many lines of code; the child's driver script execs each blob
//! against a persistent globals dict and reports completion by writing a
//! sentinel line carrying the return code to both of its streams. This
//! module strips that sentinel back out before anything reaches the router.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::emitter::CellEventEmitter;
use crate::error::{Error, Result};
use crate::router::{LogRouter, StreamKey};
use crate::sink::SocketSink;

const IDLE: i32 = -1;
const BUSY: i32 = 1;

/// Sentinel line the embedded driver script writes to stdout *and* stderr
/// after a submission finishes, carrying the submission's return code.
const DONE_MARKER: &str = "__CELLRUN_SUBMISSION_DONE__";

/// A submission dispatched into the console's inbound queue.
struct Submission {
    cell_id: String,
    channel: String,
    code: String,
}

/// Owns exactly one long-lived interpreter worker.
pub struct InteractiveConsoleRunner {
    sink: Arc<dyn SocketSink>,
    router: Arc<LogRouter>,
    namespace: String,
    interpreter: String,
    busy: Arc<AtomicI32>,
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Submission>>>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    interrupt_pid: Arc<std::sync::Mutex<Option<u32>>>,
}

impl InteractiveConsoleRunner {
    pub fn new(sink: Arc<dyn SocketSink>, router: Arc<LogRouter>, namespace: impl Into<String>, interpreter: impl Into<String>) -> Self {
        Self {
            sink,
            router,
            namespace: namespace.into(),
            interpreter: interpreter.into(),
            busy: Arc::new(AtomicI32::new(IDLE)),
            tx: std::sync::Mutex::new(None),
            worker: std::sync::Mutex::new(None),
            interrupt_pid: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Spawns the worker. Idempotent: a second `start()` is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut tx_guard = self.tx.lock().expect("console tx mutex poisoned");
        if tx_guard.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let handle = tokio::spawn(async move { this.worker_loop(rx).await });

        *tx_guard = Some(tx);
        *self.worker.lock().expect("console worker mutex poisoned") = Some(handle);
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) == BUSY
    }

    /// Enqueues a code submission. Non-blocking; rejects immediately if the
    /// console is already busy or has been shut down.
    pub fn submit(&self, cell_id: impl Into<String>, channel: impl Into<String>, code: impl Into<String>) -> Result<()> {
        if self.is_busy() {
            return Err(Error::ConsoleBusy);
        }

        let tx_guard = self.tx.lock().expect("console tx mutex poisoned");
        let tx = tx_guard.as_ref().ok_or(Error::QueueClosed)?;

        tx.send(Submission {
            cell_id: cell_id.into(),
            channel: channel.into(),
            code: code.into(),
        })
        .map_err(|_| Error::QueueClosed)
    }

    /// Sends an interrupt signal to the worker's child process.
    pub fn interrupt(&self) {
        let pid = *self.interrupt_pid.lock().expect("console pid mutex poisoned");
        if let Some(pid) = pid {
            tracing::info!(pid, "interrupting console worker");
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGINT);
            }
        }
    }

    /// Closes the queue and terminates the worker. Enqueued-but-not-started
    /// submissions are dropped when the receiver is closed.
    pub fn end(&self) {
        *self.tx.lock().expect("console tx mutex poisoned") = None;
        if let Some(handle) = self.worker.lock().expect("console worker mutex poisoned").take() {
            handle.abort();
        }
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Submission>) {
        let mut child = match self.spawn_interpreter().await {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(%err, "failed to spawn interactive console interpreter");
                return;
            }
        };

        let Some(pid) = child.id() else {
            tracing::error!("console interpreter child has no pid immediately after spawn");
            return;
        };
        *self.interrupt_pid.lock().expect("console pid mutex poisoned") = Some(pid);

        let mut stdin = child.stdin.take().expect("console child spawned with piped stdin");
        let mut stdout = BufReader::new(child.stdout.take().expect("console child spawned with piped stdout"));
        let mut stderr = BufReader::new(child.stderr.take().expect("console child spawned with piped stderr"));

        while let Some(submission) = rx.recv().await {
            self.busy.store(BUSY, Ordering::SeqCst);
            let emitter = Arc::new(CellEventEmitter::new(
                self.sink.clone(),
                self.namespace.clone(),
                submission.channel,
                submission.cell_id.clone(),
            ));
            emitter.start();

            let rc = self
                .run_one_submission(&mut stdin, &mut stdout, &mut stderr, &submission.code, &emitter)
                .await;

            emitter.done(rc);
            self.busy.store(IDLE, Ordering::SeqCst);
        }

        *self.interrupt_pid.lock().expect("console pid mutex poisoned") = None;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    async fn run_one_submission(
        &self,
        stdin: &mut (impl tokio::io::AsyncWrite + Unpin),
        stdout: &mut (impl tokio::io::AsyncBufRead + Unpin),
        stderr: &mut (impl tokio::io::AsyncBufRead + Unpin),
        code: &str,
        emitter: &CellEventEmitter,
    ) -> i32 {
        let line_count = code.lines().count().max(1);
        let framed = format!("{line_count}\n{code}\n");
        if stdin.write_all(framed.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            emitter.stderr(&["console interpreter is no longer accepting input".to_string()]);
            return -1;
        }

        let mut rc = 0;
        let mut out_done = false;
        let mut err_done = false;

        while !(out_done && err_done) {
            let mut out_line = String::new();
            let mut err_line = String::new();
            tokio::select! {
                res = stdout.read_line(&mut out_line), if !out_done => {
                    match res {
                        Ok(0) => out_done = true,
                        Ok(_) => match parse_done_marker(out_line.trim_end_matches('\n')) {
                            Some(marker_rc) => { rc = rc.max(marker_rc); out_done = true; }
                            None => self.router.publish(emitter, StreamKey::Out, out_line),
                        },
                        Err(_) => out_done = true,
                    }
                }
                res = stderr.read_line(&mut err_line), if !err_done => {
                    match res {
                        Ok(0) => err_done = true,
                        Ok(_) => match parse_done_marker(err_line.trim_end_matches('\n')) {
                            Some(marker_rc) => { rc = rc.max(marker_rc); err_done = true; }
                            None => self.router.publish(emitter, StreamKey::Err, err_line),
                        },
                        Err(_) => err_done = true,
                    }
                }
            }
        }

        rc
    }

    async fn spawn_interpreter(&self) -> Result<Child> {
        Command::new(&self.interpreter)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::SpawnFailure)
    }
}

fn parse_done_marker(line: &str) -> Option<i32> {
    line.strip_prefix(DONE_MARKER).and_then(|rc| rc.parse().ok())
}

/// Embedded Python driver: reads a line-count header, reads that many lines
/// of code, execs it in a persistent globals dict, and reports completion
/// with a sentinel line on both streams.
const DRIVER_SCRIPT: &str = r#"
import sys, traceback

__cellrun_globals = {"__name__": "__main__"}

def __cellrun_loop():
    while True:
        header = sys.stdin.readline()
        if header == "":
            return
        try:
            n = int(header.strip())
        except ValueError:
            continue
        lines = [sys.stdin.readline() for _ in range(n)]
        code = "".join(lines)
        rc = 0
        try:
            compiled = compile(code, "<cell>", "exec")
            exec(compiled, __cellrun_globals)
        except BaseException:
            traceback.print_exc()
            rc = 1
        marker = "__CELLRUN_SUBMISSION_DONE__%d" % rc
        sys.stdout.write(marker + "\n")
        sys.stdout.flush()
        sys.stderr.write(marker + "\n")
        sys.stderr.flush()

__cellrun_loop()
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TestSocketSink;
    use std::time::Duration;

    fn python_available() -> bool {
        std::process::Command::new("python3").arg("--version").output().is_ok()
    }

    #[tokio::test]
    async fn prints_hello_and_reports_done() {
        if !python_available() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let sink = Arc::new(TestSocketSink::new());
        let router = Arc::new(LogRouter::default());
        let runner = Arc::new(InteractiveConsoleRunner::new(sink.clone(), router, "/cells", "python3"));
        runner.start().unwrap();

        runner.submit("cid", "channel", "print(\"Hello\")").unwrap();

        let found = sink
            .find_event_polling("cell_run_end", &serde_json::json!({"id": "cid", "status": "done"}), "channel", "/cells")
            .await;
        assert!(found, "expected cell_run_end(done) within timeout");

        let output_event = sink
            .events()
            .into_iter()
            .find(|e| e.event == "cell_result" && e.payload.get("output").is_some())
            .expect("expected a cell_result output event");
        assert_eq!(output_event.payload["output"], "Hello\n");

        runner.end();
    }

    #[tokio::test]
    async fn busy_console_rejects_second_submission() {
        if !python_available() {
            eprintln!("skipping: python3 not available");
            return;
        }
        let sink = Arc::new(TestSocketSink::new());
        let router = Arc::new(LogRouter::default());
        let runner = Arc::new(InteractiveConsoleRunner::new(sink.clone(), router, "/cells", "python3"));
        runner.start().unwrap();

        runner.submit("c1", "channel", "import time; time.sleep(0.3)").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = runner.submit("c2", "channel", "print(1)");
        assert!(matches!(result, Err(Error::ConsoleBusy)));

        runner.end();
    }
}
