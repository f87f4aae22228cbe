//! Multiplexes process and in-process streams into per-cell, per-key events.
//!
//! [`LogRouter`] is the only place lines of child-process or ambient output
//! turn into [`CellEventEmitter`] calls. It never owns the streams it reads
//! from; callers (the console runner, the job loop) keep ownership and are
//! responsible for closing them.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::emitter::CellEventEmitter;
use crate::error::{Error, Result};
use crate::sink::SocketSink;

/// Which of a cell's two streams a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKey {
    Out,
    Err,
}

/// Routes stream lines to an emitter, with per-key FIFO ordering.
///
/// `logging_interval == Duration::ZERO` (the default) delivers each line as
/// its own batch immediately. A nonzero interval accumulates lines and
/// flushes on whichever comes first: the interval elapsing or EOF.
#[derive(Debug, Clone)]
pub struct LogRouter {
    logging_interval: Duration,
}

impl Default for LogRouter {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl LogRouter {
    pub fn new(logging_interval: Duration) -> Self {
        Self { logging_interval }
    }

    /// Starts two concurrent readers over already-open streams (typically a
    /// child process's stdout/stderr pipes) and returns a scope handle.
    pub fn capture<Out, Err>(&self, emitter: Arc<CellEventEmitter>, stdout: Out, stderr: Err) -> CaptureScope
    where
        Out: AsyncRead + Unpin + Send + 'static,
        Err: AsyncRead + Unpin + Send + 'static,
    {
        let interval = self.logging_interval;

        let out_emitter = emitter.clone();
        let stdout_task = tokio::spawn(async move {
            pump_async(stdout, StreamKey::Out, out_emitter, interval).await;
        });

        let err_emitter = emitter;
        let stderr_task = tokio::spawn(async move {
            pump_async(stderr, StreamKey::Err, err_emitter, interval).await;
        });

        CaptureScope {
            stdout_task: Some(stdout_task),
            stderr_task: Some(stderr_task),
        }
    }

    /// Direct injection for components that already have per-line data
    /// (e.g. a line assembled from a framed IPC message).
    pub fn publish(&self, emitter: &CellEventEmitter, key: StreamKey, line: String) {
        emit_batch(emitter, key, &[line]);
    }

    /// Replaces the ambient process stdout/stderr for the scope's duration
    /// with pipe writers wired into this router, restoring the originals on
    /// drop. Refused when `sink.writes_to_stdout()` is true, since capturing
    /// the sink's own output back into itself would feed forever.
    ///
    /// Batching note: unlike [`LogRouter::capture`], the ambient path reads
    /// on a dedicated blocking thread (there is no async handle for a raw
    /// ambient fd) and always flushes per line; `logging_interval` is
    /// honored only by `capture`.
    #[cfg(unix)]
    pub fn capture_ambient(&self, emitter: Arc<CellEventEmitter>, sink: &dyn SocketSink) -> Result<AmbientCaptureScope> {
        use std::io::Write;
        use std::os::fd::FromRawFd;

        if sink.writes_to_stdout() {
            return Err(Error::AmbientFeedback);
        }

        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        unsafe {
            let saved_stdout = libc::dup(1);
            let saved_stderr = libc::dup(2);
            if saved_stdout < 0 || saved_stderr < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }

            let mut out_fds = [0i32; 2];
            let mut err_fds = [0i32; 2];
            if libc::pipe(out_fds.as_mut_ptr()) != 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            if libc::pipe(err_fds.as_mut_ptr()) != 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }

            libc::dup2(out_fds[1], 1);
            libc::dup2(err_fds[1], 2);
            libc::close(out_fds[1]);
            libc::close(err_fds[1]);

            let out_reader = std::fs::File::from_raw_fd(out_fds[0]);
            let err_reader = std::fs::File::from_raw_fd(err_fds[0]);

            let out_emitter = emitter.clone();
            let stdout_thread = std::thread::spawn(move || pump_blocking(out_reader, StreamKey::Out, out_emitter));
            let err_emitter = emitter;
            let stderr_thread = std::thread::spawn(move || pump_blocking(err_reader, StreamKey::Err, err_emitter));

            Ok(AmbientCaptureScope {
                saved_stdout,
                saved_stderr,
                stdout_thread: Some(stdout_thread),
                stderr_thread: Some(stderr_thread),
            })
        }
    }
}

fn emit_batch(emitter: &CellEventEmitter, key: StreamKey, lines: &[String]) {
    match key {
        StreamKey::Out => emitter.stdout(lines),
        StreamKey::Err => emitter.stderr(lines),
    }
}

/// Reads one line at a time, preserving the trailing `\n` (or `\r\n`) on
/// every line but the last if the stream ends without one, matching the
/// source's raw-bytes accumulation rather than trimming line terminators.
async fn pump_async<R: AsyncRead + Unpin>(reader: R, key: StreamKey, emitter: Arc<CellEventEmitter>, interval: Duration) {
    let mut reader = BufReader::new(reader);
    let mut batch: Vec<String> = Vec::new();

    loop {
        if interval.is_zero() {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => emit_batch(&emitter, key, std::slice::from_ref(&line)),
                Err(err) => {
                    tracing::warn!(cell_id = emitter.cell_id(), ?key, %err, "log reader terminated on read error");
                    break;
                }
            }
            continue;
        }

        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);
        let mut line = String::new();
        tokio::select! {
            res = reader.read_line(&mut line) => match res {
                Ok(0) => {
                    if !batch.is_empty() {
                        emit_batch(&emitter, key, &batch);
                        batch.clear();
                    }
                    break;
                }
                Ok(_) => batch.push(line),
                Err(err) => {
                    tracing::warn!(cell_id = emitter.cell_id(), ?key, %err, "log reader terminated on read error");
                    break;
                }
            },
            _ = &mut sleep => {
                if !batch.is_empty() {
                    emit_batch(&emitter, key, &batch);
                    batch.clear();
                }
            }
        }
    }

    if !batch.is_empty() {
        emit_batch(&emitter, key, &batch);
    }
}

#[cfg(unix)]
fn pump_blocking(reader: std::fs::File, key: StreamKey, emitter: Arc<CellEventEmitter>) {
    use std::io::{BufRead, BufReader};
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => emit_batch(&emitter, key, std::slice::from_ref(&line)),
            Err(err) => {
                tracing::warn!(cell_id = emitter.cell_id(), ?key, %err, "ambient log reader terminated on read error");
                break;
            }
        }
    }
}

/// Handle to a pair of concurrent stream readers started by
/// [`LogRouter::capture`].
#[derive(Debug)]
pub struct CaptureScope {
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl CaptureScope {
    /// Awaits both readers to EOF and flushes any partial buffered data.
    pub async fn finish(mut self) {
        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CaptureScope {
    fn drop(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Handle returned by [`LogRouter::capture_ambient`]; restores the original
/// stdout/stderr file descriptors on drop.
#[cfg(unix)]
#[derive(Debug)]
pub struct AmbientCaptureScope {
    saved_stdout: i32,
    saved_stderr: i32,
    stdout_thread: Option<std::thread::JoinHandle<()>>,
    stderr_thread: Option<std::thread::JoinHandle<()>>,
}

#[cfg(unix)]
impl Drop for AmbientCaptureScope {
    fn drop(&mut self) {
        unsafe {
            libc::dup2(self.saved_stdout, 1);
            libc::dup2(self.saved_stderr, 2);
            libc::close(self.saved_stdout);
            libc::close(self.saved_stderr);
        }
        if let Some(t) = self.stdout_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.stderr_thread.take() {
            let _ = t.join();
        }
    }
}
