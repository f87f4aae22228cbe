//! Composition root: builds exactly one of each core component, starts
//! them in dependency order, and tears them down in reverse on shutdown.

use std::sync::Arc;

use cellrun_core::{ForwardingSocketSink, InteractiveConsoleRunner, LogRouter, QueuedProcessExecutorJobLoop, SocketSink, TestSocketSink};

use crate::config::Config;

const NAMESPACE: &str = "/cells";

/// Shared state injected into every HTTP handler.
pub struct AppState {
    pub sink: Arc<dyn SocketSink>,
    pub router: Arc<LogRouter>,
    pub console: Arc<InteractiveConsoleRunner>,
    pub job_loop: Arc<QueuedProcessExecutorJobLoop>,
    pub config: Config,
}

pub struct AppFactory;

impl AppFactory {
    /// Builds the sink from `config.socket_uri` (forwarding sink if set,
    /// in-memory test sink otherwise) and starts the console and job loop.
    pub fn build(config: Config) -> Arc<AppState> {
        let sink: Arc<dyn SocketSink> = match &config.socket_uri {
            Some(uri) => Arc::new(ForwardingSocketSink::new(uri.clone())),
            None => Arc::new(TestSocketSink::new()),
        };
        Self::build_with_sink(config, sink)
    }

    /// Same as [`build`], but with an explicit sink, used by tests that
    /// need to hold onto a `TestSocketSink` for assertions.
    pub fn build_with_sink(config: Config, sink: Arc<dyn SocketSink>) -> Arc<AppState> {
        let router = Arc::new(LogRouter::default());
        let console = Arc::new(InteractiveConsoleRunner::new(sink.clone(), router.clone(), NAMESPACE, config.python.clone()));
        let job_loop = Arc::new(QueuedProcessExecutorJobLoop::new(sink.clone(), router.clone(), NAMESPACE));

        if let Err(err) = console.start() {
            tracing::error!(%err, "failed to start interactive console runner");
        }
        job_loop.start();

        tracing::info!(profile = ?config.profile, host = %config.host, port = config.port, "cellrun app composed");

        Arc::new(AppState { sink, router, console, job_loop, config })
    }

    /// Cancels in-flight work and tears components down in reverse start
    /// order: job loop (kills children), console (terminates interpreter).
    /// The router has nothing to flush once its captures are dropped.
    pub fn shutdown(state: &AppState) {
        tracing::info!("shutting down cellrun app");
        state.job_loop.end();
        state.console.end();
    }
}
