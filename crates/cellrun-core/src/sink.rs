//! The abstract destination for cell events.
//!
//! [`SocketSink`] is the single seam between the execution core and the
//! transport that actually gets an event in front of a notebook front-end.
//! The core never depends on a concrete transport; it only ever holds
//! `Arc<dyn SocketSink>`. Two concrete shapes exist: [`ForwardingSocketSink`]
//! (posts to an upstream socket-transport server) and [`TestSocketSink`] (an
//! in-memory recorder for assertions).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

/// Terminal/initial status strings carried by `cell_run_start`/`cell_run_end`
/// payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Busy,
    Done,
    Error,
}

impl CellStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CellStatus::Busy => "busy",
            CellStatus::Done => "done",
            CellStatus::Error => "error",
        }
    }
}

/// Injected capability for delivering cell events to a notebook front-end.
///
/// Contract: `emit` is non-blocking from the caller's perspective (it may
/// buffer internally) and delivery is best-effort (no failure is surfaced
/// to the caller, only logged). Implementations that deliver out-of-process
/// must preserve per-`(room, namespace, cell_id)` ordering, since the three
/// events of one execution must arrive in the order they were emitted.
pub trait SocketSink: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: &str, payload: Value, room: &str, namespace: &str);

    /// Whether this sink's own delivery mechanism writes to the ambient
    /// process stdout. `LogRouter::capture_ambient` refuses to run when this
    /// is true and the capture would be in the same process, since it would
    /// feed the sink's own output back into itself.
    fn writes_to_stdout(&self) -> bool {
        false
    }
}

struct OutboundEvent {
    event: String,
    payload: Value,
    room: String,
    namespace: String,
}

/// Posts events to an upstream socket-transport server (a small sidecar that
/// actually speaks the socket protocol to connected front-ends).
///
/// Events are handed to a single background task over an unbounded channel,
/// so `emit` never blocks the caller and deliveries happen strictly in the
/// order they were submitted, which satisfies the per-cell ordering
/// contract without any sink-side bookkeeping.
#[derive(Debug, Clone)]
pub struct ForwardingSocketSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ForwardingSocketSink {
    /// `base_url` is the upstream endpoint that accepts
    /// `POST {event, payload, room, namespace}`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundEvent>();
        let client = reqwest::Client::new();

        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let body = serde_json::json!({
                    "event": ev.event,
                    "payload": ev.payload,
                    "room": ev.room,
                    "namespace": ev.namespace,
                });
                if let Err(err) = client.post(&base_url).json(&body).send().await {
                    tracing::warn!(event = %ev.event, room = %ev.room, %err, "socket sink delivery failed");
                }
            }
        });

        Self { tx }
    }
}

impl SocketSink for ForwardingSocketSink {
    fn emit(&self, event: &str, payload: Value, room: &str, namespace: &str) {
        let sent = self.tx.send(OutboundEvent {
            event: event.to_string(),
            payload,
            room: room.to_string(),
            namespace: namespace.to_string(),
        });
        if sent.is_err() {
            tracing::warn!(event, "socket sink delivery task has shut down; event dropped");
        }
    }
}

/// One recorded `emit` call, as seen by [`TestSocketSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub event: String,
    pub payload: Value,
    pub room: String,
    pub namespace: String,
}

/// In-memory sink for tests: records every emitted event and exposes
/// `find_event` for exact-match assertions.
#[derive(Debug, Clone, Default)]
pub struct TestSocketSink {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl TestSocketSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("test sink mutex poisoned").clone()
    }

    /// Exact-match lookup over everything recorded so far.
    pub fn find_event(&self, event: &str, payload: &Value, room: &str, namespace: &str) -> bool {
        self.events.lock().expect("test sink mutex poisoned").iter().any(|e| {
            e.event == event && &e.payload == payload && e.room == room && e.namespace == namespace
        })
    }

    /// Polls `find_event` up to five times at a 500ms interval (2.5s total)
    /// before giving up, for assertions racing an async worker.
    pub async fn find_event_polling(
        &self,
        event: &str,
        payload: &Value,
        room: &str,
        namespace: &str,
    ) -> bool {
        for attempt in 0..5 {
            if self.find_event(event, payload, room, namespace) {
                return true;
            }
            if attempt < 4 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
        false
    }
}

impl SocketSink for TestSocketSink {
    fn emit(&self, event: &str, payload: Value, room: &str, namespace: &str) {
        self.events.lock().expect("test sink mutex poisoned").push(RecordedEvent {
            event: event.to_string(),
            payload,
            room: room.to_string(),
            namespace: namespace.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sink_records_and_finds_exact_match() {
        let sink = TestSocketSink::new();
        sink.emit("cell_run_start", json!({"id": "c1", "status": "busy"}), "chan", "/cells");

        assert!(sink.find_event("cell_run_start", &json!({"id": "c1", "status": "busy"}), "chan", "/cells"));
        assert!(!sink.find_event("cell_run_start", &json!({"id": "c2", "status": "busy"}), "chan", "/cells"));
    }

    #[tokio::test]
    async fn find_event_polling_observes_late_arrival() {
        let sink = TestSocketSink::new();
        let sink2 = sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sink2.emit("cell_run_end", json!({"id": "c1", "status": "done"}), "chan", "/cells");
        });

        let found = sink
            .find_event_polling("cell_run_end", &json!({"id": "c1", "status": "done"}), "chan", "/cells")
            .await;
        assert!(found);
    }

    #[tokio::test]
    async fn find_event_polling_times_out_absent_event() {
        let sink = TestSocketSink::new();
        let found = sink
            .find_event_polling("cell_run_end", &json!({"id": "missing"}), "chan", "/cells")
            .await;
        assert!(!found);
    }

    #[tokio::test]
    async fn forwarding_sink_posts_the_expected_envelope() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/events")
                    .json_body(json!({
                        "event": "cell_run_start",
                        "payload": {"id": "cid", "status": "busy"},
                        "room": "channel",
                        "namespace": "/cells",
                    }));
                then.status(200);
            })
            .await;

        let sink = ForwardingSocketSink::new(server.url("/events"));
        sink.emit("cell_run_start", json!({"id": "cid", "status": "busy"}), "channel", "/cells");

        for _ in 0..10 {
            if mock.hits_async().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        mock.assert_async().await;
    }
}
