//! SSE + WebSocket transport fan-out (spec Section 4.3).
//!
//! A `TransportManager` connects per-execution adapters at run start and
//! disconnects them at run end, forwarding each emitted `AgUiEvent` to every
//! registered sink for that execution and mirroring it into the `EventBuffer`
//! for late-join replay. Grounded in the teacher's axum SSE handler shape
//! (`server.rs`), extended with a WebSocket sink since the teacher's poll-based
//! SSE has no equivalent.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use weave_core::{AgUiEvent, Id};

use crate::eventbus::EventBuffer;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("sink channel closed")]
    SinkClosed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A registered fan-out destination for one client connection.
struct Sink {
    client_id: String,
    sender: mpsc::UnboundedSender<AgUiEvent>,
}

/// Fans out events to SSE and WebSocket clients, keyed by execution id, and
/// mirrors every event into the shared `EventBuffer`.
pub struct TransportManager {
    buffer: Arc<EventBuffer>,
    /// Sinks subscribed to a specific execution's events.
    run_sinks: Mutex<HashMap<Id, Vec<Sink>>>,
    /// Sinks subscribed to the global broadcast stream (no execution filter).
    global_sinks: Mutex<Vec<Sink>>,
}

impl TransportManager {
    pub fn new(buffer: Arc<EventBuffer>) -> Self {
        Self {
            buffer,
            run_sinks: Mutex::new(HashMap::new()),
            global_sinks: Mutex::new(Vec::new()),
        }
    }

    /// Register a new connection. If `execution_id` is given, the caller first
    /// receives a replay of buffered events for that execution (from
    /// `resume_from`, default 0), then new events as they arrive.
    pub async fn handle_connection(
        &self,
        client_id: String,
        execution_id: Option<Id>,
        resume_from: Option<u64>,
    ) -> mpsc::UnboundedReceiver<AgUiEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(ref run_id) = execution_id {
            for seq_event in self.buffer.get_events(run_id, resume_from).await {
                // Replay is best-effort: a receiver that's already gone just drops it.
                let _ = tx.send(seq_event.event);
            }
            self.run_sinks
                .lock()
                .await
                .entry(run_id.clone())
                .or_default()
                .push(Sink { client_id, sender: tx });
        } else {
            self.global_sinks.lock().await.push(Sink { client_id, sender: tx });
        }

        rx
    }

    /// Remove all sinks registered under `client_id`.
    pub async fn disconnect(&self, client_id: &str) {
        let mut run_sinks = self.run_sinks.lock().await;
        for sinks in run_sinks.values_mut() {
            sinks.retain(|s| s.client_id != client_id);
        }
        run_sinks.retain(|_, sinks| !sinks.is_empty());
        drop(run_sinks);

        self.global_sinks.lock().await.retain(|s| s.client_id != client_id);
    }

    /// Broadcast to every globally-registered sink (best-effort; failed sinks removed).
    pub async fn broadcast(&self, event: AgUiEvent) {
        let mut sinks = self.global_sinks.lock().await;
        sinks.retain(|sink| sink.sender.send(event.clone()).is_ok());
    }

    /// Emit an event scoped to one execution: mirrors into the buffer, then
    /// fans out to every sink subscribed to that execution.
    pub async fn broadcast_to_run(&self, execution_id: &Id, event: AgUiEvent) {
        self.buffer.add_event(execution_id, event.clone()).await;

        let mut run_sinks = self.run_sinks.lock().await;
        if let Some(sinks) = run_sinks.get_mut(execution_id) {
            sinks.retain(|sink| sink.sender.send(event.clone()).is_ok());
        }
    }

    /// Terminate all sinks. Idempotent.
    pub async fn shutdown(&self) {
        self.run_sinks.lock().await.clear();
        self.global_sinks.lock().await.clear();
    }

    /// Count of currently attached sinks for an execution (for tests/metrics).
    pub async fn sink_count(&self, execution_id: &Id) -> usize {
        self.run_sinks
            .lock()
            .await
            .get(execution_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::{DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC};
    use weave_core::AgUiEventType;

    fn make_event(run_id: &Id) -> AgUiEvent {
        AgUiEvent::new(AgUiEventType::RunStarted, run_id.clone(), 0)
    }

    fn manager() -> TransportManager {
        TransportManager::new(Arc::new(EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC)))
    }

    #[tokio::test]
    async fn broadcast_to_run_delivers_to_subscribed_sink() {
        let mgr = manager();
        let run_id = Id::new();
        let mut rx = mgr
            .handle_connection("c1".into(), Some(run_id.clone()), None)
            .await;

        mgr.broadcast_to_run(&run_id, make_event(&run_id)).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.run_id, run_id);
    }

    #[tokio::test]
    async fn late_join_replays_buffered_events_in_order() {
        let mgr = manager();
        let run_id = Id::new();

        mgr.broadcast_to_run(&run_id, make_event(&run_id)).await;
        mgr.broadcast_to_run(&run_id, make_event(&run_id)).await;

        let mut rx = mgr
            .handle_connection("late".into(), Some(run_id.clone()), None)
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.run_id, run_id);
        assert_eq!(second.run_id, run_id);
    }

    #[tokio::test]
    async fn disconnect_removes_sink() {
        let mgr = manager();
        let run_id = Id::new();
        let _rx = mgr
            .handle_connection("c1".into(), Some(run_id.clone()), None)
            .await;
        assert_eq!(mgr.sink_count(&run_id).await, 1);

        mgr.disconnect("c1").await;
        assert_eq!(mgr.sink_count(&run_id).await, 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_send() {
        let mgr = manager();
        let run_id = Id::new();
        {
            let _rx = mgr
                .handle_connection("c1".into(), Some(run_id.clone()), None)
                .await;
            // rx dropped here
        }
        mgr.broadcast_to_run(&run_id, make_event(&run_id)).await;
        assert_eq!(mgr.sink_count(&run_id).await, 0);
    }

    #[tokio::test]
    async fn global_broadcast_does_not_touch_run_sinks() {
        let mgr = manager();
        let run_id = Id::new();
        let mut run_rx = mgr
            .handle_connection("run-client".into(), Some(run_id.clone()), None)
            .await;
        let mut global_rx = mgr.handle_connection("global-client".into(), None, None).await;

        mgr.broadcast(make_event(&run_id)).await;

        let g = global_rx.recv().await.unwrap();
        assert_eq!(g.run_id, run_id);
        assert!(run_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_clears_all_sinks() {
        let mgr = manager();
        let run_id = Id::new();
        let _rx = mgr
            .handle_connection("c1".into(), Some(run_id.clone()), None)
            .await;
        mgr.shutdown().await;
        assert_eq!(mgr.sink_count(&run_id).await, 0);
    }
}
