//! Per-execution event buffer with sequence numbers and late-join replay.
//!
//! Implements the buffer half of the Event Bus & Transports component
//! (spec Section 4.3). The transport half (SSE/WS fan-out) lives in
//! `transport.rs`.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use weave_core::{AgUiEvent, Id};

/// Maximum events retained per execution before the oldest 10% are dropped.
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// Default retention window since an execution's buffer was last updated.
pub const DEFAULT_RETENTION_SEC: i64 = 86_400;

/// One buffered event, tagged with its per-execution sequence number.
#[derive(Debug, Clone)]
pub struct SeqEvent {
    pub seq: u64,
    pub event: AgUiEvent,
}

struct ExecutionBuffer {
    next_seq: u64,
    events: VecDeque<SeqEvent>,
    last_updated_at: DateTime<Utc>,
}

impl ExecutionBuffer {
    fn new() -> Self {
        Self {
            next_seq: 0,
            events: VecDeque::new(),
            last_updated_at: Utc::now(),
        }
    }
}

/// Statistics snapshot for one execution's buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub execution_count: usize,
    pub total_events: usize,
}

/// Bounded, keyed event buffer. Keyed by executionId; maintains a
/// monotonic gap-free sequence number per execution (spec Section 4.3).
pub struct EventBuffer {
    max_events: usize,
    retention_sec: i64,
    buffers: Mutex<HashMap<Id, ExecutionBuffer>>,
}

impl EventBuffer {
    pub fn new(max_events: usize, retention_sec: i64) -> Self {
        Self {
            max_events,
            retention_sec,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append an event for `execution_id`, returning its assigned sequence number.
    pub async fn add_event(&self, execution_id: &Id, event: AgUiEvent) -> u64 {
        let mut buffers = self.buffers.lock().await;
        let buf = buffers
            .entry(execution_id.clone())
            .or_insert_with(ExecutionBuffer::new);

        let seq = buf.next_seq;
        buf.next_seq += 1;
        buf.last_updated_at = Utc::now();
        buf.events.push_back(SeqEvent { seq, event });

        if buf.events.len() > self.max_events {
            let drop_count = self.max_events / 10;
            tracing::warn!(
                execution_id = %execution_id,
                drop_count,
                "event buffer overflow, dropping oldest events"
            );
            for _ in 0..drop_count.max(1) {
                buf.events.pop_front();
            }
        }

        seq
    }

    /// Replay events for `execution_id` with `seq >= from_seq` (default 0).
    pub async fn get_events(&self, execution_id: &Id, from_seq: Option<u64>) -> Vec<SeqEvent> {
        let from_seq = from_seq.unwrap_or(0);
        let buffers = self.buffers.lock().await;
        match buffers.get(execution_id) {
            Some(buf) => buf
                .events
                .iter()
                .filter(|e| e.seq >= from_seq)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Remove an execution's buffer entirely.
    pub async fn remove_buffer(&self, execution_id: &Id) {
        self.buffers.lock().await.remove(execution_id);
    }

    /// Prune buffers whose `last_updated_at` is older than the retention window.
    pub async fn prune_stale(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.retention_sec);
        let mut buffers = self.buffers.lock().await;
        let before = buffers.len();
        buffers.retain(|_, buf| buf.last_updated_at >= cutoff);
        before - buffers.len()
    }

    pub async fn stats(&self) -> BufferStats {
        let buffers = self.buffers.lock().await;
        BufferStats {
            execution_count: buffers.len(),
            total_events: buffers.values().map(|b| b.events.len()).sum(),
        }
    }
}

/// Background sweep task: periodically prunes stale buffers.
///
/// Mirrors the teacher's periodic-sweep background-task shape used elsewhere
/// in the daemon (scheduler poll loop, watchdog signal checks).
pub async fn run_prune_sweep(buffer: std::sync::Arc<EventBuffer>, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let pruned = buffer.prune_stale().await;
        if pruned > 0 {
            tracing::info!(pruned, "pruned stale event buffers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_core::AgUiEventType;

    fn make_event(run_id: &Id) -> AgUiEvent {
        AgUiEvent::new(AgUiEventType::RunStarted, run_id.clone(), Utc::now().timestamp_millis())
    }

    #[tokio::test]
    async fn add_event_assigns_gap_free_sequence() {
        let buffer = EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC);
        let id = Id::new();
        let s0 = buffer.add_event(&id, make_event(&id)).await;
        let s1 = buffer.add_event(&id, make_event(&id)).await;
        let s2 = buffer.add_event(&id, make_event(&id)).await;
        assert_eq!((s0, s1, s2), (0, 1, 2));
    }

    #[tokio::test]
    async fn get_events_filters_by_from_seq() {
        let buffer = EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC);
        let id = Id::new();
        for _ in 0..5 {
            buffer.add_event(&id, make_event(&id)).await;
        }
        let events = buffer.get_events(&id, Some(3)).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.seq >= 3));
    }

    #[tokio::test]
    async fn get_events_returns_strictly_increasing_sequence() {
        // Invariant 8: entries returned have strictly increasing seq, all >= k.
        let buffer = EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC);
        let id = Id::new();
        for _ in 0..10 {
            buffer.add_event(&id, make_event(&id)).await;
        }
        let events = buffer.get_events(&id, Some(2)).await;
        for pair in events.windows(2) {
            assert!(pair[1].seq > pair[0].seq);
        }
        assert!(events.iter().all(|e| e.seq >= 2));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_ten_percent() {
        let buffer = EventBuffer::new(10, DEFAULT_RETENTION_SEC);
        let id = Id::new();
        for _ in 0..11 {
            buffer.add_event(&id, make_event(&id)).await;
        }
        let events = buffer.get_events(&id, None).await;
        assert!(events.len() <= 10);
        // Oldest (seq 0) should have been dropped.
        assert!(events.iter().all(|e| e.seq >= 1));
    }

    #[tokio::test]
    async fn remove_buffer_clears_execution() {
        let buffer = EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC);
        let id = Id::new();
        buffer.add_event(&id, make_event(&id)).await;
        buffer.remove_buffer(&id).await;
        assert!(buffer.get_events(&id, None).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_execution_returns_empty() {
        let buffer = EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC);
        let events = buffer.get_events(&Id::new(), None).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn stats_reports_counts() {
        let buffer = EventBuffer::new(DEFAULT_MAX_EVENTS, DEFAULT_RETENTION_SEC);
        let id1 = Id::new();
        let id2 = Id::new();
        buffer.add_event(&id1, make_event(&id1)).await;
        buffer.add_event(&id2, make_event(&id2)).await;
        buffer.add_event(&id2, make_event(&id2)).await;

        let stats = buffer.stats().await;
        assert_eq!(stats.execution_count, 2);
        assert_eq!(stats.total_events, 3);
    }
}
