// SPDX-License-Identifier: MIT
//! Session registry — keyed, append-only event log per in-flight review.
//!
//! The registry is the only mutable state shared between the single writer
//! (the active pipeline run) and concurrent readers (clients reconnecting
//! mid-review). Writers append-only; readers snapshot-read and then follow
//! the live broadcast channel. Sessions are created when a review stream
//! starts, marked ready once the first structural event is buffered, and
//! retained for a grace window after completion so a racing reconnect can
//! still read the final log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::event::Event;
use crate::model::ReviewMode;

/// How long a completed session stays readable before eviction.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Live broadcast buffer per session. Slow subscribers that lag more than
/// this many events observe a `Lagged` error and should re-snapshot.
const CHANNEL_CAPACITY: usize = 1024;

// ─── Identity ─────────────────────────────────────────────────────────────────

/// The four fields that identify "the same review" for reconnect purposes.
/// All four must match exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub project_path: String,
    pub head_commit: String,
    pub status_hash: String,
    pub mode: ReviewMode,
}

// ─── Entry ────────────────────────────────────────────────────────────────────

struct SessionEntry {
    identity: SessionIdentity,
    started_at: chrono::DateTime<chrono::Utc>,
    is_ready: bool,
    is_complete: bool,
    events: Vec<Event>,
    /// Dropped on completion, which detaches all live subscribers.
    tx: Option<broadcast::Sender<Event>>,
}

/// Snapshot + live tail handed to a subscriber.
pub struct Subscription {
    /// Everything emitted so far, in order.
    pub backlog: Vec<Event>,
    /// Live channel; `None` when the session already completed.
    pub live: Option<broadcast::Receiver<Event>>,
    pub is_complete: bool,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

pub struct SessionRegistry {
    inner: RwLock<HashMap<String, SessionEntry>>,
    grace: Duration,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            grace,
        }
    }

    pub async fn create(&self, review_id: &str, identity: SessionIdentity) {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let entry = SessionEntry {
            identity,
            started_at: chrono::Utc::now(),
            is_ready: false,
            is_complete: false,
            events: Vec::new(),
            tx: Some(tx),
        };
        self.inner.write().await.insert(review_id.to_string(), entry);
    }

    /// Append one event and fan it out to live subscribers. Appends to a
    /// completed or unknown session are dropped (a cancelled pipeline racing
    /// its own teardown, not a bug worth panicking over).
    pub async fn append(&self, review_id: &str, event: Event) {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.get_mut(review_id) else {
            debug!(review_id, "append to unknown session dropped");
            return;
        };
        if entry.is_complete {
            debug!(review_id, "append to completed session dropped");
            return;
        }
        if let Some(tx) = &entry.tx {
            // No subscribers is fine.
            let _ = tx.send(event.clone());
        }
        entry.events.push(event);
    }

    pub async fn mark_ready(&self, review_id: &str) {
        if let Some(entry) = self.inner.write().await.get_mut(review_id) {
            entry.is_ready = true;
        }
    }

    /// Mark terminal (success, error, or abort alike), detach subscribers,
    /// and schedule eviction after the grace window.
    pub async fn mark_complete(self: &Arc<Self>, review_id: &str) {
        {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.get_mut(review_id) else {
                return;
            };
            entry.is_complete = true;
            entry.tx = None; // closes all live receivers
        }
        let registry = Arc::clone(self);
        let id = review_id.to_string();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.inner.write().await.remove(&id);
            debug!(review_id = %id, "session evicted after grace window");
        });
    }

    /// Snapshot the event log. `None` for unknown sessions.
    pub async fn events(&self, review_id: &str) -> Option<Vec<Event>> {
        self.inner
            .read()
            .await
            .get(review_id)
            .map(|e| e.events.clone())
    }

    /// Subscribe for replay + live tail.
    pub async fn subscribe(&self, review_id: &str) -> Option<Subscription> {
        let inner = self.inner.read().await;
        let entry = inner.get(review_id)?;
        Some(Subscription {
            backlog: entry.events.clone(),
            live: entry.tx.as_ref().map(|tx| tx.subscribe()),
            is_complete: entry.is_complete,
        })
    }

    /// The reconnect path: returns the review id of an in-flight session
    /// whose identity matches exactly — only when `is_ready && !is_complete`.
    pub async fn get_active_for_project(&self, identity: &SessionIdentity) -> Option<String> {
        self.inner
            .read()
            .await
            .iter()
            .find(|(_, e)| e.is_ready && !e.is_complete && e.identity == *identity)
            .map(|(id, _)| id.clone())
    }

    pub async fn started_at(&self, review_id: &str) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner
            .read()
            .await
            .get(review_id)
            .map(|e| e.started_at)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Emitter ──────────────────────────────────────────────────────────────────

/// Write handle for one review run: stamps every event with the run's
/// `traceId` and appends it to the session log.
#[derive(Clone)]
pub struct Emitter {
    registry: Arc<SessionRegistry>,
    review_id: String,
    trace_id: String,
}

impl Emitter {
    pub fn new(registry: Arc<SessionRegistry>, review_id: &str, trace_id: &str) -> Self {
        Self {
            registry,
            review_id: review_id.to_string(),
            trace_id: trace_id.to_string(),
        }
    }

    pub fn review_id(&self) -> &str {
        &self.review_id
    }

    pub async fn emit(&self, kind: crate::event::EventKind) {
        let event = Event::new(kind).with_trace(&self.trace_id);
        self.registry.append(&self.review_id, event).await;
    }

    /// Emit with span correlation — used for agent-scoped and tool events.
    pub async fn emit_spanned(
        &self,
        kind: crate::event::EventKind,
        span_id: &str,
        parent_span_id: Option<&str>,
    ) {
        let mut event = Event::new(kind).with_trace(&self.trace_id).with_span(span_id);
        if let Some(parent) = parent_span_id {
            event = event.with_parent_span(parent);
        }
        self.registry.append(&self.review_id, event).await;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
