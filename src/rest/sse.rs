// SPDX-License-Identifier: MIT
//! SSE bridge for review event streams.
//!
//! GET /api/v1/reviews/{id}/events
//!
//! Replays the session's full backlog first, then follows the live broadcast
//! channel until a terminal event (`complete` or `error`) has been
//! delivered. Reconnecting mid-review therefore always yields the complete
//! ordered log. A completed session inside its grace window replays and
//! closes; an unknown id is a 404.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ReviewError;
use crate::event::Event;
use crate::rest::ApiError;
use crate::AppContext;

pub async fn review_events_sse(
    State(ctx): State<Arc<AppContext>>,
    Path(review_id): Path<String>,
) -> Response {
    let Some(sub) = ctx.sessions.subscribe(&review_id).await else {
        return ApiError(ReviewError::ReviewNotFound(review_id)).into_response();
    };

    let backlog_is_terminal = sub.backlog.iter().any(Event::is_terminal);
    let backlog = stream::iter(
        sub.backlog
            .into_iter()
            .map(|ev| Ok::<SseEvent, std::convert::Infallible>(frame(&ev))),
    );

    // Follow the live channel only when the backlog didn't already end the
    // story. `done` flips after the terminal event is yielded so the stream
    // closes cleanly instead of waiting for channel teardown.
    let live = match sub.live {
        Some(rx) if !backlog_is_terminal => Some(rx),
        _ => None,
    };
    let live = stream::unfold((live, false), |(rx, done)| async move {
        let mut rx = rx?;
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let terminal = ev.is_terminal();
                    return Some((
                        Ok::<SseEvent, std::convert::Infallible>(frame(&ev)),
                        (Some(rx), terminal),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // The client missed events; the snapshot endpoint has the
                    // authoritative log.
                    debug!(lagged = n, "SSE subscriber lagged, continuing");
                    continue;
                }
            }
        }
    });

    let combined = backlog.chain(live);
    Sse::new(combined)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("ping"),
        )
        .into_response()
}

/// One event per SSE frame: the `type` tag doubles as the SSE event name,
/// the full envelope rides in `data`.
fn frame(ev: &Event) -> SseEvent {
    let value = serde_json::to_value(ev).unwrap_or_default();
    let name = value["type"].as_str().unwrap_or("event").to_string();
    SseEvent::default().event(name).data(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn frame_names_the_sse_event_after_the_type_tag() {
        let ev = Event::new(EventKind::AgentThinking {
            agent_id: "a".into(),
        });
        let framed = format!("{:?}", frame(&ev));
        assert!(framed.contains("agent_thinking"));
    }
}
