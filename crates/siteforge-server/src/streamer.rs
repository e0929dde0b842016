//! SSE streaming for pipeline progress
//!
//! Bridges a run's broadcast channel onto a Server-Sent Events
//! response. The stream closes on the run's terminal event, on channel
//! close, or at a hard connection deadline.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use siteforge::pipeline::ProgressEvent;
use tokio::sync::broadcast;

use crate::runs::RunManager;

/// Stream events from an already-subscribed receiver, optionally
/// preceded by an intro event carrying the run identifiers.
pub fn stream_events(
    mut receiver: broadcast::Receiver<ProgressEvent>,
    intro: Option<serde_json::Value>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        if let Some(payload) = intro {
            yield Ok(Event::default().event("accepted").data(payload.to_string()));
        }

        // Maximum SSE connection lifetime to prevent zombie connections
        let sse_lifetime_secs = std::env::var("SITEFORGE_SSE_MAX_LIFETIME_SECS")
            .ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or(30 * 60);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(sse_lifetime_secs);

        loop {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Ok(event)) => {
                    let is_terminal = event.is_terminal();
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event(event.event_type()).data(data));

                    if is_terminal {
                        break;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    tracing::warn!("SSE run stream lagged by {} messages", n);
                    continue;
                }
                Err(_) => {
                    tracing::info!("SSE stream deadline reached, closing for client reconnect");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("ping"),
    )
}

/// Attach to a run by build id. An unknown or already-finished run
/// yields a single terminal error event so clients never hang.
pub async fn stream_run(
    build_id: String,
    runs: Arc<RunManager>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = runs.subscribe(&build_id).await;
    let stream = async_stream::stream! {
        let Some(mut receiver) = receiver else {
            yield Ok(Event::default()
                .event("error")
                .data(serde_json::json!({
                    "type": "Error",
                    "message": "Run not found or already completed",
                    "build_id": build_id,
                }).to_string()));
            return;
        };

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let is_terminal = event.is_terminal();
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    yield Ok(Event::default().event(event.event_type()).data(data));
                    if is_terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("SSE run stream lagged by {} messages", n);
                    continue;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("ping"),
    )
}
