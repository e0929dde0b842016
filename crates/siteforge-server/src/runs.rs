//! Run manager for tracking in-flight pipeline runs
//!
//! Provides registration, broadcast fan-out, and late subscription for
//! running pipelines. The initiating request holds one receiver; other
//! clients can attach to the same run by build id.

use std::collections::HashMap;

use siteforge::pipeline::ProgressEvent;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

/// Buffered events per run before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 512;

/// One in-flight pipeline run
pub struct ActiveRun {
    pub build_id: String,
    pub started_at: std::time::Instant,
    pub stream_tx: broadcast::Sender<ProgressEvent>,
}

/// Tracks running pipelines by build id
pub struct RunManager {
    runs: RwLock<HashMap<String, ActiveRun>>,
}

impl RunManager {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new run, returning its broadcast sender
    pub async fn register(&self, build_id: &str) -> broadcast::Sender<ProgressEvent> {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let run = ActiveRun {
            build_id: build_id.to_string(),
            started_at: std::time::Instant::now(),
            stream_tx: tx.clone(),
        };
        let mut runs = self.runs.write().await;
        runs.insert(build_id.to_string(), run);
        info!("Run registered: {}", build_id);
        tx
    }

    /// Subscribe to a run's event stream
    pub async fn subscribe(&self, build_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        let runs = self.runs.read().await;
        runs.get(build_id).map(|r| r.stream_tx.subscribe())
    }

    /// Remove a finished run from tracking
    pub async fn finish(&self, build_id: &str) {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.remove(build_id) {
            info!(
                "Run finished: {} (elapsed: {:?})",
                build_id,
                run.started_at.elapsed()
            );
        }
    }

    /// Number of runs currently tracked
    pub async fn running_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_until_finish() {
        let manager = RunManager::new();
        let tx = manager.register("b1").await;
        let mut rx = manager.subscribe("b1").await.expect("run must be live");

        tx.send(ProgressEvent::Text {
            content: "chunk".into(),
        })
        .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "text");

        manager.finish("b1").await;
        assert!(manager.subscribe("b1").await.is_none());
        assert_eq!(manager.running_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_run_has_no_stream() {
        let manager = RunManager::new();
        assert!(manager.subscribe("nope").await.is_none());
    }
}
