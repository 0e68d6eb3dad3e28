//! Per-run progress fan-out.
//!
//! One `watch` channel per run: the orchestrator is the single writer, any
//! number of subscribers read. Publishing never waits on readers. A slow
//! reader skips intermediate snapshots and always sees the latest one, and
//! the terminal snapshot stays in the channel after it is published.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use async_stream::stream;
use tokio::sync::watch;
use tokio_stream::Stream;

use super::types::RunSnapshot;

/// Lazy stream of snapshots: catch-up first, live updates after, ending
/// after the terminal snapshot. Dropping it unsubscribes.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = RunSnapshot> + Send>>;

#[derive(Debug, Default)]
pub struct ProgressBroadcaster {
    channels: Mutex<HashMap<String, watch::Sender<RunSnapshot>>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, watch::Sender<RunSnapshot>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create the channel for a run, seeded with its first snapshot.
    pub fn open(&self, initial: RunSnapshot) {
        let (tx, _rx) = watch::channel(initial.clone());
        self.lock().insert(initial.run_id, tx);
    }

    /// Replace the current snapshot. Stale sequences are dropped.
    pub fn publish(&self, snapshot: RunSnapshot) {
        let channels = self.lock();
        let Some(tx) = channels.get(&snapshot.run_id) else {
            tracing::debug!(run_id = %snapshot.run_id, "Publish to closed channel ignored");
            return;
        };
        tx.send_if_modified(|current| {
            if snapshot.sequence > current.sequence {
                *current = snapshot;
                true
            } else {
                false
            }
        });
    }

    /// Drop the run's sender. Subscribers drain the final value and end.
    pub fn close(&self, run_id: &str) {
        if self.lock().remove(run_id).is_some() {
            tracing::debug!(run_id, "Progress channel closed");
        }
    }

    pub fn is_open(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    pub fn latest(&self, run_id: &str) -> Option<RunSnapshot> {
        self.lock().get(run_id).map(|tx| tx.borrow().clone())
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.lock().get(run_id).map_or(0, |tx| tx.receiver_count())
    }

    /// `None` once the channel is closed; callers fall back to the registry.
    pub fn subscribe(&self, run_id: &str) -> Option<SnapshotStream> {
        let rx = self.lock().get(run_id)?.subscribe();
        Some(snapshot_stream(rx))
    }
}

fn snapshot_stream(mut rx: watch::Receiver<RunSnapshot>) -> SnapshotStream {
    Box::pin(stream! {
        let current = rx.borrow_and_update().clone();
        let mut done = current.is_terminal();
        yield current;
        // Err means the sender is gone and every value has been seen.
        while !done && rx.changed().await.is_ok() {
            let next = rx.borrow_and_update().clone();
            done = next.is_terminal();
            yield next;
        }
    })
}
