//! Merge queue: multi-producer, single-consumer, strict submission order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use crate::worker::ResultEnvelope;

/// A completed worker branch awaiting integration.
#[derive(Debug, Clone)]
pub struct MergeSubmission {
    pub unit_id: String,
    pub branch_ref: String,
    /// Clone holding the branch's objects; leased until the merge
    /// resolves.
    pub workspace: PathBuf,
    pub envelope: ResultEnvelope,
    pub submitted_at: Instant,
}

/// FIFO between worker tasks and the green-branch consumer. Submissions
/// are never dropped; a drain timeout returns the partial batch and leaves
/// the rest enqueued.
#[derive(Default)]
pub struct MergeQueue {
    items: parking_lot::Mutex<VecDeque<MergeSubmission>>,
    submitted: Notify,
}

impl MergeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, submission: MergeSubmission) {
        debug!(unit_id = %submission.unit_id, branch = %submission.branch_ref, "Merge submission enqueued");
        self.items.lock().push_back(submission);
        self.submitted.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Collect up to `max_items` submissions in submission order. The
    /// deadline scales with `max_items` so draining a large epoch is not
    /// misread as a stuck queue.
    pub async fn drain(&self, max_items: usize, per_item_timeout: Duration) -> Vec<MergeSubmission> {
        let deadline = Instant::now() + per_item_timeout * max_items.max(1) as u32;
        let mut batch = Vec::new();

        while batch.len() < max_items {
            // Register interest before checking, so a submit landing
            // between the check and the await cannot be missed.
            let notified = self.submitted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut items = self.items.lock();
                while batch.len() < max_items {
                    match items.pop_front() {
                        Some(s) => batch.push(s),
                        None => break,
                    }
                }
            }
            if batch.len() >= max_items {
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(collected = batch.len(), max_items, "Drain deadline reached");
                break;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                debug!(collected = batch.len(), max_items, "Drain timed out");
                break;
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn submission(unit_id: &str) -> MergeSubmission {
        MergeSubmission {
            unit_id: unit_id.into(),
            branch_ref: format!("mc/unit-{}", unit_id),
            workspace: PathBuf::from("/tmp"),
            envelope: ResultEnvelope::default(),
            submitted_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn drain_preserves_submission_order() {
        let queue = MergeQueue::new();
        for id in ["a", "b", "c"] {
            queue.submit(submission(id));
        }

        let batch = queue.drain(3, Duration::from_millis(10)).await;
        let ids: Vec<&str> = batch.iter().map(|s| s.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn partial_drain_leaves_remainder_enqueued() {
        let queue = MergeQueue::new();
        for id in ["a", "b", "c"] {
            queue.submit(submission(id));
        }

        let batch = queue.drain(2, Duration::from_millis(10)).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 1);

        let rest = queue.drain(5, Duration::from_millis(10)).await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].unit_id, "c");
    }

    #[tokio::test]
    async fn drain_wakes_on_concurrent_submit() {
        let queue = Arc::new(MergeQueue::new());

        let queue2 = Arc::clone(&queue);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            queue2.submit(submission("late"));
        });

        let batch = queue.drain(1, Duration::from_secs(2)).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].unit_id, "late");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn drain_timeout_returns_empty_batch() {
        let queue = MergeQueue::new();
        let batch = queue.drain(2, Duration::from_millis(20)).await;
        assert!(batch.is_empty());
    }
}
