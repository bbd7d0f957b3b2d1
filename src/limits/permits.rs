//! Resizable worker-concurrency permits.
//!
//! The worker cap is not a fixed semaphore captured by value: the live
//! capacity sits in one cell that every acquire reads. Growing wakes
//! waiters; shrinking leaves acquire-debt, so outstanding permits drain
//! naturally until the holder count falls under the new target.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

#[derive(Debug)]
struct PermitState {
    capacity: usize,
    in_use: usize,
}

#[derive(Debug)]
struct Shared {
    state: parking_lot::Mutex<PermitState>,
    notify: Notify,
}

#[derive(Debug, Clone)]
pub struct WorkerPermits {
    shared: Arc<Shared>,
}

impl WorkerPermits {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: parking_lot::Mutex::new(PermitState {
                    capacity,
                    in_use: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Wait until a permit is available under the current live capacity.
    pub async fn acquire(&self) -> PermitGuard {
        loop {
            // Register interest before checking, so a release landing
            // between the check and the await cannot be missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.in_use < state.capacity {
                    state.in_use += 1;
                    return PermitGuard {
                        shared: Arc::clone(&self.shared),
                    };
                }
            }
            notified.await;
        }
    }

    pub fn try_acquire(&self) -> Option<PermitGuard> {
        let mut state = self.shared.state.lock();
        if state.in_use < state.capacity {
            state.in_use += 1;
            Some(PermitGuard {
                shared: Arc::clone(&self.shared),
            })
        } else {
            None
        }
    }

    /// Change the live capacity. Growth wakes waiters immediately; a
    /// shrink below the current holder count preempts nobody, it just
    /// blocks new acquires until enough permits are released.
    pub fn resize(&self, new_capacity: usize) {
        let mut state = self.shared.state.lock();
        let old = state.capacity;
        state.capacity = new_capacity;
        drop(state);
        if new_capacity > old {
            self.shared.notify.notify_waiters();
        }
        info!(old, new = new_capacity, "Worker permit capacity resized");
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().capacity
    }

    pub fn in_use(&self) -> usize {
        self.shared.state.lock().in_use
    }

    pub fn available(&self) -> usize {
        let state = self.shared.state.lock();
        state.capacity.saturating_sub(state.in_use)
    }
}

/// RAII permit; releasing on drop covers every exit path, including
/// cancellation of the holding task.
#[derive(Debug)]
pub struct PermitGuard {
    shared: Arc<Shared>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn caps_concurrent_holders() {
        let permits = WorkerPermits::new(2);

        let a = permits.acquire().await;
        let _b = permits.acquire().await;
        assert!(permits.try_acquire().is_none());

        drop(a);
        assert!(permits.try_acquire().is_some());
    }

    #[tokio::test]
    async fn grow_wakes_waiters() {
        let permits = WorkerPermits::new(1);
        let _held = permits.acquire().await;

        let permits2 = permits.clone();
        let waiter = tokio::spawn(async move {
            let _g = permits2.acquire().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        permits.resize(2);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after grow")
            .unwrap();
    }

    #[tokio::test]
    async fn shrink_imposes_acquire_debt() {
        let permits = WorkerPermits::new(3);
        let g1 = permits.acquire().await;
        let g2 = permits.acquire().await;
        let _g3 = permits.acquire().await;

        permits.resize(1);
        // Three holders against a capacity of one: two releases must be
        // absorbed before any new acquire succeeds.
        assert!(permits.try_acquire().is_none());
        drop(g1);
        assert!(permits.try_acquire().is_none());
        drop(g2);
        assert!(permits.try_acquire().is_none());
    }

    #[tokio::test]
    async fn observed_concurrency_tracks_live_capacity() {
        let permits = WorkerPermits::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let permits = permits.clone();
            let peak = Arc::clone(&peak);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let _g = permits.acquire().await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        futures::future::join_all(handles).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
