//! Node-wide create/destroy serialization.
//!
//! Backends edit the user database, snapshot filesystems and allocate numeric
//! ids. None of that is safe to run concurrently for different names, so every
//! `create` runs under one lock and every `destroy` under another. The locks
//! cover a single backend call, never a whole transition.
//!
//! Neither lock is taken while the other is held: a recreation releases the
//! destroy lock before it asks for the create lock.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::trace;

/// Acquisition counters for the lifecycle locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub create_acquisitions: u64,
    pub destroy_acquisitions: u64,
}

/// The global create and destroy locks.
#[derive(Debug)]
pub struct LifecycleLocks {
    create: Mutex<()>,
    destroy: Mutex<()>,
    create_acquisitions: AtomicU64,
    destroy_acquisitions: AtomicU64,
}

impl Default for LifecycleLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleLocks {
    pub fn new() -> Self {
        Self {
            create: Mutex::new(()),
            destroy: Mutex::new(()),
            create_acquisitions: AtomicU64::new(0),
            destroy_acquisitions: AtomicU64::new(0),
        }
    }

    /// Run `op` while holding the create lock.
    pub async fn creating<F, T>(&self, name: &str, op: F) -> T
    where
        F: Future<Output = T>,
    {
        Self::holding(&self.create, &self.create_acquisitions, name, "create", op).await
    }

    /// Run `op` while holding the destroy lock.
    pub async fn destroying<F, T>(&self, name: &str, op: F) -> T
    where
        F: Future<Output = T>,
    {
        Self::holding(&self.destroy, &self.destroy_acquisitions, name, "destroy", op).await
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            create_acquisitions: self.create_acquisitions.load(Ordering::Relaxed),
            destroy_acquisitions: self.destroy_acquisitions.load(Ordering::Relaxed),
        }
    }

    async fn holding<F, T>(
        lock_cell: &Mutex<()>,
        counter: &AtomicU64,
        name: &str,
        lock: &'static str,
        op: F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = lock_cell.lock().await;
        counter.fetch_add(1, Ordering::Relaxed);
        trace!(sliver = %name, lock, "Lifecycle lock acquired");
        let result = op.await;
        trace!(sliver = %name, lock, "Lifecycle lock released");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_create_lock_admits_one_holder() {
        let locks = Arc::new(LifecycleLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = Arc::clone(&locks);
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    locks
                        .creating(&format!("s{i}"), async {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.stats().create_acquisitions, 8);
        assert_eq!(locks.stats().destroy_acquisitions, 0);
    }

    #[tokio::test]
    async fn test_create_and_destroy_locks_are_independent() {
        let locks = LifecycleLocks::new();
        // holding the create lock must not block a destroy
        let value = locks
            .creating("a", async { locks.destroying("b", async { 7 }).await })
            .await;
        assert_eq!(value, 7);
        assert_eq!(
            locks.stats(),
            LockStats {
                create_acquisitions: 1,
                destroy_acquisitions: 1
            }
        );
    }
}
