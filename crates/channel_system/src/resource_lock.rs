//! Per-key async critical sections.
//!
//! Holders of the same key run one at a time in arrival order; different keys
//! never wait on each other. No lock spans more than one key.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// FIFO mutual exclusion keyed by resource id.
#[derive(Debug)]
pub struct ResourceLocks<K: Eq + Hash> {
    slots: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash> Default for ResourceLocks<K> {
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }
}

impl<K: Eq + Hash> Clone for ResourceLocks<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K> ResourceLocks<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free and holds it until the guard drops.
    pub async fn acquire(&self, key: K) -> ResourceGuard<K> {
        let slot = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        ResourceGuard {
            guard: Some(guard),
            key,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Keys currently held or waited on.
    pub fn active(&self) -> usize {
        self.slots.len()
    }
}

/// Exclusive hold on one resource key.
pub struct ResourceGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    slots: Arc<DashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash> ResourceGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for ResourceGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // only the map still references the slot: nobody holds or waits
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_same_key_runs_in_arrival_order() {
        let locks: ResourceLocks<String> = ResourceLocks::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = locks.acquire("google:1".to_string()).await;
        let mut tasks = Vec::new();
        for i in 0..3 {
            let locks = locks.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire("google:1".to_string()).await;
                order.lock().unwrap().push(i);
            }));
            // let each waiter enqueue before the next one
            sleep(Duration::from_millis(5)).await;
        }
        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_holders_are_exclusive() {
        let locks: ResourceLocks<u32> = ResourceLocks::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire(7).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                sleep(Duration::from_millis(1)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_different_keys_do_not_wait() {
        let locks: ResourceLocks<u32> = ResourceLocks::new();
        let _a = locks.acquire(1).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(2)).await;
        assert!(b.is_ok());
    }
}
