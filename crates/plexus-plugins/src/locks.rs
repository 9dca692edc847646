//! Per-name async mutexes.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily-populated set of async mutexes keyed by plugin name.
///
/// Operations on the same name serialize; different names never contend.
/// Entries are never removed, which is fine for a set bounded by the number
/// of installed plugins.
#[derive(Debug, Default)]
pub(crate) struct NamedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NamedLocks {
    /// Create an empty lock set.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock for `name`.
    pub(crate) async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await.
        let lock = Arc::clone(
            self.locks
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    /// Whether the lock for `name` is currently held.
    #[must_use]
    pub(crate) fn is_held(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_name_serializes() {
        let locks = Arc::new(NamedLocks::new());
        let guard = locks.acquire("billing").await;
        assert!(locks.is_held("billing"));

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire("billing").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert!(!locks.is_held("billing"));
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let locks = NamedLocks::new();
        let _a = locks.acquire("billing").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("seo")).await;
        assert!(b.is_ok());
    }
}
