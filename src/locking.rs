//! In-process per-file locks serializing overwrite/snapshot sequences.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

use crate::error::StoreError;
use crate::layout::UserId;

/// Asynchronous mutexes keyed by (user, live-relative path).
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<(UserId, String), Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `timeout` for the lock on `path`.
    pub async fn lock_path(
        &self,
        user: UserId,
        path: &str,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, StoreError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry((user, path.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                StoreError::Io(io::Error::new(io::ErrorKind::TimedOut, "path locked"))
            })
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_locker_times_out_while_held() {
        let manager = LockManager::new();
        let guard = manager
            .lock_path(1, "a.txt", Duration::from_millis(50))
            .await
            .expect("first lock");
        let second = manager
            .lock_path(1, "a.txt", Duration::from_millis(20))
            .await;
        assert!(matches!(second, Err(StoreError::Io(_))));

        let other_user = manager.lock_path(2, "a.txt", Duration::from_millis(20)).await;
        assert!(other_user.is_ok());
        drop(guard);
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let manager = LockManager::new();
        drop(
            manager
                .lock_path(1, "x", Duration::from_millis(10))
                .await
                .expect("lock"),
        );
        let _held = manager
            .lock_path(1, "y", Duration::from_millis(10))
            .await
            .expect("lock");
        assert_eq!(manager.tracked().await, 1);
    }
}
