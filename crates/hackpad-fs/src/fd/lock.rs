//! Advisory file locks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::vfs::{VfsError, VfsResult};

/// `flock(2)` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
    Unlock,
}

/// Grants and releases path-keyed advisory locks.
///
/// Implementations never wait; contention is resolved by the caller polling
/// [`try_lock`](LockCoordinator::try_lock).
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Attempt to take a lock. `Ok(false)` means it is held incompatibly.
    async fn try_lock(&self, path: &str, shared: bool) -> VfsResult<bool>;

    /// Release one hold on `path`.
    async fn unlock(&self, path: &str) -> VfsResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Shared(usize),
    Exclusive,
}

/// In-process coordinator.
#[derive(Debug, Default)]
pub struct MemoryLockCoordinator {
    held: Mutex<HashMap<String, Held>>,
}

impl MemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockCoordinator for MemoryLockCoordinator {
    async fn try_lock(&self, path: &str, shared: bool) -> VfsResult<bool> {
        let mut held = self.held.lock();
        match held.entry(path.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(if shared { Held::Shared(1) } else { Held::Exclusive });
                Ok(true)
            }
            Entry::Occupied(mut slot) => match slot.get_mut() {
                Held::Shared(n) if shared => {
                    *n += 1;
                    Ok(true)
                }
                _ => Ok(false),
            },
        }
    }

    async fn unlock(&self, path: &str) -> VfsResult<()> {
        let mut held = self.held.lock();
        if let Entry::Occupied(mut slot) = held.entry(path.to_string()) {
            match slot.get_mut() {
                Held::Shared(n) if *n > 1 => *n -= 1,
                _ => {
                    slot.remove();
                }
            }
        }
        Ok(())
    }
}

/// Poll `coordinator` until the lock is granted or `cancel` fires.
pub(crate) async fn acquire(
    coordinator: &dyn LockCoordinator,
    path: &str,
    shared: bool,
    poll: Duration,
    cancel: &CancellationToken,
) -> VfsResult<()> {
    let mut ticker = tokio::time::interval(poll.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VfsError::Cancelled),
            _ = ticker.tick() => {}
        }
        if coordinator.try_lock(path, shared).await? {
            return Ok(());
        }
        tracing::trace!(path = %path, shared, "lock contended, retrying");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::ErrorKind;

    #[tokio::test]
    async fn test_shared_locks_stack() {
        let locks = MemoryLockCoordinator::new();
        assert!(locks.try_lock("/f", true).await.unwrap());
        assert!(locks.try_lock("/f", true).await.unwrap());
        assert!(!locks.try_lock("/f", false).await.unwrap());

        locks.unlock("/f").await.unwrap();
        assert!(!locks.try_lock("/f", false).await.unwrap());
        locks.unlock("/f").await.unwrap();
        assert!(locks.try_lock("/f", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_exclusive_blocks_everything() {
        let locks = MemoryLockCoordinator::new();
        assert!(locks.try_lock("/f", false).await.unwrap());
        assert!(!locks.try_lock("/f", true).await.unwrap());
        assert!(!locks.try_lock("/f", false).await.unwrap());
        assert!(locks.try_lock("/other", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = std::sync::Arc::new(MemoryLockCoordinator::new());
        assert!(locks.try_lock("/f", false).await.unwrap());

        let releaser = {
            let locks = std::sync::Arc::clone(&locks);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                locks.unlock("/f").await.unwrap();
            })
        };
        let cancel = CancellationToken::new();
        acquire(locks.as_ref(), "/f", false, Duration::from_millis(2), &cancel)
            .await
            .unwrap();
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let locks = MemoryLockCoordinator::new();
        assert!(locks.try_lock("/f", false).await.unwrap());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = acquire(&locks, "/f", true, Duration::from_millis(2), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }
}
