//! Per-flow serialization of manager operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per flow id, created on demand and dropped with its last user.
#[derive(Default)]
pub(super) struct FlowLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl FlowLocks {
    pub(super) async fn acquire(self: &Arc<Self>, flow_id: &str) -> FlowGuard {
        let lock = self
            .locks
            .lock()
            .unwrap()
            .entry(flow_id.to_string())
            .or_default()
            .clone();

        FlowGuard {
            guard: Some(lock.lock_owned().await),
            flow_id: flow_id.to_string(),
            locks: Arc::clone(self),
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

pub(super) struct FlowGuard {
    guard: Option<OwnedMutexGuard<()>>,
    flow_id: String,
    locks: Arc<FlowLocks>,
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap();
        self.guard.take();
        // Only the map still holds it: nobody is waiting.
        if locks
            .get(&self.flow_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.flow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_flow_is_serialized() {
        let locks = Arc::new(FlowLocks::default());
        let held = locks.acquire("f-1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("f-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Other flows are not blocked.
        drop(locks.acquire("f-2").await);

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = Arc::new(FlowLocks::default());
        let guard = locks.acquire("f-1").await;
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert_eq!(locks.len(), 0);
    }
}
