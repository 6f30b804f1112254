use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Key = (String, String);

/// Single-writer lock per (flow, contact).
///
/// The table only holds weak references; entries whose lock nobody holds or
/// waits on are pruned whenever a new key is inserted.
#[derive(Default)]
pub struct ContactLocks {
    table: Mutex<HashMap<Key, Weak<AsyncMutex<()>>>>,
}

impl ContactLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a conversation. Released on drop.
    pub async fn lock(&self, flow_id: &str, contact_id: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            let key = (flow_id.to_string(), contact_id.to_string());
            match table.get(&key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    table.retain(|_, weak| weak.strong_count() > 0);
                    let fresh = Arc::new(AsyncMutex::new(()));
                    table.insert(key, Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        mutex.lock_owned().await
    }

    /// Number of tracked entries, live or not yet pruned.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_contact_is_serialized() {
        let locks = Arc::new(ContactLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("f1", "c1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_contacts_do_not_block() {
        let locks = ContactLocks::new();
        let _a = locks.lock("f1", "a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("f1", "b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = ContactLocks::new();
        for i in 0..10 {
            let _guard = locks.lock("f1", &format!("c{i}")).await;
        }
        // Every previous guard is gone, so inserting one more prunes the rest.
        let _guard = locks.lock("f1", "last").await;
        assert_eq!(locks.len(), 1);
    }
}
