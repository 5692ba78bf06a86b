use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries are swept once the map grows past this size.
const SWEEP_THRESHOLD: usize = 1024;

/// Per-scope async locks serializing store-assigned key allocation.
///
/// Creates under the same parent scope queue behind one lock; different
/// scopes never contend.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    scopes: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, scope: String) -> OwnedMutexGuard<()> {
        let slot = {
            let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
            if scopes.len() > SWEEP_THRESHOLD {
                scopes.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            scopes
                .entry(scope)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_scope_is_exclusive() {
        let locks = ScopeLocks::new();
        let guard = locks.lock("run:demo".to_string()).await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            locks.lock("run:demo".to_string()),
        )
        .await;
        assert!(blocked.is_err());
        drop(guard);
        let _again = locks.lock("run:demo".to_string()).await;
    }

    #[tokio::test]
    async fn different_scopes_do_not_contend() {
        let locks = ScopeLocks::new();
        let _a = locks.lock("run:a".to_string()).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock("run:b".to_string()))
            .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
