use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Task ids marked revoked, with when the mark arrived. Consulted before
/// execution starts and again before results are committed.
#[derive(Default)]
pub struct RevocationRegistry {
    revoked: DashMap<Uuid, DateTime<Utc>>,
}

impl RevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, task_id: Uuid) {
        self.revoked.entry(task_id).or_insert_with(Utc::now);
    }

    pub fn is_revoked(&self, task_id: &Uuid) -> bool {
        self.revoked.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

struct InflightEntry {
    nonce: u64,
    token: CancellationToken,
}

/// Cancellation tokens for tasks currently executing, keyed by task id.
/// Entries carry a nonce so a guard from a finished execution cannot
/// remove the entry of a newer execution reusing the same id.
#[derive(Default)]
pub struct InflightRegistry {
    inflight: DashMap<Uuid, InflightEntry>,
    next_nonce: AtomicU64,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `task_id` as executing. The returned guard untracks it on drop;
    /// the returned token fires if the task is revoked mid-flight.
    pub fn track(self: &Arc<Self>, task_id: Uuid) -> (InflightGuard, CancellationToken) {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.inflight.insert(
            task_id,
            InflightEntry {
                nonce,
                token: token.clone(),
            },
        );
        (
            InflightGuard {
                registry: Arc::clone(self),
                task_id,
                nonce,
            },
            token,
        )
    }

    /// Cancel the task if it is executing right now.
    pub fn cancel(&self, task_id: &Uuid) -> bool {
        match self.inflight.get(task_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }
}

pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    task_id: Uuid,
    nonce: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.registry
            .inflight
            .remove_if(&self.task_id, |_, entry| entry.nonce == self.nonce);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revocation_marks_persist() {
        let registry = RevocationRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.is_revoked(&id));
        registry.revoke(id);
        registry.revoke(id);
        assert!(registry.is_revoked(&id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_inflight_cancel_fires_token() {
        let registry = Arc::new(InflightRegistry::new());
        let id = Uuid::new_v4();
        let (guard, token) = registry.track(id);
        assert!(!token.is_cancelled());
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        drop(guard);
        assert!(!registry.cancel(&id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_stale_guard_leaves_newer_entry() {
        let registry = Arc::new(InflightRegistry::new());
        let id = Uuid::new_v4();
        let (first_guard, _first_token) = registry.track(id);
        let (_second_guard, second_token) = registry.track(id);
        // First execution finishing must not untrack the second.
        drop(first_guard);
        assert!(registry.cancel(&id));
        assert!(second_token.is_cancelled());
    }
}
