//! Per-endpoint registry of outstanding requests.
//!
//! Values are weak references, so the registry never extends a request's
//! lifetime. `cancel_all` seals the registry: once an endpoint has been
//! torn down or has failed, no further requests are admitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::error::RequestError;
use crate::request::{Request, RequestId};

/// Counters describing registry activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InflightStats {
    pub total_inserted: u64,
    pub total_removed: u64,
    pub total_cancelled: u64,
    pub rejected: u64,
    pub active_count: usize,
}

#[derive(Default)]
struct RegistryState {
    requests: HashMap<RequestId, Weak<Request>>,
    sealed: bool,
    stats: InflightStats,
}

/// Weak index of an endpoint's unsettled requests.
#[derive(Default)]
pub struct InflightRegistry {
    state: Mutex<RegistryState>,
}

impl InflightRegistry {
    /// Creates an empty, unsealed registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `request`. Returns false if the registry has been sealed.
    pub fn insert(&self, request: &Arc<Request>) -> bool {
        let mut state = self.lock();
        if state.sealed {
            state.stats.rejected += 1;
            return false;
        }
        state.requests.insert(request.id(), Arc::downgrade(request));
        state.stats.total_inserted += 1;
        true
    }

    /// Drops the entry for `id`; a missing key is not an error.
    pub fn remove(&self, id: RequestId) {
        let mut state = self.lock();
        if state.requests.remove(&id).is_some() {
            state.stats.total_removed += 1;
        }
    }

    /// Seals the registry and cancels every request that is still alive
    /// with `error`. Returns how many requests were cancelled.
    pub fn cancel_all(&self, error: RequestError) -> usize {
        let detached = {
            let mut state = self.lock();
            state.sealed = true;
            std::mem::take(&mut state.requests)
        };

        let mut cancelled = 0;
        for request in detached.into_values().filter_map(|weak| weak.upgrade()) {
            if !request.is_ready() {
                request.cancel_with(error.clone());
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!(cancelled, error = %error, "cancelled inflight requests");
        }
        self.lock().stats.total_cancelled += cancelled as u64;
        cancelled
    }

    /// Live requests currently tracked.
    pub fn len(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once `cancel_all` ran; later inserts are rejected.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Counters accumulated since creation.
    pub fn stats(&self) -> InflightStats {
        let state = self.lock();
        InflightStats {
            active_count: state.requests.len(),
            ..state.stats.clone()
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::OperationKind;

    #[test]
    fn test_registry_new() {
        let registry = InflightRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.is_sealed());
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = InflightRegistry::new();
        let a = Request::detached(OperationKind::TagSend, None);
        let b = Request::detached(OperationKind::TagRecv, None);
        assert!(registry.insert(&a));
        assert!(registry.insert(&b));
        assert_eq!(registry.len(), 2);

        registry.remove(a.id());
        registry.remove(a.id());
        assert_eq!(registry.len(), 1);

        let stats = registry.stats();
        assert_eq!(stats.total_inserted, 2);
        assert_eq!(stats.total_removed, 1);
        assert_eq!(stats.active_count, 1);
    }

    #[test]
    fn test_cancel_all_settles_live_requests() {
        let registry = InflightRegistry::new();
        let requests: Vec<_> = (0..3)
            .map(|_| Request::detached(OperationKind::TagRecv, None))
            .collect();
        for request in &requests {
            registry.insert(request);
        }

        assert_eq!(registry.cancel_all(RequestError::ConnectionReset), 3);
        assert!(registry.is_empty());
        for request in &requests {
            assert_eq!(request.status(), Some(Err(RequestError::ConnectionReset)));
        }
    }

    #[test]
    fn test_cancel_all_skips_dropped_and_settled() {
        let registry = InflightRegistry::new();
        let dropped = Request::detached(OperationKind::StreamRecv, None);
        let settled = Request::detached(OperationKind::StreamRecv, None);
        let live = Request::detached(OperationKind::StreamRecv, None);
        registry.insert(&dropped);
        registry.insert(&settled);
        registry.insert(&live);
        drop(dropped);
        settled.settle(Ok(()));

        assert_eq!(registry.cancel_all(RequestError::Cancelled), 1);
        assert_eq!(settled.status(), Some(Ok(())));
        assert_eq!(live.status(), Some(Err(RequestError::Cancelled)));
    }

    #[test]
    fn test_sealed_rejects_inserts() {
        let registry = InflightRegistry::new();
        registry.cancel_all(RequestError::Cancelled);
        assert!(registry.is_sealed());

        let late = Request::detached(OperationKind::TagSend, None);
        assert!(!registry.insert(&late));
        assert!(registry.is_empty());
        assert_eq!(registry.stats().rejected, 1);
        assert_eq!(registry.cancel_all(RequestError::Cancelled), 0);
    }
}
