//! Registry of in-flight operations.
//!
//! A single mutex guards the map. `cancel` and `retire` both remove the entry under
//! that lock, so exactly one of them wins for a given operation: a cancel that loses
//! to natural completion returns `false`, and an owner whose `retire` returns `false`
//! knows it was cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::error::RegistryError;
use crate::models::OperationKind;
use crate::orchestrator::state::Operation;

/// What the registry knows about a live operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    pub kind: OperationKind,
    pub pid: Option<u32>,
    pub build_id: Option<u64>,
}

struct Entry {
    handle: OperationHandle,
    cancel_tx: watch::Sender<bool>,
    snapshot: Operation,
}

#[derive(Clone, Default)]
pub struct OperationRegistry {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new operation and hand back its cancellation receiver.
    pub fn register(&self, operation: &Operation) -> Result<watch::Receiver<bool>, RegistryError> {
        self.register_with_build(operation, None)
    }

    pub fn register_with_build(
        &self,
        operation: &Operation,
        build_id: Option<u64>,
    ) -> Result<watch::Receiver<bool>, RegistryError> {
        let mut map = self.lock();
        if map.contains_key(&operation.id) {
            return Err(RegistryError::Duplicate(operation.id.clone()));
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        map.insert(
            operation.id.clone(),
            Entry {
                handle: OperationHandle {
                    kind: operation.kind,
                    pid: None,
                    build_id,
                },
                cancel_tx,
                snapshot: operation.clone(),
            },
        );
        log::debug!("[Registry] Registered {} operation {}", operation.kind, operation.id);
        Ok(cancel_rx)
    }

    /// Record the pid of the child currently owned by the operation.
    pub fn attach_pid(&self, id: &str, pid: Option<u32>) {
        if let Some(entry) = self.lock().get_mut(id) {
            entry.handle.pid = pid;
        }
    }

    pub fn lookup(&self, id: &str) -> Option<OperationHandle> {
        self.lock().get(id).map(|entry| entry.handle.clone())
    }

    /// Find the live operation driving a build record.
    pub fn find_build(&self, build_id: u64) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, entry)| entry.handle.build_id == Some(build_id))
            .map(|(id, _)| id.clone())
    }

    /// Signal cancellation and remove the entry. `false` if not active.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(entry) => {
                log::info!("[Registry] Cancelling operation {}", id);
                // Receiver gone means the owner already finished; still counts as removed
                let _ = entry.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }

    /// Remove the entry on natural completion. `false` if a cancel got there first.
    pub fn retire(&self, id: &str) -> bool {
        let retired = self.lock().remove(id).is_some();
        if retired {
            log::debug!("[Registry] Retired operation {}", id);
        }
        retired
    }

    /// Replace the published snapshot of a live operation.
    pub fn update(&self, operation: &Operation) {
        if let Some(entry) = self.lock().get_mut(&operation.id) {
            entry.snapshot = operation.clone();
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<Operation> {
        self.lock().get(id).map(|entry| entry.snapshot.clone())
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = OperationRegistry::new();
        let op = Operation::new(OperationKind::Build);
        let rx = registry.register_with_build(&op, Some(12)).unwrap();

        assert!(!*rx.borrow());
        registry.attach_pid(&op.id, Some(4242));

        let handle = registry.lookup(&op.id).unwrap();
        assert_eq!(handle.pid, Some(4242));
        assert_eq!(registry.find_build(12), Some(op.id.clone()));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = OperationRegistry::new();
        let op = Operation::new(OperationKind::Build);
        registry.register(&op).unwrap();
        assert_eq!(
            registry.register(&op).unwrap_err(),
            RegistryError::Duplicate(op.id.clone())
        );
    }

    #[test]
    fn test_cancel_signals_and_removes() {
        let registry = OperationRegistry::new();
        let op = Operation::new(OperationKind::DeviceCommand);
        let rx = registry.register(&op).unwrap();

        assert!(registry.cancel(&op.id));
        assert!(*rx.borrow());
        assert!(registry.lookup(&op.id).is_none());
        assert!(!registry.cancel(&op.id));
    }

    #[test]
    fn test_cancel_and_retire_are_exclusive() {
        let registry = OperationRegistry::new();

        let finished = Operation::new(OperationKind::Build);
        let rx = registry.register(&finished).unwrap();
        assert!(registry.retire(&finished.id));
        assert!(!registry.cancel(&finished.id));
        assert!(!*rx.borrow());

        let cancelled = Operation::new(OperationKind::Build);
        registry.register(&cancelled).unwrap();
        assert!(registry.cancel(&cancelled.id));
        assert!(!registry.retire(&cancelled.id));
    }

    #[test]
    fn test_snapshots() {
        let registry = OperationRegistry::new();
        let mut op = Operation::new(OperationKind::Recovery);
        registry.register(&op).unwrap();

        op.start().unwrap();
        op.set_progress(50);
        registry.update(&op);

        let snapshot = registry.snapshot(&op.id).unwrap();
        assert_eq!(snapshot.progress, 50);
        assert_eq!(registry.active_ids(), vec![op.id.clone()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_ids() {
        let registry = OperationRegistry::new();
        assert!(!registry.cancel("missing"));
        assert!(!registry.retire("missing"));
        assert!(registry.snapshot("missing").is_none());
        assert!(registry.is_empty());
    }
}
