//! Build configuration and record persistence seam.
//!
//! The orchestrator only needs four calls from the host's database layer. An
//! in-memory implementation ships for hosts without one and for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::models::{BuildRecord, BuildRecordUpdate, KernelConfiguration};

/// Storage collaborator used by the build orchestrator.
pub trait BuildStore: Send + Sync {
    fn get_build_configuration(&self, id: u64) -> Result<KernelConfiguration, StoreError>;

    fn create_build_record(&self, configuration_id: u64) -> Result<BuildRecord, StoreError>;

    fn get_build_record(&self, id: u64) -> Result<BuildRecord, StoreError>;

    /// Apply a partial update and return the new record.
    fn update_build_record(&self, id: u64, update: BuildRecordUpdate) -> Result<BuildRecord, StoreError>;
}

#[derive(Default)]
struct StoreState {
    configurations: HashMap<u64, KernelConfiguration>,
    records: HashMap<u64, BuildRecord>,
    next_configuration_id: u64,
    next_record_id: u64,
}

#[derive(Default)]
pub struct InMemoryBuildStore {
    state: Mutex<StoreState>,
}

impl InMemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a configuration. An `id` of 0 allocates a new one; returns the id used.
    pub fn insert_configuration(&self, mut configuration: KernelConfiguration) -> u64 {
        let mut state = self.lock();
        if configuration.id == 0 {
            state.next_configuration_id += 1;
            configuration.id = state.next_configuration_id;
        } else {
            state.next_configuration_id = state.next_configuration_id.max(configuration.id);
        }
        let id = configuration.id;
        state.configurations.insert(id, configuration);
        id
    }

    pub fn records(&self) -> Vec<BuildRecord> {
        let mut records: Vec<BuildRecord> = self.lock().records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}

impl BuildStore for InMemoryBuildStore {
    fn get_build_configuration(&self, id: u64) -> Result<KernelConfiguration, StoreError> {
        self.lock()
            .configurations
            .get(&id)
            .cloned()
            .ok_or(StoreError::ConfigurationNotFound(id))
    }

    fn create_build_record(&self, configuration_id: u64) -> Result<BuildRecord, StoreError> {
        let mut state = self.lock();
        if !state.configurations.contains_key(&configuration_id) {
            return Err(StoreError::ConfigurationNotFound(configuration_id));
        }
        state.next_record_id += 1;
        let record = BuildRecord::new(state.next_record_id, configuration_id);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn get_build_record(&self, id: u64) -> Result<BuildRecord, StoreError> {
        self.lock()
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::RecordNotFound(id))
    }

    fn update_build_record(&self, id: u64, update: BuildRecordUpdate) -> Result<BuildRecord, StoreError> {
        let mut state = self.lock();
        let record = state.records.get_mut(&id).ok_or(StoreError::RecordNotFound(id))?;
        update.apply(record);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationStatus;

    #[test]
    fn test_configuration_ids() {
        let store = InMemoryBuildStore::new();
        let a = store.insert_configuration(KernelConfiguration::default());
        let b = store.insert_configuration(KernelConfiguration {
            id: 10,
            ..Default::default()
        });
        let c = store.insert_configuration(KernelConfiguration::default());
        assert_eq!((a, b, c), (1, 10, 11));
        assert_eq!(store.get_build_configuration(10).unwrap().id, 10);
    }

    #[test]
    fn test_record_lifecycle() {
        let store = InMemoryBuildStore::new();
        let config_id = store.insert_configuration(KernelConfiguration::default());
        let record = store.create_build_record(config_id).unwrap();
        assert_eq!(record.status, OperationStatus::Pending);

        let updated = store
            .update_build_record(
                record.id,
                BuildRecordUpdate::status(OperationStatus::Running).with_step("Starting"),
            )
            .unwrap();
        assert_eq!(updated.status, OperationStatus::Running);
        assert_eq!(store.get_build_record(record.id).unwrap().current_step, "Starting");
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn test_missing_entities() {
        let store = InMemoryBuildStore::new();
        assert_eq!(
            store.create_build_record(3).unwrap_err(),
            StoreError::ConfigurationNotFound(3)
        );
        assert_eq!(
            store.update_build_record(9, BuildRecordUpdate::default()).unwrap_err(),
            StoreError::RecordNotFound(9)
        );
    }
}
