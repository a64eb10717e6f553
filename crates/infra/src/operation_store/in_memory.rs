use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use packline_core::{ExpectedVersion, OperationId};
use packline_operations::{Operation, OperationOrigin, OperationStatus, SyncStatus};

use super::r#trait::{OperationStore, OperationStoreError};

/// In-memory operation store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    operations: RwLock<HashMap<OperationId, Operation>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn select(
        &self,
        limit: usize,
        filter: impl Fn(&Operation) -> bool,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let operations = self
            .operations
            .read()
            .map_err(|_| OperationStoreError::Storage("lock poisoned".to_string()))?;
        let mut selected: Vec<_> = operations.values().filter(|op| filter(op)).cloned().collect();
        selected.sort_by_key(|op| (op.updated_at, op.id));
        selected.truncate(limit);
        Ok(selected)
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn insert(&self, operation: &Operation) -> Result<(), OperationStoreError> {
        let mut operations = self
            .operations
            .write()
            .map_err(|_| OperationStoreError::Storage("lock poisoned".to_string()))?;
        if operations.contains_key(&operation.id) {
            return Err(OperationStoreError::Conflict(format!(
                "operation {} already exists",
                operation.id
            )));
        }
        operations.insert(operation.id, operation.clone());
        Ok(())
    }

    async fn get(&self, id: OperationId) -> Result<Option<Operation>, OperationStoreError> {
        let operations = self
            .operations
            .read()
            .map_err(|_| OperationStoreError::Storage("lock poisoned".to_string()))?;
        Ok(operations.get(&id).cloned())
    }

    async fn save(
        &self,
        operation: &Operation,
        expected: ExpectedVersion,
    ) -> Result<u64, OperationStoreError> {
        let mut operations = self
            .operations
            .write()
            .map_err(|_| OperationStoreError::Storage("lock poisoned".to_string()))?;
        let stored = operations
            .get(&operation.id)
            .ok_or(OperationStoreError::NotFound(operation.id))?;

        if !expected.matches(stored.version) {
            return Err(OperationStoreError::Conflict(format!(
                "operation {}: expected {expected:?}, found {}",
                operation.id, stored.version
            )));
        }

        let mut next = operation.clone();
        next.version = stored.version + 1;
        let version = next.version;
        operations.insert(operation.id, next);
        Ok(version)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Operation>, OperationStoreError> {
        self.select(limit, |op| {
            op.origin == OperationOrigin::Local
                && matches!(
                    op.sync_status,
                    Some(SyncStatus::Pending | SyncStatus::Processing)
                )
        })
    }

    async fn list_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let mut selected = self.select(usize::MAX, |op| {
            op.origin == OperationOrigin::Local
                && op.sync_status == Some(SyncStatus::Failed)
                && op.retry_count < max_retries
        })?;
        selected.sort_by_key(|op| (op.last_attempt_at, op.id));
        selected.truncate(limit);
        Ok(selected)
    }

    async fn list_exhausted(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        self.select(limit, |op| {
            op.origin == OperationOrigin::Local
                && op.sync_status == Some(SyncStatus::Failed)
                && op.retry_count >= max_retries
        })
    }

    async fn list_stale_mirrors(
        &self,
        checked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        self.select(limit, |op| {
            op.origin == OperationOrigin::External
                && matches!(op.status, OperationStatus::Open | OperationStatus::InProgress)
                && op.last_checked_at.is_none_or(|at| at < checked_before)
        })
    }
}
