use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use packline_core::{ExpectedVersion, OperationId};
use packline_operations::Operation;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationStoreError {
    #[error("operation not found: {0}")]
    NotFound(OperationId),

    /// The record changed since it was loaded.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Persistence for operations and their lines.
///
/// `save` writes the whole record (header + lines) atomically and bumps
/// `version`; callers pass the version they loaded so lost updates surface as
/// `Conflict`.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn insert(&self, operation: &Operation) -> Result<(), OperationStoreError>;

    async fn get(&self, id: OperationId) -> Result<Option<Operation>, OperationStoreError>;

    /// Persist `operation`, returning the new version.
    async fn save(
        &self,
        operation: &Operation,
        expected: ExpectedVersion,
    ) -> Result<u64, OperationStoreError>;

    /// Local operations waiting for their first push, oldest first: sync
    /// status `Pending`, or `Processing` left behind by an interrupted attempt.
    async fn list_pending(&self, limit: usize) -> Result<Vec<Operation>, OperationStoreError>;

    /// Local `Failed` operations with `retry_count < max_retries`, least
    /// recently attempted first. Backoff is left to the caller.
    async fn list_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError>;

    /// Local `Failed` operations that reached the retry ceiling but are not yet abandoned.
    async fn list_exhausted(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError>;

    /// Open external mirrors not checked since `checked_before`.
    async fn list_stale_mirrors(
        &self,
        checked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError>;
}
