use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use packline_core::{CommitmentId, ContentId, Entity, OperationId, PackageId};
use packline_inventory::{
    Package, PackageCommitment, PackageContent, PackageMetadata, PackageStatus,
};

use super::r#trait::{check_commit_request, CommitRequest, CommitmentLedger, LedgerError};

#[derive(Debug, Default)]
struct LedgerState {
    packages: HashMap<PackageId, Package>,
    contents: HashMap<ContentId, PackageContent>,
    commitments: HashMap<CommitmentId, PackageCommitment>,
}

impl LedgerState {
    fn package(&self, id: PackageId) -> Result<&Package, LedgerError> {
        self.packages
            .get(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("package {id}")))
    }

    fn content(&self, id: ContentId) -> Result<&PackageContent, LedgerError> {
        self.contents
            .get(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("content {id}")))
    }
}

/// In-memory ledger.
///
/// Intended for tests/dev. Each call runs under one write lock, which stands in
/// for the row lock + transaction of the Postgres implementation.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, LedgerState>, LedgerError> {
        self.state
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, LedgerState>, LedgerError> {
        self.state
            .write()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl CommitmentLedger for InMemoryLedger {
    async fn create_package(
        &self,
        barcode: &str,
        warehouse_code: &str,
        metadata: PackageMetadata,
    ) -> Result<Package, LedgerError> {
        let package = Package::new(barcode, warehouse_code, metadata, Utc::now())?;
        let mut state = self.write()?;
        if state.packages.values().any(|p| p.barcode == package.barcode) {
            return Err(LedgerError::Validation(format!(
                "barcode {} already exists",
                package.barcode
            )));
        }
        state.packages.insert(package.id, package.clone());
        Ok(package)
    }

    async fn set_package_status(
        &self,
        package_id: PackageId,
        status: PackageStatus,
    ) -> Result<Package, LedgerError> {
        let mut state = self.write()?;
        let mut package = state.package(package_id)?.clone();
        package.transition_to(status, Utc::now())?;
        state.packages.insert(package_id, package.clone());
        Ok(package)
    }

    async fn add_content(
        &self,
        package_id: PackageId,
        item_code: &str,
        quantity: i64,
    ) -> Result<PackageContent, LedgerError> {
        if quantity < 0 {
            return Err(LedgerError::Validation("quantity cannot be negative".to_string()));
        }
        let now = Utc::now();
        let mut state = self.write()?;
        state.package(package_id)?.ensure_accepts_stock()?;

        let existing = state
            .contents
            .values()
            .find(|c| c.package_id() == package_id && c.item_code() == item_code)
            .cloned();

        let content = match existing {
            Some(mut content) => {
                if quantity > 0 {
                    content.receive(quantity, now)?;
                }
                content
            }
            None => PackageContent::new(package_id, item_code, quantity, now)?,
        };
        state.contents.insert(*content.id(), content.clone());
        Ok(content)
    }

    async fn commit(&self, request: CommitRequest) -> Result<CommitmentId, LedgerError> {
        let now = Utc::now();
        let mut state = self.write()?;

        let mut content = state.content(request.content_id)?.clone();
        let package = state.package(content.package_id())?;
        check_commit_request(&request, &content, package)?;

        content.reserve(request.quantity, now)?;
        let commitment = PackageCommitment::for_content(&content, request.quantity, request.source, now)?;
        let id = commitment.id;

        state.contents.insert(request.content_id, content);
        state.commitments.insert(id, commitment);
        debug!(commitment_id = %id, content_id = %request.content_id, quantity = request.quantity, "committed");
        Ok(id)
    }

    async fn release(&self, commitment_id: CommitmentId) -> Result<bool, LedgerError> {
        let now = Utc::now();
        let mut state = self.write()?;

        let Some(commitment) = state.commitments.get(&commitment_id).cloned() else {
            return Ok(false);
        };
        let mut content = state.content(commitment.content_id)?.clone();
        content.release(commitment.quantity, now)?;

        state.contents.insert(commitment.content_id, content);
        state.commitments.remove(&commitment_id);
        debug!(commitment_id = %commitment_id, quantity = commitment.quantity, "released");
        Ok(true)
    }

    async fn consume(
        &self,
        commitment_id: CommitmentId,
        actual_quantity: i64,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let mut state = self.write()?;

        let commitment = state
            .commitments
            .get(&commitment_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("commitment {commitment_id}")))?;
        let mut content = state.content(commitment.content_id)?.clone();
        content.consume(commitment.quantity, actual_quantity, now)?;

        state.contents.insert(commitment.content_id, content);
        state.commitments.remove(&commitment_id);
        debug!(commitment_id = %commitment_id, reserved = commitment.quantity, actual_quantity, "consumed");
        Ok(())
    }

    async fn receive(&self, content_id: ContentId, quantity: i64) -> Result<PackageContent, LedgerError> {
        let now = Utc::now();
        let mut state = self.write()?;

        let mut content = state.content(content_id)?.clone();
        state.package(content.package_id())?.ensure_accepts_stock()?;
        content.receive(quantity, now)?;
        state.contents.insert(content_id, content.clone());
        Ok(content)
    }

    async fn find_commitments(
        &self,
        source_operation_id: OperationId,
    ) -> Result<Vec<PackageCommitment>, LedgerError> {
        let state = self.read()?;
        let mut found: Vec<_> = state
            .commitments
            .values()
            .filter(|c| c.source.operation_id == source_operation_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| (c.committed_at, c.id));
        Ok(found)
    }

    async fn content_commitments(
        &self,
        content_id: ContentId,
    ) -> Result<Vec<PackageCommitment>, LedgerError> {
        let state = self.read()?;
        let mut found: Vec<_> = state
            .commitments
            .values()
            .filter(|c| c.content_id == content_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| (c.committed_at, c.id));
        Ok(found)
    }

    async fn get_package(&self, package_id: PackageId) -> Result<Option<Package>, LedgerError> {
        Ok(self.read()?.packages.get(&package_id).cloned())
    }

    async fn get_content(&self, content_id: ContentId) -> Result<Option<PackageContent>, LedgerError> {
        Ok(self.read()?.contents.get(&content_id).cloned())
    }

    async fn list_contents(&self, package_id: PackageId) -> Result<Vec<PackageContent>, LedgerError> {
        let state = self.read()?;
        let mut contents: Vec<_> = state
            .contents
            .values()
            .filter(|c| c.package_id() == package_id)
            .cloned()
            .collect();
        contents.sort_by(|a, b| a.item_code().cmp(b.item_code()));
        Ok(contents)
    }

    async fn get_commitment(
        &self,
        commitment_id: CommitmentId,
    ) -> Result<Option<PackageCommitment>, LedgerError> {
        Ok(self.read()?.commitments.get(&commitment_id).cloned())
    }
}
