use async_trait::async_trait;
use thiserror::Error;

use packline_core::{CommitmentId, ContentId, DomainError, OperationId, PackageId};
use packline_inventory::{
    Package, PackageCommitment, PackageContent, PackageMetadata, PackageStatus, SourceOperation,
};

/// Ledger operation error.
///
/// Everything except `ConcurrencyConflict` and `Storage` is deterministic and
/// must not be retried by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient available quantity: requested {requested}, available {available}")]
    InsufficientAvailableQuantity { requested: i64, available: i64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Overcommits and rejected inputs: the caller's request is wrong, not the system.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientAvailableQuantity { .. } | LedgerError::Validation(_)
        )
    }
}

impl From<DomainError> for LedgerError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvariantViolation(msg) | DomainError::InvalidId(msg) => {
                LedgerError::Validation(msg)
            }
            DomainError::NotFound => LedgerError::NotFound("record".to_string()),
            DomainError::Conflict(msg) => LedgerError::ConcurrencyConflict(msg),
        }
    }
}

/// Input for [`CommitmentLedger::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub content_id: ContentId,
    /// Item code the caller believes the content holds; checked when set.
    pub expected_item_code: Option<String>,
    pub quantity: i64,
    pub source: SourceOperation,
}

/// Packages, contents and the commitments reserved against them.
///
/// Every mutating call is atomic and serialized per content: it locks the
/// content before evaluating `0 <= committed_quantity <= quantity` and either
/// applies completely or not at all.
#[async_trait]
pub trait CommitmentLedger: Send + Sync {
    /// Create a package in `Init`. Barcodes are unique.
    async fn create_package(
        &self,
        barcode: &str,
        warehouse_code: &str,
        metadata: PackageMetadata,
    ) -> Result<Package, LedgerError>;

    async fn set_package_status(
        &self,
        package_id: PackageId,
        status: PackageStatus,
    ) -> Result<Package, LedgerError>;

    /// Create the content row for `item_code`, or add to the existing one.
    async fn add_content(
        &self,
        package_id: PackageId,
        item_code: &str,
        quantity: i64,
    ) -> Result<PackageContent, LedgerError>;

    /// Reserve stock for an operation line.
    async fn commit(&self, request: CommitRequest) -> Result<CommitmentId, LedgerError>;

    /// Drop a commitment and give its quantity back. Unknown ids are a no-op
    /// (returns `false`).
    async fn release(&self, commitment_id: CommitmentId) -> Result<bool, LedgerError>;

    /// Retire a commitment, removing `actual_quantity` from the content.
    /// The rest of the reservation goes back to available.
    async fn consume(
        &self,
        commitment_id: CommitmentId,
        actual_quantity: i64,
    ) -> Result<(), LedgerError>;

    /// Add received stock to a content.
    async fn receive(&self, content_id: ContentId, quantity: i64) -> Result<PackageContent, LedgerError>;

    async fn find_commitments(
        &self,
        source_operation_id: OperationId,
    ) -> Result<Vec<PackageCommitment>, LedgerError>;

    async fn content_commitments(
        &self,
        content_id: ContentId,
    ) -> Result<Vec<PackageCommitment>, LedgerError>;

    async fn get_package(&self, package_id: PackageId) -> Result<Option<Package>, LedgerError>;

    async fn get_content(&self, content_id: ContentId) -> Result<Option<PackageContent>, LedgerError>;

    async fn list_contents(&self, package_id: PackageId) -> Result<Vec<PackageContent>, LedgerError>;

    async fn get_commitment(
        &self,
        commitment_id: CommitmentId,
    ) -> Result<Option<PackageCommitment>, LedgerError>;
}

pub(crate) fn check_commit_request(
    request: &CommitRequest,
    content: &PackageContent,
    package: &Package,
) -> Result<(), LedgerError> {
    if request.quantity <= 0 {
        return Err(LedgerError::Validation(
            "commit quantity must be positive".to_string(),
        ));
    }
    if let Some(expected) = request.expected_item_code.as_deref() {
        if expected != content.item_code() {
            return Err(LedgerError::Validation(format!(
                "content holds {}, not {expected}",
                content.item_code()
            )));
        }
    }
    package.ensure_accepts_commitments()?;
    if request.quantity > content.available() {
        return Err(LedgerError::InsufficientAvailableQuantity {
            requested: request.quantity,
            available: content.available(),
        });
    }
    Ok(())
}
