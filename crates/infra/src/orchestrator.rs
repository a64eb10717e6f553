//! Operation lifecycle orchestration.
//!
//! `OperationOrchestrator` composes the three seams of the system:
//!
//! ```text
//! request ──> OperationStore (load, version check)
//!               │
//!               ├── CommitmentLedger (commit / release / consume / receive)
//!               │
//!               └── SyncAdapter (push, status query)
//! ```
//!
//! Every mutating call takes a per-operation async lock, reloads the operation,
//! applies a domain transition and saves with `ExpectedVersion::Exact`. Holding
//! the lock across the ERP round-trip in [`OperationOrchestrator::process`] is
//! what makes a concurrent `cancel` wait for the push to settle.
//!
//! ## Finalization order
//!
//! After a successful push the external reference is saved *before* any
//! commitment is consumed. A crash in between leaves an operation with an
//! external entry but without `Synced`; the next `process` call sees the entry
//! and resumes finalization without pushing again.
//!
//! Adapter failures inside `process` are not errors: they are persisted on the
//! operation and reported through [`ProcessOutcome`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use packline_core::{ContentId, DomainError, ExpectedVersion, OperationId, OperationLineId};
use packline_inventory::SourceOperation;
use packline_operations::{
    ExternalRef, LineState, Operation, OperationKind, OperationLine, OperationOrigin,
    OperationStatus, SyncStatus,
};

use crate::external::{DocumentKind, ErpError, ExternalDocumentStatus, SyncAdapter, SyncLine};
use crate::ledger::{CommitRequest, CommitmentLedger, LedgerError};
use crate::operation_store::{OperationStore, OperationStoreError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Deterministic domain rejection (bad input, illegal transition).
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] OperationStoreError),

    /// ERP failure outside `process` (mirror status queries).
    #[error(transparent)]
    Erp(#[from] ErpError),

    #[error("operation not found: {0}")]
    NotFound(OperationId),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl OrchestratorError {
    /// True when retrying the same request cannot succeed.
    pub fn is_deterministic(&self) -> bool {
        match self {
            OrchestratorError::Domain(_)
            | OrchestratorError::NotFound(_)
            | OrchestratorError::InvalidState(_) => true,
            OrchestratorError::Ledger(err) => err.is_validation(),
            OrchestratorError::Erp(err) => !err.is_transient(),
            OrchestratorError::Store(_) => false,
        }
    }
}

/// Result of one `process` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Finalized. `pushed` is false when an earlier attempt had already
    /// posted the document and only the ledger side was completed.
    Synced { external: ExternalRef, pushed: bool },
    /// Nothing to do.
    AlreadySynced,
    /// Transient failure persisted; the scheduler will retry.
    RetryScheduled { error: String, retry_count: u32 },
    /// Permanent failure persisted; needs manual resolution.
    Abandoned { error: String },
}

/// Per-operation async locks. Entries nobody holds are pruned as the map grows.
#[derive(Debug, Default)]
struct OperationLocks {
    inner: Mutex<HashMap<OperationId, Arc<tokio::sync::Mutex<()>>>>,
}

const LOCK_PRUNE_THRESHOLD: usize = 1024;

impl OperationLocks {
    async fn acquire(&self, id: OperationId) -> Result<OwnedMutexGuard<()>, OrchestratorError> {
        let lock = {
            let mut map = self
                .inner
                .lock()
                .map_err(|_| OrchestratorError::InvalidState("operation lock table poisoned".to_string()))?;
            if map.len() > LOCK_PRUNE_THRESHOLD {
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            map.entry(id).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }
}

pub struct OperationOrchestrator {
    ledger: Arc<dyn CommitmentLedger>,
    store: Arc<dyn OperationStore>,
    adapter: Arc<dyn SyncAdapter>,
    locks: OperationLocks,
}

impl OperationOrchestrator {
    pub fn new(
        ledger: Arc<dyn CommitmentLedger>,
        store: Arc<dyn OperationStore>,
        adapter: Arc<dyn SyncAdapter>,
    ) -> Self {
        Self {
            ledger,
            store,
            adapter,
            locks: OperationLocks::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<dyn CommitmentLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub fn adapter(&self) -> &Arc<dyn SyncAdapter> {
        &self.adapter
    }

    pub async fn get_operation(&self, operation_id: OperationId) -> Result<Operation, OrchestratorError> {
        self.store
            .get(operation_id)
            .await?
            .ok_or(OrchestratorError::NotFound(operation_id))
    }

    async fn save(&self, operation: &mut Operation) -> Result<(), OrchestratorError> {
        let version = self
            .store
            .save(operation, ExpectedVersion::Exact(operation.version))
            .await?;
        operation.version = version;
        Ok(())
    }

    pub async fn create_operation(
        &self,
        kind: OperationKind,
        warehouse_code: &str,
        comments: Option<String>,
    ) -> Result<Operation, OrchestratorError> {
        let operation = Operation::new(kind, warehouse_code, comments, Utc::now())?;
        self.store.insert(&operation).await?;
        info!(operation_id = %operation.id, %kind, warehouse = warehouse_code, "operation created");
        Ok(operation)
    }

    /// Mirror an ERP-owned document (pick list) locally.
    pub async fn import_external(
        &self,
        kind: OperationKind,
        external: ExternalRef,
        warehouse_code: &str,
    ) -> Result<Operation, OrchestratorError> {
        let operation = Operation::mirror(kind, external, warehouse_code, Utc::now())?;
        self.store.insert(&operation).await?;
        info!(
            operation_id = %operation.id,
            %kind,
            external_entry = external.entry,
            "external document imported"
        );
        Ok(operation)
    }

    /// Add a line. Reserving kinds commit stock first; the commitment is
    /// released again if the line cannot be recorded.
    pub async fn add_line(
        &self,
        operation_id: OperationId,
        content_id: ContentId,
        item_code: &str,
        quantity: i64,
    ) -> Result<OperationLine, OrchestratorError> {
        let _guard = self.locks.acquire(operation_id).await?;
        let mut operation = self.get_operation(operation_id).await?;
        if !operation.is_editable() {
            return Err(OrchestratorError::InvalidState(format!(
                "operation {operation_id} is {} and can no longer be edited",
                operation.status
            )));
        }

        let line_id = OperationLineId::new();
        let commitment_id = if operation.kind.reserves_stock() {
            let request = CommitRequest {
                content_id,
                expected_item_code: Some(item_code.to_string()),
                quantity,
                source: SourceOperation {
                    kind: operation.kind.source_type(),
                    operation_id,
                    line_id,
                },
            };
            Some(self.ledger.commit(request).await?)
        } else {
            let content = self
                .ledger
                .get_content(content_id)
                .await?
                .ok_or_else(|| LedgerError::NotFound(format!("content {content_id}")))?;
            if content.item_code() != item_code {
                return Err(LedgerError::Validation(format!(
                    "content {content_id} holds {}, not {item_code}",
                    content.item_code()
                ))
                .into());
            }
            None
        };

        let line = OperationLine {
            id: line_id,
            item_code: item_code.to_string(),
            content_id,
            quantity,
            actual_quantity: None,
            commitment_id,
            state: if commitment_id.is_some() {
                LineState::Reserved
            } else {
                LineState::Pending
            },
        };

        let recorded = match operation.add_line(line.clone(), Utc::now()) {
            Ok(()) => self.save(&mut operation).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = recorded {
            if let Some(commitment_id) = commitment_id {
                match self.ledger.release(commitment_id).await {
                    Ok(_) => debug!(%commitment_id, "released commitment of unrecorded line"),
                    Err(release_err) => warn!(
                        operation_id = %operation_id,
                        %commitment_id,
                        error = %release_err,
                        "orphaned commitment; release it manually"
                    ),
                }
            }
            return Err(err);
        }

        debug!(operation_id = %operation_id, line_id = %line_id, quantity, "line added");
        Ok(line)
    }

    /// Drop a line and release its commitment.
    pub async fn remove_line(
        &self,
        operation_id: OperationId,
        line_id: OperationLineId,
    ) -> Result<(), OrchestratorError> {
        let _guard = self.locks.acquire(operation_id).await?;
        let mut operation = self.get_operation(operation_id).await?;
        let line = operation.remove_line(line_id, Utc::now())?;
        self.save(&mut operation).await?;

        if let Some(commitment_id) = line.commitment_id {
            if let Err(err) = self.ledger.release(commitment_id).await {
                warn!(
                    operation_id = %operation_id,
                    %commitment_id,
                    error = %err,
                    "line removed but its commitment could not be released"
                );
                return Err(err.into());
            }
        }
        debug!(operation_id = %operation_id, line_id = %line_id, "line removed");
        Ok(())
    }

    pub async fn set_actual_quantity(
        &self,
        operation_id: OperationId,
        line_id: OperationLineId,
        quantity: i64,
    ) -> Result<Operation, OrchestratorError> {
        self.transition(operation_id, |op| op.set_actual_quantity(line_id, quantity, Utc::now()))
            .await
    }

    pub async fn start(&self, operation_id: OperationId) -> Result<Operation, OrchestratorError> {
        self.transition(operation_id, |op| op.start(Utc::now())).await
    }

    /// Queue for the scheduler without touching the ERP.
    pub async fn submit(&self, operation_id: OperationId) -> Result<Operation, OrchestratorError> {
        let operation = self.transition(operation_id, |op| op.submit(Utc::now())).await?;
        info!(operation_id = %operation_id, "operation submitted for sync");
        Ok(operation)
    }

    pub async fn abandon(&self, operation_id: OperationId, reason: &str) -> Result<Operation, OrchestratorError> {
        let operation = self
            .transition(operation_id, |op| op.abandon(reason, Utc::now()))
            .await?;
        warn!(operation_id = %operation_id, reason, "operation abandoned");
        Ok(operation)
    }

    pub async fn retry_abandoned(&self, operation_id: OperationId) -> Result<Operation, OrchestratorError> {
        let operation = self
            .transition(operation_id, |op| op.retry_abandoned(Utc::now()))
            .await?;
        info!(operation_id = %operation_id, "abandoned operation re-queued");
        Ok(operation)
    }

    async fn transition<F>(&self, operation_id: OperationId, apply: F) -> Result<Operation, OrchestratorError>
    where
        F: FnOnce(&mut Operation) -> Result<(), DomainError>,
    {
        let _guard = self.locks.acquire(operation_id).await?;
        let mut operation = self.get_operation(operation_id).await?;
        apply(&mut operation)?;
        self.save(&mut operation).await?;
        Ok(operation)
    }

    /// Release every outstanding commitment and mark the operation cancelled.
    ///
    /// Waits for an in-flight `process` on the same operation.
    pub async fn cancel(&self, operation_id: OperationId) -> Result<Operation, OrchestratorError> {
        let _guard = self.locks.acquire(operation_id).await?;
        let mut operation = self.get_operation(operation_id).await?;
        operation.ensure_cancellable()?;
        self.cancel_locked(&mut operation).await?;
        Ok(operation)
    }

    async fn cancel_locked(&self, operation: &mut Operation) -> Result<(), OrchestratorError> {
        let commitments = self.ledger.find_commitments(operation.id).await?;
        let mut released = 0usize;
        for commitment in &commitments {
            if self.ledger.release(commitment.id).await? {
                released += 1;
            }
        }
        operation.mark_cancelled(Utc::now());
        self.save(operation).await?;
        info!(operation_id = %operation.id, released, "operation cancelled");
        Ok(())
    }

    /// Push a local operation to the ERP and finalize it in the ledger.
    ///
    /// Calls the adapter at most once per successful completion: an operation
    /// that already carries an external entry is finalized without a push.
    pub async fn process(&self, operation_id: OperationId) -> Result<ProcessOutcome, OrchestratorError> {
        let _guard = self.locks.acquire(operation_id).await?;
        let mut operation = self.get_operation(operation_id).await?;

        if operation.origin != OperationOrigin::Local {
            return Err(OrchestratorError::InvalidState(format!(
                "operation {operation_id} mirrors an ERP document and is never pushed"
            )));
        }
        if operation.sync_status == Some(SyncStatus::Synced) {
            return Ok(ProcessOutcome::AlreadySynced);
        }

        if let Some(external) = operation.external_ref() {
            info!(
                operation_id = %operation_id,
                external_entry = external.entry,
                "resuming finalization of posted operation"
            );
            return self.finalize(&mut operation, external, false).await;
        }

        if operation.status == OperationStatus::Processing {
            // Left behind by a process that stopped mid-push: the ERP may or may
            // not hold the document, so a blind re-push could duplicate it.
            let error = "push interrupted before the ERP answered; verify the document in the ERP before retrying";
            operation.mark_sync_failed(error, false, Utc::now());
            self.save(&mut operation).await?;
            warn!(operation_id = %operation_id, "interrupted push parked for manual resolution");
            return Ok(ProcessOutcome::Abandoned {
                error: error.to_string(),
            });
        }

        operation.begin_processing(Utc::now())?;
        self.save(&mut operation).await?;

        let pushed = self.push(&operation).await;
        match pushed {
            Ok(external) => {
                info!(
                    operation_id = %operation_id,
                    adapter = self.adapter.name(),
                    external_entry = external.entry,
                    external_number = external.number,
                    "document posted"
                );
                operation.record_external(external, Utc::now())?;
                self.save(&mut operation).await?;
                self.finalize(&mut operation, external, true).await
            }
            Err(err) => {
                let transient = err.is_transient();
                let message = err.to_string();
                operation.mark_sync_failed(message.clone(), transient, Utc::now());
                self.save(&mut operation).await?;
                if transient {
                    warn!(
                        operation_id = %operation_id,
                        retry_count = operation.retry_count,
                        error = %message,
                        "push failed; retry scheduled"
                    );
                    Ok(ProcessOutcome::RetryScheduled {
                        error: message,
                        retry_count: operation.retry_count,
                    })
                } else {
                    warn!(operation_id = %operation_id, error = %message, "push rejected; operation abandoned");
                    Ok(ProcessOutcome::Abandoned { error: message })
                }
            }
        }
    }

    async fn push(&self, operation: &Operation) -> Result<ExternalRef, ErpError> {
        let lines = SyncLine::from_operation(operation);
        let comments = operation.comments.as_deref();
        match operation.kind {
            OperationKind::Counting => {
                let series = self.adapter.get_next_series_number(DocumentKind::Counting).await?;
                self.adapter
                    .push_counting(operation.id, &operation.warehouse_code, &lines, series)
                    .await
            }
            OperationKind::Transfer | OperationKind::Pick => {
                self.adapter
                    .push_transfer(operation.id, &operation.warehouse_code, comments, &lines)
                    .await
            }
            OperationKind::Receipt => {
                self.adapter
                    .push_receipt(operation.id, &operation.warehouse_code, comments, &lines)
                    .await
            }
        }
    }

    /// Apply a posted document to the ledger. Each line is saved as it
    /// completes, so a resumed finalization skips finished lines.
    async fn finalize(
        &self,
        operation: &mut Operation,
        external: ExternalRef,
        pushed: bool,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        if let Err(err) = self.settle_lines(operation).await {
            let OrchestratorError::InvalidState(reason) = err else {
                return Err(err);
            };
            // Posted in the ERP but not reconcilable here: park for manual resolution.
            operation.mark_sync_failed(reason.clone(), false, Utc::now());
            self.save(operation).await?;
            warn!(
                operation_id = %operation.id,
                external_entry = external.entry,
                error = %reason,
                "posted operation could not be finalized"
            );
            return Ok(ProcessOutcome::Abandoned { error: reason });
        }
        operation.mark_synced(Utc::now());
        self.save(operation).await?;
        info!(operation_id = %operation.id, external_entry = external.entry, "operation synced");
        Ok(ProcessOutcome::Synced { external, pushed })
    }

    async fn settle_lines(&self, operation: &mut Operation) -> Result<(), OrchestratorError> {
        let open_lines: Vec<OperationLine> = operation
            .lines
            .iter()
            .filter(|l| matches!(l.state, LineState::Reserved | LineState::Pending))
            .cloned()
            .collect();

        for line in open_lines {
            let quantity = line.effective_quantity();
            match (line.state, line.commitment_id) {
                (LineState::Reserved, Some(commitment_id)) => {
                    // A consumed line is skipped above; a reserved line whose
                    // commitment is gone was released elsewhere, and stock was
                    // never deducted for it.
                    match self.ledger.consume(commitment_id, quantity).await {
                        Ok(()) => {}
                        Err(LedgerError::NotFound(_)) => {
                            return Err(OrchestratorError::InvalidState(format!(
                                "line {} lost commitment {commitment_id} before it was consumed",
                                line.id
                            )));
                        }
                        Err(err) => return Err(err.into()),
                    }
                    operation.mark_line_consumed(line.id, Utc::now())?;
                }
                (LineState::Pending, None) => {
                    if quantity > 0 {
                        self.ledger.receive(line.content_id, quantity).await?;
                    }
                    operation.mark_line_received(line.id, Utc::now())?;
                }
                (state, _) => {
                    return Err(OrchestratorError::InvalidState(format!(
                        "line {} is {} without a matching commitment",
                        line.id,
                        state.as_str()
                    )));
                }
            }
            self.save(operation).await?;
        }
        Ok(())
    }

    /// Fold an ERP-side status into a mirror.
    pub async fn apply_external_status(
        &self,
        operation_id: OperationId,
        status: ExternalDocumentStatus,
    ) -> Result<Operation, OrchestratorError> {
        let _guard = self.locks.acquire(operation_id).await?;
        let mut operation = self.get_operation(operation_id).await?;
        if operation.origin != OperationOrigin::External {
            return Err(OrchestratorError::InvalidState(format!(
                "operation {operation_id} is local; ERP status only applies to mirrors"
            )));
        }

        if operation.status.is_terminal() {
            operation.touch_checked(Utc::now());
            self.save(&mut operation).await?;
            return Ok(operation);
        }

        match status {
            ExternalDocumentStatus::Cancelled => {
                operation.touch_checked(Utc::now());
                self.cancel_locked(&mut operation).await?;
            }
            ExternalDocumentStatus::Closed => {
                operation.touch_checked(Utc::now());
                self.settle_lines(&mut operation).await?;
                operation.mark_synced(Utc::now());
                self.save(&mut operation).await?;
                info!(operation_id = %operation_id, "mirror closed in ERP; commitments consumed");
            }
            ExternalDocumentStatus::Open | ExternalDocumentStatus::Released => {
                operation.touch_checked(Utc::now());
                self.save(&mut operation).await?;
                debug!(operation_id = %operation_id, ?status, "mirror still open");
            }
        }
        Ok(operation)
    }

    /// Query the ERP for a mirror's document and apply the answer.
    pub async fn refresh_mirror(&self, operation_id: OperationId) -> Result<Operation, OrchestratorError> {
        let operation = self.get_operation(operation_id).await?;
        let entry = operation.external_entry.ok_or_else(|| {
            OrchestratorError::InvalidState(format!("operation {operation_id} has no external entry"))
        })?;
        let status = self.adapter.query_document_status(entry).await?;
        self.apply_external_status(operation_id, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::SimulatedErp;
    use crate::ledger::InMemoryLedger;
    use crate::operation_store::InMemoryOperationStore;
    use packline_core::Entity;
    use packline_inventory::{PackageMetadata, PackageStatus};

    struct Fixture {
        orchestrator: OperationOrchestrator,
        erp: Arc<SimulatedErp>,
        ledger: Arc<InMemoryLedger>,
        content_id: ContentId,
    }

    async fn fixture(quantity: i64) -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let package = ledger
            .create_package("PKG-1", "WH01", PackageMetadata::new())
            .await
            .unwrap();
        let content = ledger.add_content(package.id, "ITEM-1", quantity).await.unwrap();
        ledger
            .set_package_status(package.id, PackageStatus::Active)
            .await
            .unwrap();
        let erp = Arc::new(SimulatedErp::new());
        let orchestrator = OperationOrchestrator::new(
            ledger.clone(),
            Arc::new(InMemoryOperationStore::new()),
            erp.clone(),
        );
        Fixture {
            orchestrator,
            erp,
            ledger,
            content_id: *content.id(),
        }
    }

    #[tokio::test]
    async fn add_line_commits_and_remove_line_releases() {
        let f = fixture(10).await;
        let op = f
            .orchestrator
            .create_operation(OperationKind::Transfer, "WH01", None)
            .await
            .unwrap();

        let line = f.orchestrator.add_line(op.id, f.content_id, "ITEM-1", 4).await.unwrap();
        assert_eq!(line.state, LineState::Reserved);
        assert_eq!(f.ledger.get_content(f.content_id).await.unwrap().unwrap().committed_quantity(), 4);

        f.orchestrator.remove_line(op.id, line.id).await.unwrap();
        assert_eq!(f.ledger.get_content(f.content_id).await.unwrap().unwrap().committed_quantity(), 0);
        assert!(f.orchestrator.get_operation(op.id).await.unwrap().lines.is_empty());
    }

    #[tokio::test]
    async fn overcommitted_line_is_not_recorded() {
        let f = fixture(3).await;
        let op = f
            .orchestrator
            .create_operation(OperationKind::Pick, "WH01", None)
            .await
            .unwrap();

        let err = f.orchestrator.add_line(op.id, f.content_id, "ITEM-1", 4).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Ledger(LedgerError::InsufficientAvailableQuantity { requested: 4, available: 3 })
        ));
        assert!(err.is_deterministic());
        assert!(f.orchestrator.get_operation(op.id).await.unwrap().lines.is_empty());
    }

    #[tokio::test]
    async fn wrong_item_code_is_rejected_for_receipts() {
        let f = fixture(3).await;
        let op = f
            .orchestrator
            .create_operation(OperationKind::Receipt, "WH01", None)
            .await
            .unwrap();
        let err = f.orchestrator.add_line(op.id, f.content_id, "OTHER", 2).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Ledger(LedgerError::Validation(_))));
    }

    #[tokio::test]
    async fn counting_uses_actual_quantity() {
        let f = fixture(10).await;
        let op = f
            .orchestrator
            .create_operation(OperationKind::Counting, "WH01", None)
            .await
            .unwrap();
        let line = f.orchestrator.add_line(op.id, f.content_id, "ITEM-1", 6).await.unwrap();
        f.orchestrator.set_actual_quantity(op.id, line.id, 5).await.unwrap();

        let outcome = f.orchestrator.process(op.id).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Synced { pushed: true, .. }));

        let content = f.ledger.get_content(f.content_id).await.unwrap().unwrap();
        assert_eq!(content.quantity(), 5);
        assert_eq!(content.committed_quantity(), 0);
        assert_eq!(f.erp.documents_for(op.id)[0].lines[0].quantity, 5);
    }

    #[tokio::test]
    async fn receipt_adds_stock_on_sync() {
        let f = fixture(2).await;
        let op = f
            .orchestrator
            .create_operation(OperationKind::Receipt, "WH01", Some("PO 42".to_string()))
            .await
            .unwrap();
        f.orchestrator.add_line(op.id, f.content_id, "ITEM-1", 8).await.unwrap();
        assert_eq!(f.ledger.get_content(f.content_id).await.unwrap().unwrap().quantity(), 2);

        f.orchestrator.process(op.id).await.unwrap();

        let content = f.ledger.get_content(f.content_id).await.unwrap().unwrap();
        assert_eq!(content.quantity(), 10);
        let op = f.orchestrator.get_operation(op.id).await.unwrap();
        assert_eq!(op.lines[0].state, LineState::Received);
    }

    #[tokio::test]
    async fn interrupted_push_is_parked_not_repushed() {
        let f = fixture(10).await;
        let op = f
            .orchestrator
            .create_operation(OperationKind::Transfer, "WH01", None)
            .await
            .unwrap();
        f.orchestrator.add_line(op.id, f.content_id, "ITEM-1", 2).await.unwrap();

        // Simulate a crash right after the Processing state was saved.
        let mut stuck = f.orchestrator.get_operation(op.id).await.unwrap();
        stuck.begin_processing(Utc::now()).unwrap();
        f.orchestrator
            .store()
            .save(&stuck, ExpectedVersion::Exact(stuck.version))
            .await
            .unwrap();

        let outcome = f.orchestrator.process(op.id).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Abandoned { .. }));
        assert_eq!(f.erp.push_count(), 0);
        let op = f.orchestrator.get_operation(op.id).await.unwrap();
        assert_eq!(op.sync_status, Some(SyncStatus::Abandoned));
        assert_eq!(f.ledger.get_content(f.content_id).await.unwrap().unwrap().committed_quantity(), 2);
    }

    #[tokio::test]
    async fn local_operations_reject_external_status() {
        let f = fixture(10).await;
        let op = f
            .orchestrator
            .create_operation(OperationKind::Transfer, "WH01", None)
            .await
            .unwrap();
        let err = f
            .orchestrator
            .apply_external_status(op.id, ExternalDocumentStatus::Closed)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn unknown_operation_is_not_found() {
        let f = fixture(1).await;
        let id = OperationId::new();
        assert!(matches!(
            f.orchestrator.start(id).await.unwrap_err(),
            OrchestratorError::NotFound(missing) if missing == id
        ));
    }
}
