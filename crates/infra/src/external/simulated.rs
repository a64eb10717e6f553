//! In-process ERP for local runs and tests.
//!
//! Goes through the same [`ConnectionManager`] as the real driver, records
//! every posted document, and lets callers script failures.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use packline_core::OperationId;
use packline_operations::ExternalRef;

use super::connection::{ConnectionManager, SessionFactory};
use super::{DocumentKind, ErpError, ExternalDocumentStatus, SyncAdapter, SyncLine};
use crate::retry::RetryPolicy;

/// A document as the simulated ERP stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedDocument {
    pub kind: DocumentKind,
    pub operation_id: Option<OperationId>,
    pub number: i64,
    pub status: ExternalDocumentStatus,
    pub lines: Vec<SyncLine>,
}

#[derive(Debug, Default)]
struct ErpState {
    documents: HashMap<i64, SimulatedDocument>,
    next_entry: i64,
    series: HashMap<DocumentKind, i64>,
    push_failures: VecDeque<ErpError>,
    query_failures: VecDeque<ErpError>,
}

#[derive(Debug, Default)]
pub struct SimulatedSessions {
    opens: AtomicU32,
    closes: AtomicU32,
    login_failures: Mutex<VecDeque<ErpError>>,
}

#[async_trait]
impl SessionFactory for SimulatedSessions {
    type Session = u32;

    async fn open(&self) -> Result<u32, ErpError> {
        let failure = self
            .login_failures
            .lock()
            .map_err(|_| ErpError::permanent("lock poisoned"))?
            .pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(self.opens.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn close(&self, _session: &u32) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct SimulatedErp {
    connection: ConnectionManager<SimulatedSessions>,
    state: Mutex<ErpState>,
    pushes: AtomicU32,
}

impl Default for SimulatedErp {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedErp {
    pub fn new() -> Self {
        Self::with_reconnect(RetryPolicy::fixed(3, std::time::Duration::from_millis(1)))
    }

    pub fn with_reconnect(policy: RetryPolicy) -> Self {
        Self {
            connection: ConnectionManager::new(SimulatedSessions::default(), policy),
            state: Mutex::new(ErpState {
                next_entry: 1,
                ..ErpState::default()
            }),
            pushes: AtomicU32::new(0),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, ErpState>, ErpError> {
        self.state
            .lock()
            .map_err(|_| ErpError::permanent("lock poisoned"))
    }

    /// Number of push calls that reached the ERP, failed or not.
    pub fn push_count(&self) -> u32 {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Sessions opened so far.
    pub fn session_count(&self) -> u32 {
        self.connection.factory().opens.load(Ordering::SeqCst)
    }

    /// Make the next push fail with `error`. Queued failures are consumed in order.
    pub fn fail_next_push(&self, error: ErpError) {
        if let Ok(mut state) = self.state.lock() {
            state.push_failures.push_back(error);
        }
    }

    pub fn fail_next_query(&self, error: ErpError) {
        if let Ok(mut state) = self.state.lock() {
            state.query_failures.push_back(error);
        }
    }

    pub fn fail_next_login(&self, error: ErpError) {
        if let Ok(mut failures) = self.connection.factory().login_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Create an ERP-owned pick list, as if a planner released it upstream.
    pub fn create_pick_list(&self, lines: Vec<SyncLine>) -> ExternalRef {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = state.next_entry;
        state.next_entry += 1;
        let number = 50_000 + entry;
        state.documents.insert(
            entry,
            SimulatedDocument {
                kind: DocumentKind::Pick,
                operation_id: None,
                number,
                status: ExternalDocumentStatus::Open,
                lines,
            },
        );
        ExternalRef { entry, number }
    }

    pub fn set_document_status(&self, entry: i64, status: ExternalDocumentStatus) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(doc) = state.documents.get_mut(&entry) {
                doc.status = status;
            }
        }
    }

    pub fn document(&self, entry: i64) -> Option<SimulatedDocument> {
        self.state.lock().ok()?.documents.get(&entry).cloned()
    }

    /// Documents posted for `operation_id`.
    pub fn documents_for(&self, operation_id: OperationId) -> Vec<SimulatedDocument> {
        match self.state.lock() {
            Ok(state) => state
                .documents
                .values()
                .filter(|d| d.operation_id == Some(operation_id))
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    async fn push(
        &self,
        kind: DocumentKind,
        operation_id: OperationId,
        lines: &[SyncLine],
    ) -> Result<ExternalRef, ErpError> {
        let guard = self.connection.acquire().await?;
        self.pushes.fetch_add(1, Ordering::SeqCst);

        let result = self.state().and_then(|mut state| {
            if let Some(err) = state.push_failures.pop_front() {
                return Err(err);
            }
            if lines.is_empty() {
                return Err(ErpError::permanent("document has no lines"));
            }
            if let Some(line) = lines.iter().find(|l| l.quantity < 0) {
                return Err(ErpError::permanent(format!(
                    "negative quantity for {}",
                    line.item_code
                )));
            }
            let entry = state.next_entry;
            state.next_entry += 1;
            let number = 10_000 + entry;
            state.documents.insert(
                entry,
                SimulatedDocument {
                    kind,
                    operation_id: Some(operation_id),
                    number,
                    status: ExternalDocumentStatus::Closed,
                    lines: lines.to_vec(),
                },
            );
            Ok(ExternalRef { entry, number })
        });

        if let Ok(external) = &result {
            debug!(operation_id = %operation_id, entry = external.entry, ?kind, "simulated ERP accepted document");
        }
        guard.finish(result).await
    }
}

#[async_trait]
impl SyncAdapter for SimulatedErp {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn push_counting(
        &self,
        operation_id: OperationId,
        _warehouse_code: &str,
        lines: &[SyncLine],
        _series_number: i64,
    ) -> Result<ExternalRef, ErpError> {
        self.push(DocumentKind::Counting, operation_id, lines).await
    }

    async fn push_transfer(
        &self,
        operation_id: OperationId,
        _warehouse_code: &str,
        _comments: Option<&str>,
        lines: &[SyncLine],
    ) -> Result<ExternalRef, ErpError> {
        self.push(DocumentKind::Transfer, operation_id, lines).await
    }

    async fn push_receipt(
        &self,
        operation_id: OperationId,
        _warehouse_code: &str,
        _comments: Option<&str>,
        lines: &[SyncLine],
    ) -> Result<ExternalRef, ErpError> {
        self.push(DocumentKind::Receipt, operation_id, lines).await
    }

    async fn query_document_status(&self, external_entry: i64) -> Result<ExternalDocumentStatus, ErpError> {
        let guard = self.connection.acquire().await?;
        let result = self.state().and_then(|mut state| {
            if let Some(err) = state.query_failures.pop_front() {
                return Err(err);
            }
            state
                .documents
                .get(&external_entry)
                .map(|d| d.status)
                .ok_or_else(|| ErpError::permanent(format!("document {external_entry} does not exist")))
        });
        guard.finish(result).await
    }

    async fn get_next_series_number(&self, kind: DocumentKind) -> Result<i64, ErpError> {
        let guard = self.connection.acquire().await?;
        let result = self.state().map(|mut state| {
            let next = state.series.entry(kind).or_insert(0);
            *next += 1;
            *next
        });
        guard.finish(result).await
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn shutdown(&self) {
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packline_core::OperationLineId;

    fn lines(quantity: i64) -> Vec<SyncLine> {
        vec![SyncLine {
            line_id: OperationLineId::new(),
            item_code: "ITEM-1".to_string(),
            quantity,
        }]
    }

    #[tokio::test]
    async fn push_records_document_and_counts() {
        let erp = SimulatedErp::new();
        assert!(!erp.is_connected());

        let op = OperationId::new();
        let external = erp.push_transfer(op, "WH01", None, &lines(3)).await.unwrap();

        assert!(erp.is_connected());
        assert_eq!(erp.push_count(), 1);
        let doc = erp.document(external.entry).unwrap();
        assert_eq!(doc.kind, DocumentKind::Transfer);
        assert_eq!(erp.documents_for(op).len(), 1);
    }

    #[tokio::test]
    async fn injected_transient_failure_forces_reconnect() {
        let erp = SimulatedErp::new();
        erp.fail_next_push(ErpError::transient("timeout"));

        let op = OperationId::new();
        let err = erp.push_receipt(op, "WH01", None, &lines(1)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!erp.is_connected());
        assert!(erp.documents_for(op).is_empty());

        erp.push_receipt(op, "WH01", None, &lines(1)).await.unwrap();
        assert_eq!(erp.session_count(), 2);
    }

    #[tokio::test]
    async fn login_failures_are_retried_up_to_the_bound() {
        let erp = SimulatedErp::with_reconnect(RetryPolicy::fixed(2, std::time::Duration::from_millis(1)));
        erp.fail_next_login(ErpError::transient("refused"));
        erp.fail_next_login(ErpError::transient("refused"));

        let err = erp.get_next_series_number(DocumentKind::Counting).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(erp.push_count(), 0);

        assert_eq!(erp.get_next_series_number(DocumentKind::Counting).await.unwrap(), 1);
        assert_eq!(erp.get_next_series_number(DocumentKind::Counting).await.unwrap(), 2);
        assert_eq!(erp.get_next_series_number(DocumentKind::Transfer).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pick_list_status_follows_updates() {
        let erp = SimulatedErp::new();
        let pick = erp.create_pick_list(lines(2));
        assert_eq!(
            erp.query_document_status(pick.entry).await.unwrap(),
            ExternalDocumentStatus::Open
        );
        erp.set_document_status(pick.entry, ExternalDocumentStatus::Closed);
        assert_eq!(
            erp.query_document_status(pick.entry).await.unwrap(),
            ExternalDocumentStatus::Closed
        );
        assert!(erp.query_document_status(9999).await.is_err());
    }
}
