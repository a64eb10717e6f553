//! ERP integration: the sync adapter capability, its variants, and the
//! connection manager that owns the shared ERP session.
//!
//! Errors are classified here and nowhere else: `ErpError::Transient` is the
//! only signal callers use to decide whether to retry.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use packline_core::{OperationId, OperationLineId};
use packline_operations::{ExternalRef, Operation, OperationKind};

use crate::config::{ErpConfig, ErpDriver};

pub mod connection;
pub mod http;
pub mod simulated;

pub use connection::{ConnectionGuard, ConnectionManager, SessionFactory};
pub use http::{HttpErpAdapter, HttpSessionFactory};
pub use simulated::SimulatedErp;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErpError {
    /// Network faults, timeouts, expired sessions, ERP-side 5xx. Safe to retry.
    #[error("transient ERP error: {0}")]
    Transient(String),

    /// Business rejection or misconfiguration. Retrying will not help.
    #[error("permanent ERP error: {0}")]
    Permanent(String),
}

impl ErpError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ErpError::Transient(_))
    }
}

/// Status of a document as the ERP reports it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalDocumentStatus {
    Open,
    Released,
    Closed,
    Cancelled,
}

/// Document series the ERP numbers independently.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Counting,
    Transfer,
    Receipt,
    Pick,
}

impl From<OperationKind> for DocumentKind {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Counting => DocumentKind::Counting,
            OperationKind::Transfer => DocumentKind::Transfer,
            OperationKind::Receipt => DocumentKind::Receipt,
            OperationKind::Pick => DocumentKind::Pick,
        }
    }
}

/// One document line as pushed to the ERP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLine {
    pub line_id: OperationLineId,
    pub item_code: String,
    /// Counted / moved / received quantity.
    pub quantity: i64,
}

impl SyncLine {
    pub fn from_operation(operation: &Operation) -> Vec<SyncLine> {
        operation
            .lines
            .iter()
            .map(|line| SyncLine {
                line_id: line.id,
                item_code: line.item_code.clone(),
                quantity: line.effective_quantity(),
            })
            .collect()
    }
}

/// Capability set the orchestrator and scheduler need from an ERP.
///
/// Implementations must not retry pushes on their own: a push that timed out
/// may still have been recorded, and only the orchestrator knows whether the
/// operation already carries an external entry.
#[async_trait]
pub trait SyncAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn push_counting(
        &self,
        operation_id: OperationId,
        warehouse_code: &str,
        lines: &[SyncLine],
        series_number: i64,
    ) -> Result<ExternalRef, ErpError>;

    async fn push_transfer(
        &self,
        operation_id: OperationId,
        warehouse_code: &str,
        comments: Option<&str>,
        lines: &[SyncLine],
    ) -> Result<ExternalRef, ErpError>;

    async fn push_receipt(
        &self,
        operation_id: OperationId,
        warehouse_code: &str,
        comments: Option<&str>,
        lines: &[SyncLine],
    ) -> Result<ExternalRef, ErpError>;

    async fn query_document_status(&self, external_entry: i64) -> Result<ExternalDocumentStatus, ErpError>;

    async fn get_next_series_number(&self, kind: DocumentKind) -> Result<i64, ErpError>;

    /// Cheap health probe; never waits behind a business call.
    fn is_connected(&self) -> bool;

    /// Release the ERP session. Called once at process exit.
    async fn shutdown(&self) {}
}

/// Build the adapter variant selected by configuration.
pub fn build_adapter(config: &ErpConfig) -> Result<Arc<dyn SyncAdapter>, ErpError> {
    match config.driver {
        ErpDriver::Simulated => Ok(Arc::new(SimulatedErp::new())),
        ErpDriver::Http => {
            let credentials = config
                .credentials
                .clone()
                .ok_or_else(|| ErpError::permanent("http driver selected without credentials"))?;
            let factory = HttpSessionFactory::new(credentials, config.request_timeout)?;
            let connection = ConnectionManager::new(factory, config.reconnect_policy());
            Ok(Arc::new(HttpErpAdapter::new(connection)))
        }
    }
}
