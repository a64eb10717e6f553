//! The `Operation` aggregate: a warehouse transaction, its lines, and the
//! local and sync state machines that drive it towards the ERP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use packline_core::{AggregateRoot, CommitmentId, ContentId, DomainError, OperationId, OperationLineId};
use packline_inventory::SourceOperationType;

/// Business transaction kinds that reserve or move stock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Transfer,
    Counting,
    Receipt,
    Pick,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Transfer => "transfer",
            OperationKind::Counting => "counting",
            OperationKind::Receipt => "receipt",
            OperationKind::Pick => "pick",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "transfer" => Ok(OperationKind::Transfer),
            "counting" => Ok(OperationKind::Counting),
            "receipt" => Ok(OperationKind::Receipt),
            "pick" => Ok(OperationKind::Pick),
            other => Err(DomainError::validation(format!("unknown operation kind: {other}"))),
        }
    }

    pub fn source_type(&self) -> SourceOperationType {
        match self {
            OperationKind::Transfer => SourceOperationType::Transfer,
            OperationKind::Counting => SourceOperationType::Counting,
            OperationKind::Receipt => SourceOperationType::Receipt,
            OperationKind::Pick => SourceOperationType::Pick,
        }
    }

    /// Receipts add stock; every other kind reserves existing stock per line.
    pub fn reserves_stock(&self) -> bool {
        !matches!(self, OperationKind::Receipt)
    }
}

impl core::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who owns the document of record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOrigin {
    /// Created here, pushed to the ERP when finished.
    Local,
    /// Local mirror of an ERP-owned document (pick lists).
    External,
}

impl OperationOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationOrigin::Local => "local",
            OperationOrigin::External => "external",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "local" => Ok(OperationOrigin::Local),
            "external" => Ok(OperationOrigin::External),
            other => Err(DomainError::validation(format!("unknown operation origin: {other}"))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Open,
    InProgress,
    Processing,
    Synced,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Open => "open",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Processing => "processing",
            OperationStatus::Synced => "synced",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "open" => Ok(OperationStatus::Open),
            "in_progress" => Ok(OperationStatus::InProgress),
            "processing" => Ok(OperationStatus::Processing),
            "synced" => Ok(OperationStatus::Synced),
            "failed" => Ok(OperationStatus::Failed),
            "cancelled" => Ok(OperationStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown operation status: {other}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Synced | OperationStatus::Cancelled)
    }
}

impl core::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of the push to the ERP, tracked separately from the business status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Waiting for the scheduler.
    Pending,
    /// A push is in flight.
    Processing,
    Synced,
    /// Last attempt failed transiently; eligible for retry.
    Failed,
    /// Permanent failure or retries exhausted; needs a human.
    Abandoned,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Processing => "processing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "processing" => Ok(SyncStatus::Processing),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            "abandoned" => Ok(SyncStatus::Abandoned),
            other => Err(DomainError::validation(format!("unknown sync status: {other}"))),
        }
    }
}

impl core::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers the ERP assigned once the document was durably recorded there.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalRef {
    pub entry: i64,
    pub number: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineState {
    /// Receipt line waiting for finalization (nothing reserved).
    Pending,
    /// Holds a live commitment.
    Reserved,
    /// Commitment consumed on finalization.
    Consumed,
    /// Commitment released (cancellation).
    Released,
    /// Receipt quantity added to the package.
    Received,
}

impl LineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineState::Pending => "pending",
            LineState::Reserved => "reserved",
            LineState::Consumed => "consumed",
            LineState::Released => "released",
            LineState::Received => "received",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(LineState::Pending),
            "reserved" => Ok(LineState::Reserved),
            "consumed" => Ok(LineState::Consumed),
            "released" => Ok(LineState::Released),
            "received" => Ok(LineState::Received),
            other => Err(DomainError::validation(format!("unknown line state: {other}"))),
        }
    }
}

/// One line of an operation: an item code against a package content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLine {
    pub id: OperationLineId,
    pub item_code: String,
    pub content_id: ContentId,
    /// Requested (reserved, expected) quantity.
    pub quantity: i64,
    /// Counted / picked / received quantity, when it differs from `quantity`.
    pub actual_quantity: Option<i64>,
    pub commitment_id: Option<CommitmentId>,
    pub state: LineState,
}

impl OperationLine {
    /// Quantity that finalization should move.
    pub fn effective_quantity(&self) -> i64 {
        self.actual_quantity.unwrap_or(self.quantity)
    }
}

/// A transfer / counting / receipt / pick and its sync bookkeeping.
///
/// Fields are public so stores can persist and rebuild the record; state
/// changes go through the transition methods below, which keep status, sync
/// status and line states consistent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub origin: OperationOrigin,
    pub warehouse_code: String,
    pub comments: Option<String>,
    pub status: OperationStatus,
    /// `None` until the operation has been submitted for sync.
    pub sync_status: Option<SyncStatus>,
    pub external_entry: Option<i64>,
    pub external_number: Option<i64>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub lines: Vec<OperationLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl AggregateRoot for Operation {
    type Id = OperationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        warehouse_code: impl Into<String>,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let warehouse_code = warehouse_code.into();
        if warehouse_code.trim().is_empty() {
            return Err(DomainError::validation("warehouse code cannot be empty"));
        }
        Ok(Self {
            id: OperationId::new(),
            kind,
            origin: OperationOrigin::Local,
            warehouse_code,
            comments,
            status: OperationStatus::Open,
            sync_status: None,
            external_entry: None,
            external_number: None,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
            last_checked_at: None,
            lines: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        })
    }

    /// Local mirror of a document the ERP already owns.
    pub fn mirror(
        kind: OperationKind,
        external: ExternalRef,
        warehouse_code: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let mut op = Self::new(kind, warehouse_code, None, now)?;
        op.origin = OperationOrigin::External;
        op.sync_status = Some(SyncStatus::Synced);
        op.external_entry = Some(external.entry);
        op.external_number = Some(external.number);
        op.last_checked_at = Some(now);
        Ok(op)
    }

    pub fn external_ref(&self) -> Option<ExternalRef> {
        match (self.external_entry, self.external_number) {
            (Some(entry), Some(number)) => Some(ExternalRef { entry, number }),
            _ => None,
        }
    }

    pub fn is_editable(&self) -> bool {
        matches!(self.status, OperationStatus::Open | OperationStatus::InProgress)
    }

    pub fn line(&self, line_id: OperationLineId) -> Result<&OperationLine, DomainError> {
        self.lines
            .iter()
            .find(|l| l.id == line_id)
            .ok_or_else(DomainError::not_found)
    }

    fn line_mut(&mut self, line_id: OperationLineId) -> Result<&mut OperationLine, DomainError> {
        self.lines
            .iter_mut()
            .find(|l| l.id == line_id)
            .ok_or_else(DomainError::not_found)
    }

    fn ensure_editable(&self) -> Result<(), DomainError> {
        if !self.is_editable() {
            return Err(DomainError::validation(format!(
                "operation {} is {} and can no longer be edited",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn add_line(&mut self, line: OperationLine, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_editable()?;
        if line.quantity <= 0 {
            return Err(DomainError::validation("line quantity must be positive"));
        }
        if self.kind.reserves_stock() && line.commitment_id.is_none() {
            return Err(DomainError::invariant(format!(
                "{} lines must hold a commitment",
                self.kind
            )));
        }
        self.lines.push(line);
        self.updated_at = now;
        Ok(())
    }

    pub fn remove_line(
        &mut self,
        line_id: OperationLineId,
        now: DateTime<Utc>,
    ) -> Result<OperationLine, DomainError> {
        self.ensure_editable()?;
        let idx = self
            .lines
            .iter()
            .position(|l| l.id == line_id)
            .ok_or_else(DomainError::not_found)?;
        self.updated_at = now;
        Ok(self.lines.remove(idx))
    }

    /// Record a counted / picked / received quantity for a line.
    pub fn set_actual_quantity(
        &mut self,
        line_id: OperationLineId,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.ensure_editable()?;
        if quantity < 0 {
            return Err(DomainError::validation("actual quantity cannot be negative"));
        }
        let line = self.line_mut(line_id)?;
        if line.state == LineState::Reserved && quantity > line.quantity {
            return Err(DomainError::validation(format!(
                "actual quantity {} exceeds reserved {}",
                quantity, line.quantity
            )));
        }
        line.actual_quantity = Some(quantity);
        self.updated_at = now;
        Ok(())
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        match self.status {
            OperationStatus::InProgress => Ok(()),
            OperationStatus::Open => {
                self.status = OperationStatus::InProgress;
                self.updated_at = now;
                Ok(())
            }
            other => Err(DomainError::validation(format!(
                "operation {} cannot start from {}",
                self.id, other
            ))),
        }
    }

    fn ensure_pushable(&self) -> Result<(), DomainError> {
        if self.origin != OperationOrigin::Local {
            return Err(DomainError::validation(format!(
                "operation {} mirrors an ERP document and is never pushed",
                self.id
            )));
        }
        if self.lines.is_empty() {
            return Err(DomainError::validation(format!(
                "operation {} has no lines",
                self.id
            )));
        }
        Ok(())
    }

    /// Queue the operation for the background scheduler.
    pub fn submit(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_pushable()?;
        match (self.status, self.sync_status) {
            (OperationStatus::Open | OperationStatus::InProgress, None) => {
                self.sync_status = Some(SyncStatus::Pending);
                self.updated_at = now;
                Ok(())
            }
            (_, Some(SyncStatus::Pending)) => Ok(()),
            (status, sync) => Err(DomainError::validation(format!(
                "operation {} cannot be submitted while {} (sync: {:?})",
                self.id, status, sync
            ))),
        }
    }

    /// Open / InProgress / Failed -> Processing, right before the ERP push.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.ensure_pushable()?;
        if self.sync_status == Some(SyncStatus::Abandoned) {
            return Err(DomainError::validation(format!(
                "operation {} is abandoned and needs manual resolution",
                self.id
            )));
        }
        match self.status {
            OperationStatus::Open | OperationStatus::InProgress | OperationStatus::Failed => {
                self.status = OperationStatus::Processing;
                self.sync_status = Some(SyncStatus::Processing);
                self.last_attempt_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            other => Err(DomainError::validation(format!(
                "operation {} cannot be processed from {}",
                self.id, other
            ))),
        }
    }

    pub fn record_external(&mut self, external: ExternalRef, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != OperationStatus::Processing {
            return Err(DomainError::invariant(format!(
                "external reference recorded for operation {} outside processing",
                self.id
            )));
        }
        if let Some(existing) = self.external_entry {
            if existing != external.entry {
                return Err(DomainError::conflict(format!(
                    "operation {} already posted as entry {existing}",
                    self.id
                )));
            }
        }
        self.external_entry = Some(external.entry);
        self.external_number = Some(external.number);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_line_consumed(&mut self, line_id: OperationLineId, now: DateTime<Utc>) -> Result<(), DomainError> {
        let line = self.line_mut(line_id)?;
        line.state = LineState::Consumed;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_line_received(&mut self, line_id: OperationLineId, now: DateTime<Utc>) -> Result<(), DomainError> {
        let line = self.line_mut(line_id)?;
        line.state = LineState::Received;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Synced;
        self.sync_status = Some(SyncStatus::Synced);
        self.last_error = None;
        self.updated_at = now;
    }

    /// Record a failed push. Transient failures stay eligible for retry;
    /// permanent ones are parked for manual resolution.
    pub fn mark_sync_failed(&mut self, error: impl Into<String>, transient: bool, now: DateTime<Utc>) {
        self.status = OperationStatus::Failed;
        self.sync_status = Some(if transient {
            SyncStatus::Failed
        } else {
            SyncStatus::Abandoned
        });
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.updated_at = now;
    }

    pub fn abandon(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), DomainError> {
        match self.sync_status {
            Some(SyncStatus::Pending | SyncStatus::Failed) => {
                self.sync_status = Some(SyncStatus::Abandoned);
                self.last_error = Some(reason.into());
                self.updated_at = now;
                Ok(())
            }
            Some(SyncStatus::Abandoned) => Ok(()),
            other => Err(DomainError::validation(format!(
                "operation {} cannot be abandoned with sync status {:?}",
                self.id, other
            ))),
        }
    }

    /// Manual resolution: put an abandoned operation back in the retry queue.
    pub fn retry_abandoned(&mut self, now: DateTime<Utc>) -> Result<(), DomainError> {
        if self.sync_status != Some(SyncStatus::Abandoned) {
            return Err(DomainError::validation(format!(
                "operation {} is not abandoned",
                self.id
            )));
        }
        if self.status != OperationStatus::Failed {
            self.status = OperationStatus::Failed;
        }
        self.sync_status = Some(SyncStatus::Failed);
        self.retry_count = 0;
        self.last_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn ensure_cancellable(&self) -> Result<(), DomainError> {
        if let Some(entry) = self.external_entry {
            if self.origin == OperationOrigin::Local {
                return Err(DomainError::validation(format!(
                    "operation {} is already posted to the ERP as entry {entry}",
                    self.id
                )));
            }
        }
        match self.status {
            OperationStatus::Open
            | OperationStatus::InProgress
            | OperationStatus::Processing
            | OperationStatus::Failed => Ok(()),
            other => Err(DomainError::validation(format!(
                "operation {} cannot be cancelled from {}",
                self.id, other
            ))),
        }
    }

    /// Mark cancelled. Reserved lines become released; consumed lines stay consumed.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        for line in &mut self.lines {
            if matches!(line.state, LineState::Reserved | LineState::Pending) {
                line.state = LineState::Released;
            }
        }
        self.status = OperationStatus::Cancelled;
        if self.origin == OperationOrigin::Local {
            self.sync_status = None;
        }
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn touch_checked(&mut self, now: DateTime<Utc>) {
        self.last_checked_at = Some(now);
        self.updated_at = now;
    }
}
