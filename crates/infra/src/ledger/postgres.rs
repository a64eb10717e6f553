//! Postgres-backed commitment ledger.
//!
//! Every mutating call runs in an explicit transaction that locks the target
//! `package_contents` row with `SELECT ... FOR UPDATE` before evaluating the
//! invariant, and rolls back on every early exit. The table's CHECK constraint
//! is a second line of defence behind the in-code check.
//!
//! ## Error Mapping
//!
//! | PostgreSQL code | LedgerError |
//! |---|---|
//! | `23505` unique violation | `Validation` (duplicate barcode / item code) |
//! | `23514` check violation | `Validation` |
//! | `23503` foreign key violation | `NotFound` |
//! | `40001`, `40P01`, `55P03` | `ConcurrencyConflict` |
//! | anything else | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use packline_core::{CommitmentId, ContentId, Entity, OperationId, OperationLineId, PackageId};
use packline_inventory::{
    Package, PackageCommitment, PackageContent, PackageMetadata, PackageStatus, SourceOperation,
    SourceOperationType,
};

use super::r#trait::{check_commit_request, CommitRequest, CommitmentLedger, LedgerError};

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: Arc<PgPool>,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LedgerError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

const PACKAGE_COLUMNS: &str =
    "id, barcode, warehouse_code, status, metadata, created_at, updated_at";
const CONTENT_COLUMNS: &str =
    "id, package_id, item_code, quantity, committed_quantity, updated_at";
const COMMITMENT_COLUMNS: &str = "id, content_id, item_code, quantity, source_operation_type, \
     source_operation_id, source_operation_line_id, committed_at";

async fn rollback(tx: Transaction<'_, Postgres>) -> Result<(), LedgerError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))
}

async fn lock_content(
    tx: &mut Transaction<'_, Postgres>,
    content_id: ContentId,
) -> Result<Option<PackageContent>, LedgerError> {
    let row = sqlx::query(&format!(
        "SELECT {CONTENT_COLUMNS} FROM package_contents WHERE id = $1 FOR UPDATE"
    ))
    .bind(content_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_content", e))?;

    row.map(|r| content_from_row(&r)).transpose()
}

async fn load_package(
    tx: &mut Transaction<'_, Postgres>,
    package_id: PackageId,
    for_update: bool,
) -> Result<Package, LedgerError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {PACKAGE_COLUMNS} FROM packages WHERE id = $1{lock}"
    ))
    .bind(package_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("load_package", e))?;

    match row {
        Some(r) => package_from_row(&r),
        None => Err(LedgerError::NotFound(format!("package {package_id}"))),
    }
}

async fn write_content(
    tx: &mut Transaction<'_, Postgres>,
    content: &PackageContent,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        UPDATE package_contents
        SET quantity = $2, committed_quantity = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(content.id().as_uuid())
    .bind(content.quantity())
    .bind(content.committed_quantity())
    .bind(content.updated_at())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_content", e))?;
    Ok(())
}

/// Look a commitment up without locking, to learn which content to lock first.
async fn commitment_content(
    tx: &mut Transaction<'_, Postgres>,
    commitment_id: CommitmentId,
) -> Result<Option<ContentId>, LedgerError> {
    let row = sqlx::query("SELECT content_id FROM package_commitments WHERE id = $1")
        .bind(commitment_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("commitment_content", e))?;

    row.map(|r| {
        r.try_get::<uuid::Uuid, _>("content_id")
            .map(ContentId::from_uuid)
            .map_err(|e| LedgerError::Storage(format!("failed to read content_id: {e}")))
    })
    .transpose()
}

/// Re-read the commitment under the content lock (content first, then commitment).
async fn lock_commitment(
    tx: &mut Transaction<'_, Postgres>,
    commitment_id: CommitmentId,
) -> Result<Option<PackageCommitment>, LedgerError> {
    let row = sqlx::query(&format!(
        "SELECT {COMMITMENT_COLUMNS} FROM package_commitments WHERE id = $1 FOR UPDATE"
    ))
    .bind(commitment_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_commitment", e))?;

    row.map(|r| commitment_from_row(&r)).transpose()
}

async fn delete_commitment(
    tx: &mut Transaction<'_, Postgres>,
    commitment_id: CommitmentId,
) -> Result<(), LedgerError> {
    sqlx::query("DELETE FROM package_commitments WHERE id = $1")
        .bind(commitment_id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_commitment", e))?;
    Ok(())
}

#[async_trait]
impl CommitmentLedger for PostgresLedger {
    #[instrument(skip(self, metadata), fields(barcode = %barcode), err)]
    async fn create_package(
        &self,
        barcode: &str,
        warehouse_code: &str,
        metadata: PackageMetadata,
    ) -> Result<Package, LedgerError> {
        let package = Package::new(barcode, warehouse_code, metadata, Utc::now())?;
        let metadata = serde_json::to_value(&package.metadata)
            .map_err(|e| LedgerError::Validation(format!("metadata serialization failed: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO packages (id, barcode, warehouse_code, status, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(package.id.as_uuid())
        .bind(&package.barcode)
        .bind(&package.warehouse_code)
        .bind(package.status.as_str())
        .bind(&metadata)
        .bind(package.created_at)
        .bind(package.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_package", e))?;

        Ok(package)
    }

    #[instrument(skip(self), fields(package_id = %package_id, status = %status), err)]
    async fn set_package_status(
        &self,
        package_id: PackageId,
        status: PackageStatus,
    ) -> Result<Package, LedgerError> {
        let mut tx = self.begin().await?;
        let mut package = match load_package(&mut tx, package_id, true).await {
            Ok(p) => p,
            Err(e) => {
                rollback(tx).await?;
                return Err(e);
            }
        };
        if let Err(e) = package.transition_to(status, Utc::now()) {
            rollback(tx).await?;
            return Err(e.into());
        }

        sqlx::query("UPDATE packages SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(package_id.as_uuid())
            .bind(package.status.as_str())
            .bind(package.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_package_status", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(package)
    }

    #[instrument(skip(self), fields(package_id = %package_id, item_code = %item_code), err)]
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
        let mut tx = self.begin().await?;

        // Package row lock serializes concurrent first inserts of the same item code.
        let package = match load_package(&mut tx, package_id, true).await {
            Ok(p) => p,
            Err(e) => {
                rollback(tx).await?;
                return Err(e);
            }
        };
        if let Err(e) = package.ensure_accepts_stock() {
            rollback(tx).await?;
            return Err(e.into());
        }

        let existing = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM package_contents \
             WHERE package_id = $1 AND item_code = $2 FOR UPDATE"
        ))
        .bind(package_id.as_uuid())
        .bind(item_code)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_content", e))?;

        let content = match existing {
            Some(row) => {
                let mut content = content_from_row(&row)?;
                if quantity > 0 {
                    if let Err(e) = content.receive(quantity, now) {
                        rollback(tx).await?;
                        return Err(e.into());
                    }
                    write_content(&mut tx, &content).await?;
                }
                content
            }
            None => {
                let content = match PackageContent::new(package_id, item_code, quantity, now) {
                    Ok(c) => c,
                    Err(e) => {
                        rollback(tx).await?;
                        return Err(e.into());
                    }
                };
                sqlx::query(
                    r#"
                    INSERT INTO package_contents (id, package_id, item_code, quantity, committed_quantity, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(content.id().as_uuid())
                .bind(package_id.as_uuid())
                .bind(content.item_code())
                .bind(content.quantity())
                .bind(content.committed_quantity())
                .bind(content.updated_at())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_content", e))?;
                content
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(content)
    }

    #[instrument(
        skip(self, request),
        fields(
            content_id = %request.content_id,
            quantity = request.quantity,
            operation_id = %request.source.operation_id
        ),
        err
    )]
    async fn commit(&self, request: CommitRequest) -> Result<CommitmentId, LedgerError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let Some(mut content) = lock_content(&mut tx, request.content_id).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(format!("content {}", request.content_id)));
        };
        let package = match load_package(&mut tx, content.package_id(), false).await {
            Ok(p) => p,
            Err(e) => {
                rollback(tx).await?;
                return Err(e);
            }
        };
        if let Err(e) = check_commit_request(&request, &content, &package) {
            rollback(tx).await?;
            return Err(e);
        }

        let commitment = match content
            .reserve(request.quantity, now)
            .and_then(|_| PackageCommitment::for_content(&content, request.quantity, request.source, now))
        {
            Ok(c) => c,
            Err(e) => {
                rollback(tx).await?;
                return Err(e.into());
            }
        };

        sqlx::query(&format!(
            "INSERT INTO package_commitments ({COMMITMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(commitment.id.as_uuid())
        .bind(commitment.content_id.as_uuid())
        .bind(&commitment.item_code)
        .bind(commitment.quantity)
        .bind(commitment.source.kind.as_str())
        .bind(commitment.source.operation_id.as_uuid())
        .bind(commitment.source.line_id.as_uuid())
        .bind(commitment.committed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_commitment", e))?;

        write_content(&mut tx, &content).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(commitment_id = %commitment.id, "committed");
        Ok(commitment.id)
    }

    #[instrument(skip(self), fields(commitment_id = %commitment_id), err)]
    async fn release(&self, commitment_id: CommitmentId) -> Result<bool, LedgerError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let Some(content_id) = commitment_content(&mut tx, commitment_id).await? else {
            rollback(tx).await?;
            return Ok(false);
        };
        let Some(mut content) = lock_content(&mut tx, content_id).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(format!("content {content_id}")));
        };
        // A concurrent release/consume may have won while we waited for the lock.
        let Some(commitment) = lock_commitment(&mut tx, commitment_id).await? else {
            rollback(tx).await?;
            return Ok(false);
        };

        if let Err(e) = content.release(commitment.quantity, now) {
            rollback(tx).await?;
            return Err(e.into());
        }
        delete_commitment(&mut tx, commitment_id).await?;
        write_content(&mut tx, &content).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(commitment_id = %commitment_id), err)]
    async fn consume(
        &self,
        commitment_id: CommitmentId,
        actual_quantity: i64,
    ) -> Result<(), LedgerError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let Some(content_id) = commitment_content(&mut tx, commitment_id).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(format!("commitment {commitment_id}")));
        };
        let Some(mut content) = lock_content(&mut tx, content_id).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(format!("content {content_id}")));
        };
        let Some(commitment) = lock_commitment(&mut tx, commitment_id).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(format!("commitment {commitment_id}")));
        };

        if let Err(e) = content.consume(commitment.quantity, actual_quantity, now) {
            rollback(tx).await?;
            return Err(e.into());
        }
        delete_commitment(&mut tx, commitment_id).await?;
        write_content(&mut tx, &content).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(content_id = %content_id), err)]
    async fn receive(&self, content_id: ContentId, quantity: i64) -> Result<PackageContent, LedgerError> {
        let now = Utc::now();
        let mut tx = self.begin().await?;

        let Some(mut content) = lock_content(&mut tx, content_id).await? else {
            rollback(tx).await?;
            return Err(LedgerError::NotFound(format!("content {content_id}")));
        };
        let package = match load_package(&mut tx, content.package_id(), false).await {
            Ok(p) => p,
            Err(e) => {
                rollback(tx).await?;
                return Err(e);
            }
        };
        if let Err(e) = package
            .ensure_accepts_stock()
            .and_then(|_| content.receive(quantity, now))
        {
            rollback(tx).await?;
            return Err(e.into());
        }
        write_content(&mut tx, &content).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(content)
    }

    #[instrument(skip(self), fields(operation_id = %source_operation_id), err)]
    async fn find_commitments(
        &self,
        source_operation_id: OperationId,
    ) -> Result<Vec<PackageCommitment>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMITMENT_COLUMNS} FROM package_commitments \
             WHERE source_operation_id = $1 ORDER BY committed_at, id"
        ))
        .bind(source_operation_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_commitments", e))?;

        rows.iter().map(commitment_from_row).collect()
    }

    async fn content_commitments(
        &self,
        content_id: ContentId,
    ) -> Result<Vec<PackageCommitment>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMITMENT_COLUMNS} FROM package_commitments \
             WHERE content_id = $1 ORDER BY committed_at, id"
        ))
        .bind(content_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("content_commitments", e))?;

        rows.iter().map(commitment_from_row).collect()
    }

    async fn get_package(&self, package_id: PackageId) -> Result<Option<Package>, LedgerError> {
        let row = sqlx::query(&format!("SELECT {PACKAGE_COLUMNS} FROM packages WHERE id = $1"))
            .bind(package_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_package", e))?;
        row.map(|r| package_from_row(&r)).transpose()
    }

    async fn get_content(&self, content_id: ContentId) -> Result<Option<PackageContent>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM package_contents WHERE id = $1"
        ))
        .bind(content_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_content", e))?;
        row.map(|r| content_from_row(&r)).transpose()
    }

    async fn list_contents(&self, package_id: PackageId) -> Result<Vec<PackageContent>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTENT_COLUMNS} FROM package_contents WHERE package_id = $1 ORDER BY item_code"
        ))
        .bind(package_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_contents", e))?;
        rows.iter().map(content_from_row).collect()
    }

    async fn get_commitment(
        &self,
        commitment_id: CommitmentId,
    ) -> Result<Option<PackageCommitment>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMITMENT_COLUMNS} FROM package_commitments WHERE id = $1"
        ))
        .bind(commitment_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_commitment", e))?;
        row.map(|r| commitment_from_row(&r)).transpose()
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, LedgerError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| LedgerError::Storage(format!("failed to read {name}: {e}")))
}

fn package_from_row(row: &PgRow) -> Result<Package, LedgerError> {
    let status: String = column(row, "status")?;
    let metadata: serde_json::Value = column(row, "metadata")?;
    Ok(Package {
        id: PackageId::from_uuid(column(row, "id")?),
        barcode: column(row, "barcode")?,
        warehouse_code: column(row, "warehouse_code")?,
        status: PackageStatus::parse(&status)?,
        metadata: serde_json::from_value(metadata)
            .map_err(|e| LedgerError::Storage(format!("invalid package metadata: {e}")))?,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        updated_at: column::<DateTime<Utc>>(row, "updated_at")?,
    })
}

fn content_from_row(row: &PgRow) -> Result<PackageContent, LedgerError> {
    // from_parts re-checks the invariant; a violation here means corrupted data.
    PackageContent::from_parts(
        ContentId::from_uuid(column(row, "id")?),
        PackageId::from_uuid(column(row, "package_id")?),
        column(row, "item_code")?,
        column(row, "quantity")?,
        column(row, "committed_quantity")?,
        column(row, "updated_at")?,
    )
    .map_err(|e| LedgerError::Storage(e.to_string()))
}

fn commitment_from_row(row: &PgRow) -> Result<PackageCommitment, LedgerError> {
    let kind: String = column(row, "source_operation_type")?;
    Ok(PackageCommitment {
        id: CommitmentId::from_uuid(column(row, "id")?),
        content_id: ContentId::from_uuid(column(row, "content_id")?),
        item_code: column(row, "item_code")?,
        quantity: column(row, "quantity")?,
        source: SourceOperation {
            kind: SourceOperationType::parse(&kind)?,
            operation_id: OperationId::from_uuid(column(row, "source_operation_id")?),
            line_id: OperationLineId::from_uuid(column(row, "source_operation_line_id")?),
        },
        committed_at: column(row, "committed_at")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") => LedgerError::Validation(msg),
                Some("23503") => LedgerError::NotFound(msg),
                Some("40001") | Some("40P01") | Some("55P03") => LedgerError::ConcurrencyConflict(msg),
                _ => LedgerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => LedgerError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs only against a real database: `DATABASE_URL=postgres://... cargo test`.
    async fn ledger() -> Option<PostgresLedger> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        crate::db::apply_schema(&pool).await.ok()?;
        Some(PostgresLedger::new(pool))
    }

    #[tokio::test]
    async fn commit_consume_round_trip_against_postgres() {
        let Some(ledger) = ledger().await else {
            return;
        };
        let barcode = format!("PG-{}", uuid::Uuid::now_v7());
        let package = ledger
            .create_package(&barcode, "WH01", PackageMetadata::new())
            .await
            .unwrap();
        ledger
            .set_package_status(package.id, PackageStatus::Active)
            .await
            .unwrap();
        let content = ledger.add_content(package.id, "ITEM-1", 24).await.unwrap();

        let operation_id = OperationId::new();
        let id = ledger
            .commit(CommitRequest {
                content_id: *content.id(),
                expected_item_code: None,
                quantity: 24,
                source: SourceOperation {
                    kind: SourceOperationType::Transfer,
                    operation_id,
                    line_id: OperationLineId::new(),
                },
            })
            .await
            .unwrap();
        assert_eq!(ledger.find_commitments(operation_id).await.unwrap().len(), 1);

        ledger.consume(id, 24).await.unwrap();
        let after = ledger.get_content(*content.id()).await.unwrap().unwrap();
        assert_eq!(after.quantity(), 0);
        assert_eq!(after.committed_quantity(), 0);
        assert!(ledger.find_commitments(operation_id).await.unwrap().is_empty());
        assert!(!ledger.release(id).await.unwrap());
    }
}
