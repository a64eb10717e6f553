//! Postgres-backed operation store.
//!
//! The header row carries a `version` column; `save` updates it with
//! `WHERE id = $1 AND version = $2`, so a write made from a stale copy touches
//! no row and is reported as `Conflict`. Lines are rewritten in the same
//! transaction.
//!
//! One worker process per database is assumed. Operations left in
//! `processing` are returned by `list_pending` so an interrupted push can be
//! resolved after a restart; the per-operation locks that keep a live push
//! from being parked are in-process only.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use packline_core::{CommitmentId, ContentId, ExpectedVersion, OperationId, OperationLineId};
use packline_operations::{
    LineState, Operation, OperationKind, OperationLine, OperationOrigin, OperationStatus,
    SyncStatus,
};

use super::r#trait::{OperationStore, OperationStoreError};

#[derive(Debug, Clone)]
pub struct PostgresOperationStore {
    pool: Arc<PgPool>,
}

impl PostgresOperationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn load_many(&self, rows: Vec<PgRow>) -> Result<Vec<Operation>, OperationStoreError> {
        let mut operations = Vec::with_capacity(rows.len());
        for row in rows {
            let mut op = operation_from_row(&row)?;
            op.lines = self.load_lines(op.id).await?;
            operations.push(op);
        }
        Ok(operations)
    }

    async fn load_lines(&self, id: OperationId) -> Result<Vec<OperationLine>, OperationStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, item_code, content_id, quantity, actual_quantity, commitment_id, state
            FROM operation_lines
            WHERE operation_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_lines", e))?;

        rows.iter().map(line_from_row).collect()
    }
}

const OPERATION_COLUMNS: &str = "id, kind, origin, warehouse_code, comments, status, sync_status, \
     external_entry, external_number, retry_count, last_error, last_attempt_at, last_checked_at, \
     created_at, updated_at, version";

async fn write_lines(
    tx: &mut Transaction<'_, Postgres>,
    operation: &Operation,
) -> Result<(), OperationStoreError> {
    sqlx::query("DELETE FROM operation_lines WHERE operation_id = $1")
        .bind(operation.id.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("delete_lines", e))?;

    for (position, line) in operation.lines.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO operation_lines (
                id, operation_id, position, item_code, content_id,
                quantity, actual_quantity, commitment_id, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(line.id.as_uuid())
        .bind(operation.id.as_uuid())
        .bind(position as i32)
        .bind(&line.item_code)
        .bind(line.content_id.as_uuid())
        .bind(line.quantity)
        .bind(line.actual_quantity)
        .bind(line.commitment_id.map(|c| *c.as_uuid()))
        .bind(line.state.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_line", e))?;
    }
    Ok(())
}

#[async_trait]
impl OperationStore for PostgresOperationStore {
    #[instrument(skip(self, operation), fields(operation_id = %operation.id), err)]
    async fn insert(&self, operation: &Operation) -> Result<(), OperationStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(&format!(
            "INSERT INTO operations ({OPERATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(operation.id.as_uuid())
        .bind(operation.kind.as_str())
        .bind(operation.origin.as_str())
        .bind(&operation.warehouse_code)
        .bind(&operation.comments)
        .bind(operation.status.as_str())
        .bind(operation.sync_status.map(|s| s.as_str()))
        .bind(operation.external_entry)
        .bind(operation.external_number)
        .bind(operation.retry_count as i32)
        .bind(&operation.last_error)
        .bind(operation.last_attempt_at)
        .bind(operation.last_checked_at)
        .bind(operation.created_at)
        .bind(operation.updated_at)
        .bind(operation.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_operation", e))?;

        write_lines(&mut tx, operation).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(operation_id = %id), err)]
    async fn get(&self, id: OperationId) -> Result<Option<Operation>, OperationStoreError> {
        let row = sqlx::query(&format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_operation", e))?;

        match row {
            Some(row) => {
                let mut op = operation_from_row(&row)?;
                op.lines = self.load_lines(id).await?;
                Ok(Some(op))
            }
            None => Ok(None),
        }
    }

    #[instrument(
        skip(self, operation),
        fields(operation_id = %operation.id, expected = ?expected),
        err
    )]
    async fn save(
        &self,
        operation: &Operation,
        expected: ExpectedVersion,
    ) -> Result<u64, OperationStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current: Option<i64> = sqlx::query_scalar("SELECT version FROM operations WHERE id = $1 FOR UPDATE")
            .bind(operation.id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_operation", e))?;

        let Some(current) = current else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(OperationStoreError::NotFound(operation.id));
        };
        let current = current as u64;
        if !expected.matches(current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(OperationStoreError::Conflict(format!(
                "operation {}: expected {expected:?}, found {current}",
                operation.id
            )));
        }
        let next = current + 1;

        sqlx::query(
            r#"
            UPDATE operations SET
                warehouse_code = $3, comments = $4, status = $5, sync_status = $6,
                external_entry = $7, external_number = $8, retry_count = $9, last_error = $10,
                last_attempt_at = $11, last_checked_at = $12, updated_at = $13, version = $14
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(operation.id.as_uuid())
        .bind(current as i64)
        .bind(&operation.warehouse_code)
        .bind(&operation.comments)
        .bind(operation.status.as_str())
        .bind(operation.sync_status.map(|s| s.as_str()))
        .bind(operation.external_entry)
        .bind(operation.external_number)
        .bind(operation.retry_count as i32)
        .bind(&operation.last_error)
        .bind(operation.last_attempt_at)
        .bind(operation.last_checked_at)
        .bind(operation.updated_at)
        .bind(next as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_operation", e))?;

        write_lines(&mut tx, operation).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(next)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Operation>, OperationStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE origin = 'local' AND sync_status IN ('pending', 'processing') \
             ORDER BY updated_at ASC, id ASC \
             LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_pending", e))?;

        self.load_many(rows).await
    }

    async fn list_retryable(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE origin = 'local' AND sync_status = 'failed' AND retry_count < $1 \
             ORDER BY last_attempt_at ASC NULLS FIRST, id ASC \
             LIMIT $2"
        ))
        .bind(max_retries as i32)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_retryable", e))?;

        self.load_many(rows).await
    }

    async fn list_exhausted(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE origin = 'local' AND sync_status = 'failed' AND retry_count >= $1 \
             ORDER BY updated_at ASC, id ASC \
             LIMIT $2"
        ))
        .bind(max_retries as i32)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_exhausted", e))?;

        self.load_many(rows).await
    }

    async fn list_stale_mirrors(
        &self,
        checked_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Operation>, OperationStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OPERATION_COLUMNS} FROM operations \
             WHERE origin = 'external' \
               AND status IN ('open', 'in_progress') \
               AND (last_checked_at IS NULL OR last_checked_at < $1) \
             ORDER BY updated_at ASC, id ASC \
             LIMIT $2"
        ))
        .bind(checked_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale_mirrors", e))?;

        self.load_many(rows).await
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, OperationStoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| OperationStoreError::Storage(format!("failed to read {name}: {e}")))
}

fn decode<T>(parsed: Result<T, packline_core::DomainError>) -> Result<T, OperationStoreError> {
    parsed.map_err(|e| OperationStoreError::Storage(e.to_string()))
}

fn operation_from_row(row: &PgRow) -> Result<Operation, OperationStoreError> {
    let kind: String = column(row, "kind")?;
    let origin: String = column(row, "origin")?;
    let status: String = column(row, "status")?;
    let sync_status: Option<String> = column(row, "sync_status")?;
    let retry_count: i32 = column(row, "retry_count")?;
    let version: i64 = column(row, "version")?;

    Ok(Operation {
        id: OperationId::from_uuid(column(row, "id")?),
        kind: decode(OperationKind::parse(&kind))?,
        origin: decode(OperationOrigin::parse(&origin))?,
        warehouse_code: column(row, "warehouse_code")?,
        comments: column(row, "comments")?,
        status: decode(OperationStatus::parse(&status))?,
        sync_status: sync_status
            .map(|s| decode(SyncStatus::parse(&s)))
            .transpose()?,
        external_entry: column(row, "external_entry")?,
        external_number: column(row, "external_number")?,
        retry_count: retry_count.max(0) as u32,
        last_error: column(row, "last_error")?,
        last_attempt_at: column(row, "last_attempt_at")?,
        last_checked_at: column(row, "last_checked_at")?,
        lines: Vec::new(),
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        version: version.max(0) as u64,
    })
}

fn line_from_row(row: &PgRow) -> Result<OperationLine, OperationStoreError> {
    let state: String = column(row, "state")?;
    let commitment_id: Option<uuid::Uuid> = column(row, "commitment_id")?;
    Ok(OperationLine {
        id: OperationLineId::from_uuid(column(row, "id")?),
        item_code: column(row, "item_code")?,
        content_id: ContentId::from_uuid(column(row, "content_id")?),
        quantity: column(row, "quantity")?,
        actual_quantity: column(row, "actual_quantity")?,
        commitment_id: commitment_id.map(CommitmentId::from_uuid),
        state: decode(LineState::parse(&state))?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OperationStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") | Some("55P03") => {
                    OperationStoreError::Conflict(msg)
                }
                _ => OperationStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            OperationStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => OperationStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
