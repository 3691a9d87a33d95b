//! Postgres-backed batch completion tracker.
//!
//! Each tracker operation is one SQL statement. Counters are incremented in place
//! (`SET x = x + 1`), so concurrent stage handlers never lose an update, and the
//! `completed_within_total` check constraint rejects any total smaller than the
//! completed count.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TrackerError |
//! |------------|----------------------|--------------|
//! | Database (check constraint violation) | `23514` | `Domain(InvariantViolation)` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use nomflow_core::{
    DomainError, FileOutcome, RecordCounts, RequestId, RequestStatus, UploadId, UploadRequest,
};

use super::{BatchCompletionTracker, TrackerError};

/// Embedded schema migrations for the tracker tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

const REQUEST_COLUMNS: &str = r#"
    request_id,
    upload_id,
    scope,
    total_dgraph_batches,
    dgraph_completed_batches,
    postgres_success,
    status,
    records_succeeded,
    records_failed,
    created_by,
    created_at,
    updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresTracker {
    pool: Arc<PgPool>,
}

impl PostgresTracker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), TrackerError> {
        MIGRATOR
            .run(&*self.pool)
            .await
            .map_err(|e| TrackerError::Storage(format!("migration failed: {e}")))
    }

    /// Register a pending request. Returns the existing row if the upload is already known.
    #[instrument(skip(self), fields(upload_id = %upload_id), err)]
    pub async fn register(
        &self,
        upload_id: &UploadId,
        scope: &str,
        created_by: Option<&str>,
    ) -> Result<UploadRequest, TrackerError> {
        let sql = format!(
            r#"
            INSERT INTO nominative_user_requests (upload_id, scope, created_by)
            VALUES ($1, $2, $3)
            ON CONFLICT (upload_id) DO UPDATE SET upload_id = EXCLUDED.upload_id
            RETURNING {REQUEST_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(upload_id.as_str())
            .bind(scope)
            .bind(created_by)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("register", e))?;
        request_from_row(&row)
    }

    /// Store a per-file outcome (written by the upload service in production).
    #[instrument(skip(self, outcome), fields(request_id = %request_id, file = %outcome.file_name), err)]
    pub async fn upsert_file_outcome(
        &self,
        request_id: RequestId,
        scope: &str,
        outcome: &FileOutcome,
    ) -> Result<(), TrackerError> {
        sqlx::query(
            r#"
            INSERT INTO nominative_user_request_files
                (request_id, scope, file_name, records_succeeded, records_failed)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (request_id, scope, file_name)
            DO UPDATE SET
                records_succeeded = EXCLUDED.records_succeeded,
                records_failed = EXCLUDED.records_failed
            "#,
        )
        .bind(request_id.get())
        .bind(scope)
        .bind(&outcome.file_name)
        .bind(outcome.records.succeeded)
        .bind(outcome.records.failed)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_file_outcome", e))?;
        Ok(())
    }

    async fn fetch(&self, upload_id: &UploadId) -> Result<Option<UploadRequest>, TrackerError> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM nominative_user_requests WHERE upload_id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(upload_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(request_from_row).transpose()
    }

    async fn set_total(
        &self,
        operation: &'static str,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
        mark_postgres_success: bool,
    ) -> Result<UploadRequest, TrackerError> {
        if total_batches < 0 {
            return Err(DomainError::validation(format!(
                "total_dgraph_batches must be >= 0, got {total_batches}"
            ))
            .into());
        }

        let sql = format!(
            r#"
            UPDATE nominative_user_requests
            SET total_dgraph_batches = $2,
                records_succeeded = $3,
                records_failed = $4,
                postgres_success = postgres_success OR $5,
                updated_at = NOW()
            WHERE upload_id = $1
            RETURNING {REQUEST_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(upload_id.as_str())
            .bind(total_batches)
            .bind(records.succeeded)
            .bind(records.failed)
            .bind(mark_postgres_success)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        match row {
            Some(row) => request_from_row(&row),
            None => Err(TrackerError::NotFound(upload_id.clone())),
        }
    }
}

#[async_trait]
impl BatchCompletionTracker for PostgresTracker {
    #[instrument(skip(self), fields(upload_id = %upload_id), err)]
    async fn get(&self, upload_id: &UploadId) -> Result<UploadRequest, TrackerError> {
        self.fetch(upload_id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(upload_id.clone()))
    }

    #[instrument(skip(self, records), fields(upload_id = %upload_id), err)]
    async fn record_upload_analysis(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError> {
        self.set_total("record_upload_analysis", upload_id, total_batches, records, false)
            .await
    }

    #[instrument(skip(self, records), fields(upload_id = %upload_id), err)]
    async fn record_relational_stage_completion(
        &self,
        upload_id: &UploadId,
        total_batches: i32,
        records: RecordCounts,
    ) -> Result<UploadRequest, TrackerError> {
        self.set_total(
            "record_relational_stage_completion",
            upload_id,
            total_batches,
            records,
            true,
        )
        .await
    }

    #[instrument(skip(self), fields(upload_id = %upload_id, batch = ?batch, counted), err)]
    async fn record_graph_stage_batch_success(
        &self,
        upload_id: &UploadId,
        batch: Option<i32>,
    ) -> Result<UploadRequest, TrackerError> {
        let sql = match batch {
            // The ack insert and the increment run in one statement: a batch index
            // already present inserts nothing, so nothing is incremented.
            Some(_) => format!(
                r#"
                WITH ack AS (
                    INSERT INTO nominative_user_batch_acks (request_id, batch_index)
                    SELECT request_id, $2 FROM nominative_user_requests WHERE upload_id = $1
                    ON CONFLICT (request_id, batch_index) DO NOTHING
                    RETURNING request_id
                )
                UPDATE nominative_user_requests r
                SET dgraph_completed_batches = r.dgraph_completed_batches + 1,
                    updated_at = NOW()
                FROM ack
                WHERE r.request_id = ack.request_id
                  AND (r.total_dgraph_batches IS NULL
                       OR r.dgraph_completed_batches < r.total_dgraph_batches)
                RETURNING {}
                "#,
                qualified_columns("r")
            ),
            None => format!(
                r#"
                UPDATE nominative_user_requests
                SET dgraph_completed_batches = dgraph_completed_batches + 1,
                    updated_at = NOW()
                WHERE upload_id = $1
                  AND (total_dgraph_batches IS NULL
                       OR dgraph_completed_batches < total_dgraph_batches)
                RETURNING {REQUEST_COLUMNS}
                "#
            ),
        };

        let mut query = sqlx::query(&sql).bind(upload_id.as_str());
        if let Some(index) = batch {
            query = query.bind(index);
        }
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_graph_stage_batch_success", e))?;

        let span = Span::current();
        match row {
            Some(row) => {
                span.record("counted", true);
                request_from_row(&row)
            }
            None => {
                // Duplicate batch or total already reached; report the row as it stands.
                span.record("counted", false);
                self.get(upload_id).await
            }
        }
    }

    #[instrument(skip(self), fields(request_id = %request_id, scope = %scope), err)]
    async fn list_file_outcomes(
        &self,
        request_id: RequestId,
        scope: &str,
    ) -> Result<Vec<FileOutcome>, TrackerError> {
        let rows = sqlx::query(
            r#"
            SELECT file_name, records_succeeded, records_failed
            FROM nominative_user_request_files
            WHERE request_id = $1 AND scope = $2
            ORDER BY file_name ASC
            "#,
        )
        .bind(request_id.get())
        .bind(scope)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_file_outcomes", e))?;

        rows.iter()
            .map(|row| {
                Ok(FileOutcome::new(
                    row.try_get::<String, _>("file_name").map_err(decode_error)?,
                    row.try_get::<i64, _>("records_succeeded").map_err(decode_error)?,
                    row.try_get::<i64, _>("records_failed").map_err(decode_error)?,
                ))
            })
            .collect()
    }

    #[instrument(skip(self), fields(request_id = %request_id, status = %status), err)]
    async fn finalize(
        &self,
        request_id: RequestId,
        status: RequestStatus,
    ) -> Result<bool, TrackerError> {
        if !status.is_terminal() {
            return Err(DomainError::validation("cannot finalize to PENDING").into());
        }

        let result = sqlx::query(
            r#"
            UPDATE nominative_user_requests
            SET status = $2, updated_at = NOW()
            WHERE request_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(request_id.get())
        .bind(status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize", e))?;

        Ok(result.rows_affected() == 1)
    }
}

fn qualified_columns(alias: &str) -> String {
    REQUEST_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn request_from_row(row: &PgRow) -> Result<UploadRequest, TrackerError> {
    let upload_id: String = row.try_get("upload_id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;

    Ok(UploadRequest {
        request_id: RequestId::new(row.try_get("request_id").map_err(decode_error)?),
        upload_id: UploadId::new(upload_id)?,
        scope: row.try_get("scope").map_err(decode_error)?,
        total_dgraph_batches: row.try_get("total_dgraph_batches").map_err(decode_error)?,
        dgraph_completed_batches: row
            .try_get("dgraph_completed_batches")
            .map_err(decode_error)?,
        postgres_success: row.try_get("postgres_success").map_err(decode_error)?,
        status: status.parse()?,
        records: RecordCounts::new(
            row.try_get("records_succeeded").map_err(decode_error)?,
            row.try_get("records_failed").map_err(decode_error)?,
        ),
        created_by: row.try_get("created_by").map_err(decode_error)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode_error)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> TrackerError {
    TrackerError::Storage(format!("failed to decode request row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TrackerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => TrackerError::Domain(DomainError::invariant(msg)),
                _ => TrackerError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            TrackerError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => TrackerError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
