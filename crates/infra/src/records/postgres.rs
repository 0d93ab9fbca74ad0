//! Postgres-backed job records.
//!
//! Rows live in `video_jobs` (see `migrations/0001_video_jobs.sql`). Status
//! transitions are single conditional `UPDATE`s, so two finalizers racing on
//! the same job see exactly one `rows_affected() == 1`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | RecordError |
//! |------------|-----------------|-------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (other) | any | `Unavailable` |
//! | PoolClosed / Io / other | N/A | `Unavailable` |
//! | Row decode | N/A | `Decode` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use reelgen_ai::GeneratedMetadata;
use reelgen_core::{JobId, JobStatus, MetadataStatus, UserId, VideoJob};

use super::r#trait::{JobRepository, RecordError, SchemaSupport, check_metadata_transition};

const SELECT_COLUMNS: &str = r#"
    id, user_id, status, credits_charged, provider_job_id, template_name, prompt,
    parameters, priority, queue_position, locale, title, description, metadata_status,
    result_url, error_message, created_at, processing_started_at, processing_completed_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_jobs(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<VideoJob>, RecordError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self), err)]
    async fn probe_schema(&self) -> Result<SchemaSupport, RecordError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name
            FROM information_schema.columns
            WHERE table_name = 'video_jobs'
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("probe_schema", e))?;

        let mut present = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("column_name")
                .map_err(|e| RecordError::Decode(format!("column_name: {e}")))?;
            present.push(name);
        }
        Ok(SchemaSupport::from_present(&present))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, user_id = %job.user_id), err)]
    async fn create(&self, job: &VideoJob) -> Result<(), RecordError> {
        let result = sqlx::query(
            r#"
            INSERT INTO video_jobs (
                id, user_id, status, credits_charged, provider_job_id, template_name, prompt,
                parameters, priority, queue_position, locale, title, description, metadata_status,
                result_url, error_message, created_at, processing_started_at, processing_completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.credits_charged as i32)
        .bind(job.provider_job_id.as_deref())
        .bind(&job.template_name)
        .bind(&job.prompt)
        .bind(JsonValue::Object(job.parameters.clone()))
        .bind(job.priority)
        .bind(job.queue_position.map(|p| p as i32))
        .bind(&job.locale)
        .bind(&job.title)
        .bind(&job.description)
        .bind(job.metadata_status.as_str())
        .bind(job.result_url.as_deref())
        .bind(job.error_message.as_deref())
        .bind(job.created_at)
        .bind(job.processing_started_at)
        .bind(job.processing_completed_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(RecordError::Duplicate(job.id)),
            Err(e) => Err(map_sqlx_error("create", e)),
        }
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<VideoJob>, RecordError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM video_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn count_by_status_for_user(
        &self,
        user_id: UserId,
        status: JobStatus,
    ) -> Result<usize, RecordError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM video_jobs WHERE user_id = $1 AND status = $2",
        )
        .bind(user_id.as_uuid())
        .bind(status.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_status_for_user", e))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| RecordError::Decode(format!("count: {e}")))?;
        Ok(n.max(0) as usize)
    }

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<VideoJob>, RecordError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM video_jobs WHERE status = $1 ORDER BY created_at ASC"
        );
        self.fetch_jobs("list_by_status", sqlx::query(&sql).bind(status.as_str()))
            .await
    }

    async fn list_for_user_by_status(
        &self,
        user_id: UserId,
        status: JobStatus,
    ) -> Result<Vec<VideoJob>, RecordError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM video_jobs \
             WHERE user_id = $1 AND status = $2 ORDER BY created_at ASC"
        );
        self.fetch_jobs(
            "list_for_user_by_status",
            sqlx::query(&sql)
                .bind(user_id.as_uuid())
                .bind(status.as_str()),
        )
        .await
    }

    async fn list_processing_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<VideoJob>, RecordError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM video_jobs \
             WHERE status = 'processing' AND COALESCE(processing_started_at, created_at) < $1 \
             ORDER BY created_at ASC"
        );
        self.fetch_jobs(
            "list_processing_started_before",
            sqlx::query(&sql).bind(cutoff),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn mark_processing(&self, job_id: JobId, at: DateTime<Utc>) -> Result<bool, RecordError> {
        let result = sqlx::query(
            r#"
            UPDATE video_jobs
            SET status = 'processing', processing_started_at = $2, queue_position = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn mark_completed(
        &self,
        job_id: JobId,
        artifact_url: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RecordError> {
        let result = sqlx::query(
            r#"
            UPDATE video_jobs
            SET status = 'completed',
                result_url = COALESCE($2, result_url),
                processing_completed_at = $3,
                queue_position = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(artifact_url)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_completed", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, message), err)]
    async fn mark_failed(
        &self,
        job_id: JobId,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RecordError> {
        let result = sqlx::query(
            r#"
            UPDATE video_jobs
            SET status = 'failed',
                error_message = $2,
                processing_completed_at = $3,
                queue_position = NULL
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_provider_job_id(
        &self,
        job_id: JobId,
        provider_job_id: &str,
    ) -> Result<(), RecordError> {
        sqlx::query("UPDATE video_jobs SET provider_job_id = $2 WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(provider_job_id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_provider_job_id", e))?;
        Ok(())
    }

    async fn set_queue_position(
        &self,
        job_id: JobId,
        position: Option<u32>,
    ) -> Result<(), RecordError> {
        sqlx::query(
            "UPDATE video_jobs SET queue_position = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(job_id.as_uuid())
        .bind(position.map(|p| p as i32))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_queue_position", e))?;
        Ok(())
    }

    #[instrument(skip(self, metadata), err)]
    async fn update_metadata_if(
        &self,
        job_id: JobId,
        expected: MetadataStatus,
        metadata: &GeneratedMetadata,
        new_status: MetadataStatus,
    ) -> Result<bool, RecordError> {
        check_metadata_transition(expected, new_status)?;
        let result = sqlx::query(
            r#"
            UPDATE video_jobs
            SET title = $3, description = $4, metadata_status = $5
            WHERE id = $1 AND metadata_status = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(expected.as_str())
        .bind(&metadata.title)
        .bind(&metadata.description)
        .bind(new_status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_metadata_if", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn metadata_status(&self, job_id: JobId) -> Result<Option<MetadataStatus>, RecordError> {
        let row = sqlx::query("SELECT metadata_status FROM video_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("metadata_status", e))?;
        match row {
            Some(row) => {
                let raw: String = row
                    .try_get("metadata_status")
                    .map_err(|e| RecordError::Decode(format!("metadata_status: {e}")))?;
                raw.parse()
                    .map(Some)
                    .map_err(|e: reelgen_core::DomainError| RecordError::Decode(e.to_string()))
            }
            None => Ok(None),
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<VideoJob, RecordError> {
    fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, RecordError>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get(column)
            .map_err(|e| RecordError::Decode(format!("{column}: {e}")))
    }

    let status: String = get(row, "status")?;
    let metadata_status: String = get(row, "metadata_status")?;
    let parameters: JsonValue = get(row, "parameters")?;
    let credits: i32 = get(row, "credits_charged")?;
    let queue_position: Option<i32> = get(row, "queue_position")?;
    let id: Uuid = get(row, "id")?;
    let user_id: Uuid = get(row, "user_id")?;

    Ok(VideoJob {
        id: JobId::from_uuid(id),
        user_id: UserId::from_uuid(user_id),
        status: status
            .parse()
            .map_err(|e: reelgen_core::DomainError| RecordError::Decode(e.to_string()))?,
        credits_charged: credits.max(0) as u32,
        provider_job_id: get(row, "provider_job_id")?,
        template_name: get(row, "template_name")?,
        prompt: get(row, "prompt")?,
        parameters: match parameters {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        },
        priority: get(row, "priority")?,
        queue_position: queue_position.map(|p| p.max(0) as u32),
        locale: get(row, "locale")?,
        title: get(row, "title")?,
        description: get(row, "description")?,
        metadata_status: metadata_status
            .parse()
            .map_err(|e: reelgen_core::DomainError| RecordError::Decode(e.to_string()))?,
        result_url: get(row, "result_url")?,
        error_message: get(row, "error_message")?,
        created_at: get(row, "created_at")?,
        processing_started_at: get(row, "processing_started_at")?,
        processing_completed_at: get(row, "processing_completed_at")?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RecordError {
    match err {
        sqlx::Error::Database(db_err) => RecordError::Unavailable(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            RecordError::Unavailable(format!("connection pool closed in {operation}"))
        }
        other => RecordError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
