use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use crate::models::job::{ImageInput, InvalidTransition, Job, JobStatus};
use crate::services::store::{JobStore, StoreError};

const JOB_COLUMNS: &str = "id, user_id, request_id, status, image_count, result, error, \
                           processing_time_ms, created_at, enqueued_at, started_at, completed_at";

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Explain why a conditional update touched no rows.
    async fn transition_error(&self, id: Uuid, to: JobStatus) -> StoreError {
        match self.get(id).await {
            Ok(Some(job)) => StoreError::Transition {
                id,
                source: InvalidTransition {
                    from: job.status,
                    to,
                },
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status")?;
    let status =
        JobStatus::from_str(&status).map_err(|_| StoreError::UnknownStatus(status.clone()))?;

    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        request_id: row.try_get("request_id")?,
        status,
        image_count: row.try_get("image_count")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        created_at: row.try_get("created_at")?,
        enqueued_at: row.try_get("enqueued_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job, inputs: &[ImageInput]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO classification_jobs
                (id, user_id, request_id, status, image_count, created_at, enqueued_at)
            VALUES ($1, $2, $3, 'pending', $4, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(&job.request_id)
        .bind(job.image_count)
        .bind(job.created_at)
        .bind(job.enqueued_at)
        .execute(&mut *tx)
        .await?;

        for (position, input) in inputs.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO classification_job_inputs (job_id, position, content_type, data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(job.id)
            .bind(position as i32)
            .bind(&input.content_type)
            .bind(&input.bytes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM classification_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: &str, limit: u32) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM classification_jobs \
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE classification_jobs
            SET status = 'processing', started_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        result: serde_json::Value,
        processing_time_ms: i64,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE classification_jobs
            SET status = 'completed',
                result = $2,
                error = NULL,
                processing_time_ms = $3,
                completed_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(result)
        .bind(processing_time_ms)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn fail(
        &self,
        id: Uuid,
        error: &str,
        processing_time_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE classification_jobs
            SET status = 'failed',
                result = NULL,
                error = $2,
                processing_time_ms = $3,
                completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(processing_time_ms)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.transition_error(id, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn load_inputs(&self, id: Uuid) -> Result<Vec<ImageInput>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT content_type, data
            FROM classification_job_inputs
            WHERE job_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(ImageInput {
                    content_type: r.try_get("content_type")?,
                    bytes: r.try_get("data")?,
                })
            })
            .collect()
    }

    async fn delete_inputs(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM classification_job_inputs WHERE job_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_stale_pending(
        &self,
        enqueued_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        // SKIP LOCKED keeps sweepers in separate processes off the same rows.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE classification_jobs
            SET enqueued_at = $2
            WHERE id IN (
                SELECT id
                FROM classification_jobs
                WHERE status = 'pending' AND enqueued_at < $1
                ORDER BY enqueued_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(enqueued_before)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn fail_stale_processing(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            UPDATE classification_jobs
            SET status = 'failed',
                result = NULL,
                error = $2,
                completed_at = NOW()
            WHERE status = 'processing' AND COALESCE(started_at, created_at) < $1
            RETURNING id
            "#,
        )
        .bind(started_before)
        .bind(error)
        .fetch_all(&mut *tx)
        .await?;

        let ids = rows
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;

        if !ids.is_empty() {
            sqlx::query("DELETE FROM classification_job_inputs WHERE job_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
