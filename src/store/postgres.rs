//! Postgres-backed [`Store`] using sqlx.
//!
//! Queries are runtime-bound; the schema is bootstrapped at connect so a
//! fresh database is usable immediately. Counter columns are stored as
//! signed integers (Postgres has no unsigned types) and converted at the
//! edges.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::campaign::model::{Campaign, CampaignStatus, Job, JobPatch, JobStatus};
use crate::mail::Attachment;

use super::{Store, StoreError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS campaigns (
        id UUID PRIMARY KEY,
        owner TEXT NOT NULL,
        subject TEXT NOT NULL,
        body TEXT NOT NULL,
        attachments TEXT NOT NULL DEFAULT '[]',
        start_time TIMESTAMPTZ NOT NULL,
        delay_ms BIGINT NOT NULL,
        hourly_limit INTEGER NOT NULL,
        total_count INTEGER NOT NULL,
        sent_count INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        campaign_id UUID NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
        owner TEXT NOT NULL,
        recipient TEXT NOT NULL,
        scheduled_time TIMESTAMPTZ NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        sent_time TIMESTAMPTZ,
        lease_until TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS jobs_campaign_idx ON jobs (campaign_id)",
    "CREATE INDEX IF NOT EXISTS jobs_due_idx ON jobs (status, scheduled_time)",
    "CREATE INDEX IF NOT EXISTS jobs_owner_idx ON jobs (owner, status)",
    "CREATE TABLE IF NOT EXISTS rate_counters (
        hour_bucket TEXT NOT NULL,
        sender TEXT NOT NULL,
        count BIGINT NOT NULL,
        PRIMARY KEY (hour_bucket, sender)
    )",
];

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(dsn)
            .await
            .map_err(backend)?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await.map_err(backend)?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map_or(false, |db| db.is_unique_violation())
}

fn map_campaign(row: &PgRow) -> Result<Campaign, StoreError> {
    let attachments_json: String = row.try_get("attachments").map_err(backend)?;
    let attachments: Vec<Attachment> =
        serde_json::from_str(&attachments_json).map_err(|e| StoreError::Backend(e.to_string()))?;
    let status: String = row.try_get("status").map_err(backend)?;

    Ok(Campaign {
        id: row.try_get("id").map_err(backend)?,
        owner: row.try_get("owner").map_err(backend)?,
        subject: row.try_get("subject").map_err(backend)?,
        body: row.try_get("body").map_err(backend)?,
        attachments,
        start_time: row.try_get("start_time").map_err(backend)?,
        delay_ms: row.try_get::<i64, _>("delay_ms").map_err(backend)? as u64,
        hourly_limit: row.try_get::<i32, _>("hourly_limit").map_err(backend)? as u32,
        total_count: row.try_get::<i32, _>("total_count").map_err(backend)? as u32,
        sent_count: row.try_get::<i32, _>("sent_count").map_err(backend)? as u32,
        failed_count: row.try_get::<i32, _>("failed_count").map_err(backend)? as u32,
        status: CampaignStatus::try_from(status).map_err(StoreError::Backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn map_job(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Job {
        id: row.try_get("id").map_err(backend)?,
        campaign_id: row.try_get("campaign_id").map_err(backend)?,
        owner: row.try_get("owner").map_err(backend)?,
        recipient: row.try_get("recipient").map_err(backend)?,
        scheduled_time: row.try_get("scheduled_time").map_err(backend)?,
        status: JobStatus::try_from(status).map_err(StoreError::Backend)?,
        attempts: row.try_get::<i32, _>("attempts").map_err(backend)? as u32,
        last_error: row.try_get("last_error").map_err(backend)?,
        sent_time: row.try_get("sent_time").map_err(backend)?,
        lease_until: row.try_get("lease_until").map_err(backend)?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_campaign_with_jobs(
        &self,
        campaign: &Campaign,
        jobs: &[Job],
    ) -> Result<(), StoreError> {
        let attachments_json = serde_json::to_string(&campaign.attachments)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(backend)?;

        let inserted = sqlx::query(
            "INSERT INTO campaigns
                (id, owner, subject, body, attachments, start_time, delay_ms, hourly_limit,
                 total_count, sent_count, failed_count, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(campaign.id)
        .bind(&campaign.owner)
        .bind(&campaign.subject)
        .bind(&campaign.body)
        .bind(&attachments_json)
        .bind(campaign.start_time)
        .bind(campaign.delay_ms as i64)
        .bind(campaign.hourly_limit as i32)
        .bind(campaign.total_count as i32)
        .bind(campaign.sent_count as i32)
        .bind(campaign.failed_count as i32)
        .bind(campaign.status.to_string())
        .bind(campaign.created_at)
        .bind(campaign.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(if is_unique_violation(&e) {
                StoreError::AlreadyExists
            } else {
                backend(e)
            });
        }

        for job in jobs {
            sqlx::query(
                "INSERT INTO jobs
                    (id, campaign_id, owner, recipient, scheduled_time, status, attempts,
                     last_error, sent_time, lease_until)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(job.id)
            .bind(job.campaign_id)
            .bind(&job.owner)
            .bind(&job.recipient)
            .bind(job.scheduled_time)
            .bind(job.status.to_string())
            .bind(job.attempts as i32)
            .bind(&job.last_error)
            .bind(job.sent_time)
            .bind(job.lease_until)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)
    }

    async fn load_pending_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'pending' ORDER BY scheduled_time, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(map_job).collect()
    }

    async fn update_job(
        &self,
        id: Uuid,
        patch: JobPatch,
        expect: JobStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET
                status = COALESCE($3, status),
                attempts = COALESCE($4, attempts),
                last_error = COALESCE($5, last_error),
                sent_time = COALESCE($6, sent_time),
                lease_until = CASE WHEN $7 THEN $8 ELSE lease_until END
             WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(expect.to_string())
        .bind(patch.status.map(|s| s.to_string()))
        .bind(patch.attempts.map(|a| a as i32))
        .bind(patch.last_error)
        .bind(patch.sent_time)
        .bind(patch.lease_until.is_some())
        .bind(patch.lease_until.flatten())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Distinguish a lost CAS race from a missing row.
        let actual: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match actual {
            Some(status) => Err(StoreError::CasMismatch {
                actual: JobStatus::try_from(status).map_err(StoreError::Backend)?,
            }),
            None => Err(StoreError::NotFound),
        }
    }

    async fn recompute_campaign(&self, id: Uuid) -> Result<Campaign, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let counts = sqlx::query(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
             FROM jobs WHERE campaign_id = $1",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend)?;
        let sent: i64 = counts.try_get("sent").map_err(backend)?;
        let failed: i64 = counts.try_get("failed").map_err(backend)?;

        let row = sqlx::query(
            "UPDATE campaigns SET
                sent_count = $2,
                failed_count = $3,
                status = CASE
                    WHEN status = 'completed' THEN 'completed'
                    WHEN total_count > 0 AND $2 + $3 >= total_count THEN 'completed'
                    WHEN $2 + $3 >= 1 THEN 'in-progress'
                    ELSE status
                END,
                updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(sent as i32)
        .bind(failed as i32)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let row = row.ok_or(StoreError::NotFound)?;
        let campaign = map_campaign(&row)?;
        tx.commit().await.map_err(backend)?;
        Ok(campaign)
    }

    async fn read_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(map_campaign).transpose()
    }

    async fn list_campaigns_by_owner(&self, owner: &str) -> Result<Vec<Campaign>, StoreError> {
        let rows = sqlx::query("SELECT * FROM campaigns WHERE owner = $1 ORDER BY created_at DESC")
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(map_campaign).collect()
    }

    async fn jobs_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE campaign_id = $1 ORDER BY scheduled_time, id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(map_job).collect()
    }

    async fn list_terminal_jobs_by_owner(&self, owner: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs
             WHERE owner = $1 AND status IN ('sent', 'failed')
             ORDER BY scheduled_time, id",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(map_job).collect()
    }

    async fn upsert_rate_counter(
        &self,
        hour_bucket: &str,
        sender: &str,
        count: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rate_counters (hour_bucket, sender, count)
             VALUES ($1, $2, $3)
             ON CONFLICT (hour_bucket, sender)
             DO UPDATE SET count = GREATEST(rate_counters.count, EXCLUDED.count)",
        )
        .bind(hour_bucket)
        .bind(sender)
        .bind(count as i64)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn read_rate_counter(
        &self,
        hour_bucket: &str,
        sender: &str,
    ) -> Result<Option<u64>, StoreError> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM rate_counters WHERE hour_bucket = $1 AND sender = $2",
        )
        .bind(hour_bucket)
        .bind(sender)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(count.map(|c| c as u64))
    }
}
