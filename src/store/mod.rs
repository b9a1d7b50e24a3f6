//! Durable persistence, the recovery source of truth.
//!
//! The queue may lose its state on restart; the [`Store`] never does. Each
//! trait method maps to a single storage operation, so SQL backends are one
//! query per method. [`MemoryStore`] serves development and testing,
//! [`PgStore`] is the durable backend.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::campaign::model::{Campaign, Job, JobPatch, JobStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("campaign already exists")]
    AlreadyExists,

    #[error("not found")]
    NotFound,

    /// The CAS predicate on `update_job` did not hold.
    #[error("job status changed concurrently (now {actual})")]
    CasMismatch { actual: JobStatus },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable campaign and job persistence.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a campaign and all of its jobs atomically: both appear or
    /// neither does. `AlreadyExists` on a duplicate campaign id.
    async fn create_campaign_with_jobs(
        &self,
        campaign: &Campaign,
        jobs: &[Job],
    ) -> Result<(), StoreError>;

    /// All `pending` jobs ordered by `scheduled_time`. Boot recovery reads
    /// this to rebuild the queue.
    async fn load_pending_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Apply `patch` to a job if and only if its current status is `expect`.
    ///
    /// The predicate stops a late duplicate worker from double-transitioning
    /// a job; violations surface as `CasMismatch`.
    async fn update_job(
        &self,
        id: Uuid,
        patch: JobPatch,
        expect: JobStatus,
    ) -> Result<(), StoreError>;

    /// Re-derive `sent_count`, `failed_count`, and `status` from the
    /// campaign's jobs and write them back. Status never moves backwards.
    async fn recompute_campaign(&self, id: Uuid) -> Result<Campaign, StoreError>;

    async fn read_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError>;

    async fn list_campaigns_by_owner(&self, owner: &str) -> Result<Vec<Campaign>, StoreError>;

    /// Jobs of one campaign, ordered by `scheduled_time`.
    async fn jobs_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError>;

    /// Sent and failed jobs across an owner's campaigns.
    async fn list_terminal_jobs_by_owner(&self, owner: &str) -> Result<Vec<Job>, StoreError>;

    /// Mirror of the KV rate counter, used to reseed after eviction.
    async fn upsert_rate_counter(
        &self,
        hour_bucket: &str,
        sender: &str,
        count: u64,
    ) -> Result<(), StoreError>;

    async fn read_rate_counter(
        &self,
        hour_bucket: &str,
        sender: &str,
    ) -> Result<Option<u64>, StoreError>;
}
