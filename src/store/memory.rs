use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::campaign::model::{Campaign, CampaignStatus, Job, JobPatch, JobStatus};
use crate::clock::Clock;

use super::{Store, StoreError};

/// In-memory [`Store`] for development and testing.
///
/// Same visible semantics as the durable backend, including the CAS on
/// `update_job` and forward-only campaign transitions. Not durable.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Inner {
    campaigns: HashMap<Uuid, Campaign>,
    jobs: HashMap<Uuid, Job>,
    rate_counters: HashMap<(String, String), u64>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_campaign_with_jobs(
        &self,
        campaign: &Campaign,
        jobs: &[Job],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.campaigns.contains_key(&campaign.id) {
            return Err(StoreError::AlreadyExists);
        }
        inner.campaigns.insert(campaign.id, campaign.clone());
        for job in jobs {
            inner.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn load_pending_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_time, j.id));
        Ok(jobs)
    }

    async fn update_job(
        &self,
        id: Uuid,
        patch: JobPatch,
        expect: JobStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        if job.status != expect {
            return Err(StoreError::CasMismatch { actual: job.status });
        }
        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(attempts) = patch.attempts {
            job.attempts = attempts;
        }
        if let Some(last_error) = patch.last_error {
            job.last_error = Some(last_error);
        }
        if let Some(sent_time) = patch.sent_time {
            job.sent_time = Some(sent_time);
        }
        if let Some(lease_until) = patch.lease_until {
            job.lease_until = lease_until;
        }
        Ok(())
    }

    async fn recompute_campaign(&self, id: Uuid) -> Result<Campaign, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let (mut sent, mut failed) = (0u32, 0u32);
        for job in inner.jobs.values().filter(|j| j.campaign_id == id) {
            match job.status {
                JobStatus::Sent => sent += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Pending => {}
            }
        }

        let campaign = inner.campaigns.get_mut(&id).ok_or(StoreError::NotFound)?;
        campaign.sent_count = sent;
        campaign.failed_count = failed;
        campaign.status = next_status(campaign.status, sent + failed, campaign.total_count);
        campaign.updated_at = now;
        Ok(campaign.clone())
    }

    async fn read_campaign(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.campaigns.get(&id).cloned())
    }

    async fn list_campaigns_by_owner(&self, owner: &str) -> Result<Vec<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        let mut campaigns: Vec<Campaign> = inner
            .campaigns
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect();
        campaigns.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        Ok(campaigns)
    }

    async fn jobs_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.campaign_id == campaign_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_time, j.id));
        Ok(jobs)
    }

    async fn list_terminal_jobs_by_owner(&self, owner: &str) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.owner == owner && j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_time, j.id));
        Ok(jobs)
    }

    async fn upsert_rate_counter(
        &self,
        hour_bucket: &str,
        sender: &str,
        count: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .rate_counters
            .entry((hour_bucket.to_string(), sender.to_string()))
            .or_insert(0);
        // Counters only grow within a bucket; keep the larger value so a
        // delayed mirror write cannot roll the recovery copy backwards.
        *entry = (*entry).max(count);
        Ok(())
    }

    async fn read_rate_counter(
        &self,
        hour_bucket: &str,
        sender: &str,
    ) -> Result<Option<u64>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rate_counters
            .get(&(hour_bucket.to_string(), sender.to_string()))
            .copied())
    }
}

/// Forward-only campaign status transition.
fn next_status(current: CampaignStatus, terminal: u32, total: u32) -> CampaignStatus {
    if current == CampaignStatus::Completed {
        return CampaignStatus::Completed;
    }
    if total > 0 && terminal >= total {
        CampaignStatus::Completed
    } else if terminal >= 1 {
        CampaignStatus::InProgress
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use time::macros::datetime;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(ManualClock::new(datetime!(2026-03-01 10:00 UTC))))
    }

    fn campaign(id: Uuid, total: u32) -> Campaign {
        let t = datetime!(2026-03-01 10:00 UTC);
        Campaign {
            id,
            owner: "u1".into(),
            subject: "s".into(),
            body: "b".into(),
            attachments: vec![],
            start_time: t,
            delay_ms: 0,
            hourly_limit: 100,
            total_count: total,
            sent_count: 0,
            failed_count: 0,
            status: CampaignStatus::Scheduled,
            created_at: t,
            updated_at: t,
        }
    }

    fn job(campaign_id: Uuid, recipient: &str) -> Job {
        Job {
            id: Uuid::new_v5(&campaign_id, recipient.as_bytes()),
            campaign_id,
            owner: "u1".into(),
            recipient: recipient.into(),
            scheduled_time: datetime!(2026-03-01 10:00 UTC),
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            sent_time: None,
            lease_until: None,
        }
    }

    #[tokio::test]
    async fn duplicate_campaign_is_rejected() {
        let store = store();
        let id = Uuid::new_v4();
        let c = campaign(id, 1);
        let jobs = vec![job(id, "a@x.io")];
        store.create_campaign_with_jobs(&c, &jobs).await.unwrap();
        let err = store.create_campaign_with_jobs(&c, &jobs).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists));
    }

    #[tokio::test]
    async fn update_job_enforces_cas() {
        let store = store();
        let id = Uuid::new_v4();
        let c = campaign(id, 1);
        let jobs = vec![job(id, "a@x.io")];
        store.create_campaign_with_jobs(&c, &jobs).await.unwrap();

        let patch = JobPatch {
            status: Some(JobStatus::Sent),
            ..Default::default()
        };
        store
            .update_job(jobs[0].id, patch.clone(), JobStatus::Pending)
            .await
            .unwrap();

        // Duplicate report: the job already left pending.
        let err = store
            .update_job(jobs[0].id, patch, JobStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::CasMismatch {
                actual: JobStatus::Sent
            }
        ));
    }

    #[tokio::test]
    async fn recompute_transitions_forward_only() {
        let store = store();
        let id = Uuid::new_v4();
        let c = campaign(id, 2);
        let jobs = vec![job(id, "a@x.io"), job(id, "b@x.io")];
        store.create_campaign_with_jobs(&c, &jobs).await.unwrap();

        let c = store.recompute_campaign(id).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Scheduled);

        store
            .update_job(
                jobs[0].id,
                JobPatch {
                    status: Some(JobStatus::Sent),
                    ..Default::default()
                },
                JobStatus::Pending,
            )
            .await
            .unwrap();
        let c = store.recompute_campaign(id).await.unwrap();
        assert_eq!(c.status, CampaignStatus::InProgress);
        assert_eq!((c.sent_count, c.failed_count), (1, 0));

        store
            .update_job(
                jobs[1].id,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    ..Default::default()
                },
                JobStatus::Pending,
            )
            .await
            .unwrap();
        let c = store.recompute_campaign(id).await.unwrap();
        assert_eq!(c.status, CampaignStatus::Completed);
        assert_eq!((c.sent_count, c.failed_count), (1, 1));
    }

    #[tokio::test]
    async fn pending_jobs_come_back_ordered() {
        let store = store();
        let id = Uuid::new_v4();
        let c = campaign(id, 3);
        let mut jobs = vec![job(id, "a@x.io"), job(id, "b@x.io"), job(id, "c@x.io")];
        jobs[1].scheduled_time = datetime!(2026-03-01 10:00:02 UTC);
        jobs[2].scheduled_time = datetime!(2026-03-01 10:00:01 UTC);
        store.create_campaign_with_jobs(&c, &jobs).await.unwrap();

        let pending = store.load_pending_jobs().await.unwrap();
        let recipients: Vec<_> = pending.iter().map(|j| j.recipient.as_str()).collect();
        assert_eq!(recipients, ["a@x.io", "c@x.io", "b@x.io"]);
    }

    #[tokio::test]
    async fn rate_counter_mirror_never_decreases() {
        let store = store();
        store.upsert_rate_counter("2026-03-01T10", "s", 5).await.unwrap();
        store.upsert_rate_counter("2026-03-01T10", "s", 3).await.unwrap();
        assert_eq!(
            store.read_rate_counter("2026-03-01T10", "s").await.unwrap(),
            Some(5)
        );
    }
}
