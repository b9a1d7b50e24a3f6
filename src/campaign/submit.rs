//! Campaign intake: validate, fan out per-recipient jobs, persist, enqueue.
//!
//! Submission only records intent. The campaign and every job row land in
//! the store atomically before anything is enqueued, so a crash between the
//! two steps loses nothing: the boot recovery sweep re-enqueues whatever the
//! register is missing.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{Store, StoreError};

use super::model::{Campaign, CampaignStatus, Job, JobStatus, SubmitInput, SubmitReceipt};
use super::queue::DelayQueue;

static RECIPIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("recipient pattern compiles")
});

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Store(StoreError),
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: Arc<DelayQueue>,
    clock: Arc<dyn Clock>,
    default_hourly_limit: u32,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<DelayQueue>,
        clock: Arc<dyn Clock>,
        default_hourly_limit: u32,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            default_hourly_limit,
        }
    }

    /// Accept a campaign. Idempotent on the campaign id: resubmitting an id
    /// the store already holds returns the original receipt with zero
    /// created jobs.
    pub async fn submit(&self, input: SubmitInput) -> Result<SubmitReceipt, SubmitError> {
        let recipients = validate(&input)?;

        let now = self.clock.now();
        let campaign_id = input.campaign_id.unwrap_or_else(Uuid::new_v4);
        let hourly_limit = input.hourly_limit.unwrap_or(self.default_hourly_limit);

        let jobs: Vec<Job> = recipients
            .iter()
            .enumerate()
            .map(|(index, recipient)| Job {
                // Stable per (campaign, recipient): a duplicate submission
                // collides instead of double-scheduling.
                id: Uuid::new_v5(&campaign_id, recipient.as_bytes()),
                campaign_id,
                owner: input.owner.clone(),
                recipient: recipient.clone(),
                scheduled_time: input.start_time
                    + Duration::from_millis(input.delay_ms.saturating_mul(index as u64)),
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                sent_time: None,
                lease_until: None,
            })
            .collect();

        let campaign = Campaign {
            id: campaign_id,
            owner: input.owner,
            subject: input.subject.trim().to_string(),
            body: input.body,
            attachments: input.attachments,
            start_time: input.start_time,
            delay_ms: input.delay_ms,
            hourly_limit,
            total_count: jobs.len() as u32,
            sent_count: 0,
            failed_count: 0,
            status: CampaignStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };

        match self.store.create_campaign_with_jobs(&campaign, &jobs).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists) => {
                let existing = self
                    .store
                    .read_campaign(campaign_id)
                    .await
                    .map_err(SubmitError::Store)?
                    .ok_or(SubmitError::Store(StoreError::NotFound))?;
                tracing::info!(%campaign_id, "duplicate submission, returning original");
                return Ok(SubmitReceipt {
                    campaign_id,
                    total_emails: existing.total_count,
                    status: existing.status,
                    created_jobs: 0,
                });
            }
            Err(e) => return Err(SubmitError::Store(e)),
        }

        tracing::info!(
            %campaign_id,
            recipients = jobs.len(),
            start = %campaign.start_time,
            delay_ms = campaign.delay_ms,
            "campaign scheduled"
        );

        // Durability is already satisfied; the register is volatile and any
        // miss here is repaired by the recovery sweep.
        let created = jobs.len() as u32;
        for job in jobs {
            let due = job.scheduled_time;
            self.queue.enqueue(job, due).await;
        }

        Ok(SubmitReceipt {
            campaign_id,
            total_emails: campaign.total_count,
            status: campaign.status,
            created_jobs: created,
        })
    }
}

/// Check the input and return the trimmed, lowercased, deduplicated
/// recipient list in first-occurrence order.
fn validate(input: &SubmitInput) -> Result<Vec<String>, SubmitError> {
    if input.subject.trim().is_empty() {
        return Err(SubmitError::Validation("subject is required".into()));
    }
    if input.body.trim().is_empty() {
        return Err(SubmitError::Validation("body is required".into()));
    }
    if let Some(0) = input.hourly_limit {
        return Err(SubmitError::Validation(
            "hourlyLimit must be positive".into(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    let mut recipients = Vec::new();
    for raw in &input.recipients {
        let recipient = raw.trim().to_lowercase();
        if recipient.is_empty() {
            continue;
        }
        if !RECIPIENT_RE.is_match(&recipient) {
            return Err(SubmitError::Validation(format!(
                "invalid recipient: {recipient}"
            )));
        }
        if seen.insert(recipient.clone()) {
            recipients.push(recipient);
        }
    }

    if recipients.is_empty() {
        return Err(SubmitError::Validation(
            "at least one recipient is required".into(),
        ));
    }

    Ok(recipients)
}
