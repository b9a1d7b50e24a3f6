use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::mail::Attachment;

/// Lifecycle of a campaign.
///
/// `Scheduled` until the first job leaves `pending`, `InProgress` while jobs
/// are being worked, `Completed` once every job is terminal. Transitions are
/// forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

// For sqlx: status <-> String conversion
impl TryFrom<String> for CampaignStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "scheduled" => Ok(Self::Scheduled),
            "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown campaign status: {other}")),
        }
    }
}

/// Status of one recipient's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Sent,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// One bulk send request: a subject/body replicated across many recipients.
///
/// `sent_count` and `failed_count` are maintained by the aggregator and are
/// monotonically non-decreasing; `total_count` is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub owner: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub delay_ms: u64,
    pub hourly_limit: u32,
    pub total_count: u32,
    pub sent_count: u32,
    pub failed_count: u32,
    pub status: CampaignStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One recipient's attempt record.
///
/// `scheduled_time` is immutable; retries change only the queue's due time.
/// `lease_until` marks an active worker claim and doubles as the crash
/// recovery signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub owner: String,
    pub recipient: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_time: OffsetDateTime,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sent_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub lease_until: Option<OffsetDateTime>,
}

/// Partial update to a job row. `None` fields are left untouched;
/// `lease_until` distinguishes "leave alone" from "clear".
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub last_error: Option<String>,
    pub sent_time: Option<OffsetDateTime>,
    pub lease_until: Option<Option<OffsetDateTime>>,
}

/// A campaign submission as accepted by the core.
///
/// `campaign_id` is the caller's idempotency key; resubmitting the same id
/// returns the original campaign without creating new jobs.
#[derive(Debug, Clone)]
pub struct SubmitInput {
    pub campaign_id: Option<Uuid>,
    pub owner: String,
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub start_time: OffsetDateTime,
    pub delay_ms: u64,
    pub hourly_limit: Option<u32>,
    pub attachments: Vec<Attachment>,
}

/// What `submit` hands back: enough for the 201 response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub campaign_id: Uuid,
    pub total_emails: u32,
    pub status: CampaignStatus,
    pub created_jobs: u32,
}

/// Attachment listing without the payload bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
}

/// Read model for a campaign, attachment bytes elided.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignView {
    pub id: Uuid,
    pub owner: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<AttachmentMeta>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    pub delay_ms: u64,
    pub hourly_limit: u32,
    pub total_count: u32,
    pub sent_count: u32,
    pub failed_count: u32,
    pub status: CampaignStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&Campaign> for CampaignView {
    fn from(c: &Campaign) -> Self {
        Self {
            id: c.id,
            owner: c.owner.clone(),
            subject: c.subject.clone(),
            body: c.body.clone(),
            attachments: c
                .attachments
                .iter()
                .map(|a| AttachmentMeta {
                    filename: a.filename.clone(),
                    content_type: a.content_type.clone(),
                    size: a.bytes.len(),
                })
                .collect(),
            start_time: c.start_time,
            delay_ms: c.delay_ms,
            hourly_limit: c.hourly_limit,
            total_count: c.total_count,
            sent_count: c.sent_count,
            failed_count: c.failed_count,
            status: c.status,
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

/// Read model for a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_time: OffsetDateTime,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sent_time: Option<OffsetDateTime>,
}

impl From<&Job> for JobView {
    fn from(j: &Job) -> Self {
        Self {
            id: j.id,
            campaign_id: j.campaign_id,
            recipient: j.recipient.clone(),
            scheduled_time: j.scheduled_time,
            status: j.status,
            attempts: j.attempts,
            last_error: j.last_error.clone(),
            sent_time: j.sent_time,
        }
    }
}

/// Campaign plus its jobs, for the detail endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignDetail {
    #[serde(flatten)]
    pub campaign: CampaignView,
    pub jobs: Vec<JobView>,
}
