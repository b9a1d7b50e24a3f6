//! Send workers.
//!
//! Each worker loops: lease a due job, check the hourly budget, send through
//! the Mailer, record the transition in the store, and tell the aggregator.
//! Every per-job error becomes a job transition; the only thing that stops a
//! worker is a store that stays unavailable after bounded retries, because a
//! send must never proceed without durably recorded intent.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::clock::Clock;
use crate::mail::{Email, Mailer};
use crate::store::{Store, StoreError};

use super::limiter::RateLimiter;
use super::model::{Campaign, Job, JobPatch, JobStatus};
use super::progress::ProgressHandle;
use super::queue::{DelayQueue, FailOutcome, Lease, LeasedJob};

/// Delay before re-checking the budget when the KV backend itself errors.
const KV_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerOpts {
    pub concurrency: usize,
    pub lease_duration: Duration,
    /// Minimum post-send sleep; a campaign's own stagger can raise it.
    pub pacing_floor: Duration,
    /// Envelope-from identity the hourly budget is counted against.
    pub sender: String,
    pub send_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WorkerOpts {
    fn default() -> Self {
        Self {
            concurrency: 5,
            lease_duration: Duration::from_secs(60),
            pacing_floor: Duration::from_secs(2),
            sender: "noreply@reachinbox.app".to_string(),
            send_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Process-wide liveness flag. Flipped when a worker halts on persistent
/// storage failure; the HTTP facade reports it and rejects new submissions.
#[derive(Debug, Default)]
pub struct Health(AtomicBool);

impl Health {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn is_healthy(&self) -> bool {
        !self.0.load(Ordering::Relaxed)
    }

    pub fn mark_unhealthy(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub(crate) struct WorkerCtx {
    pub queue: Arc<DelayQueue>,
    pub store: Arc<dyn Store>,
    pub limiter: Arc<RateLimiter>,
    pub mailer: Arc<dyn Mailer>,
    pub clock: Arc<dyn Clock>,
    pub progress: ProgressHandle,
    pub health: Arc<Health>,
    pub opts: WorkerOpts,
}

/// Spawn the worker pool. Workers stop leasing when `shutdown` flips; an
/// in-flight job runs to completion first.
pub(crate) fn spawn(ctx: Arc<WorkerCtx>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    (1..=ctx.opts.concurrency)
        .map(|n| {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("worker-{n}");
            tokio::spawn(run(ctx, worker_id, shutdown))
        })
        .collect()
}

async fn run(ctx: Arc<WorkerCtx>, worker_id: String, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!(%worker_id, "worker started");
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        match ctx.queue.lease_next(&worker_id, ctx.opts.lease_duration).await {
            Lease::Ready(leased) => {
                let job_id = leased.job.id;
                let span = tracing::info_span!(
                    "job",
                    %job_id,
                    campaign_id = %leased.job.campaign_id,
                    recipient = %leased.job.recipient,
                );
                if let Err(e) = process(&ctx, leased).instrument(span).await {
                    ctx.queue.release(job_id).await;
                    ctx.health.mark_unhealthy();
                    tracing::error!(%worker_id, error = %e, "store unavailable, worker halting");
                    break;
                }
            }
            Lease::Empty => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = ctx.queue.idle_wait(None) => {}
                    _ = ctx.clock.sleep(ctx.opts.poll_interval) => {}
                }
            }
            Lease::WaitUntil(t) => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = ctx.queue.idle_wait(Some(t)) => {}
                }
            }
        }
    }
    tracing::debug!(%worker_id, "worker stopped");
}

/// Tagged outcome of one delivery attempt.
#[derive(Debug)]
enum Dispatch {
    Sent,
    DeferredUntil(OffsetDateTime),
    RetryableFailure(String),
    PermanentFailure(String),
}

async fn process(ctx: &WorkerCtx, leased: LeasedJob) -> Result<(), StoreError> {
    let job = leased.job;

    let campaign = match store_retry(&ctx.clock, || ctx.store.read_campaign(job.campaign_id)).await
    {
        Ok(Some(campaign)) => campaign,
        Ok(None) => {
            tracing::warn!("job references a missing campaign, dropping");
            ctx.queue.complete(job.id).await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let this_attempt = leased.attempts + 1;
    match attempt_send(ctx, &campaign, &job).await {
        Dispatch::Sent => {
            let now = ctx.clock.now();
            let patch = JobPatch {
                status: Some(JobStatus::Sent),
                attempts: Some(this_attempt),
                sent_time: Some(now),
                lease_until: Some(None),
                ..Default::default()
            };
            update_pending(ctx, job.id, patch).await?;
            ctx.queue.complete(job.id).await;
            ctx.progress.notify(job.campaign_id);
            tracing::info!(attempt = this_attempt, "email sent");

            let pacing = ctx
                .opts
                .pacing_floor
                .max(Duration::from_millis(campaign.delay_ms));
            if !pacing.is_zero() {
                ctx.clock.sleep(pacing).await;
            }
        }
        Dispatch::DeferredUntil(until) => {
            ctx.queue.defer(job.id, until).await;
        }
        Dispatch::RetryableFailure(error) => match ctx.queue.fail(job.id).await {
            FailOutcome::Retried { attempts, next_due } => {
                tracing::warn!(%error, attempts, next_due = %next_due, "send failed, retry scheduled");
                let patch = JobPatch {
                    attempts: Some(attempts),
                    last_error: Some(error),
                    lease_until: Some(None),
                    ..Default::default()
                };
                // Still pending; a lost CAS means the job went terminal
                // elsewhere and the queued retry must be withdrawn.
                if !update_pending(ctx, job.id, patch).await? {
                    ctx.queue.complete(job.id).await;
                }
            }
            FailOutcome::Permanent { attempts } => {
                tracing::error!(%error, attempts, "retry budget exhausted, job failed");
                let patch = JobPatch {
                    status: Some(JobStatus::Failed),
                    attempts: Some(attempts),
                    last_error: Some(error),
                    lease_until: Some(None),
                    ..Default::default()
                };
                update_pending(ctx, job.id, patch).await?;
                ctx.progress.notify(job.campaign_id);
            }
        },
        Dispatch::PermanentFailure(error) => {
            tracing::error!(%error, "permanent delivery failure");
            let patch = JobPatch {
                status: Some(JobStatus::Failed),
                attempts: Some(this_attempt),
                last_error: Some(error),
                lease_until: Some(None),
                ..Default::default()
            };
            update_pending(ctx, job.id, patch).await?;
            ctx.queue.complete(job.id).await;
            ctx.progress.notify(job.campaign_id);
        }
    }

    Ok(())
}

/// One budget-checked delivery attempt, classified.
async fn attempt_send(ctx: &WorkerCtx, campaign: &Campaign, job: &Job) -> Dispatch {
    let decision = match ctx.limiter.check(&ctx.opts.sender, campaign.hourly_limit).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!(error = %e, "budget check unavailable, deferring briefly");
            return Dispatch::DeferredUntil(ctx.clock.now() + KV_RETRY_DELAY);
        }
    };
    if !decision.allowed {
        tracing::info!(
            current = decision.current,
            limit = campaign.hourly_limit,
            until = %decision.next_bucket_start,
            "hourly budget exhausted, deferring"
        );
        return Dispatch::DeferredUntil(decision.next_bucket_start);
    }

    // Count before sending so concurrent overshoot is bounded by the worker
    // count, not by Mailer latency.
    if let Err(e) = ctx.limiter.increment(&ctx.opts.sender).await {
        tracing::warn!(error = %e, "budget increment unavailable, deferring briefly");
        return Dispatch::DeferredUntil(ctx.clock.now() + KV_RETRY_DELAY);
    }

    let email = match compose(campaign, job, &ctx.opts.sender) {
        Ok(email) => email,
        Err(e) => return Dispatch::PermanentFailure(e.to_string()),
    };

    match tokio::time::timeout(ctx.opts.send_timeout, ctx.mailer.send(&email)).await {
        Ok(Ok(())) => Dispatch::Sent,
        Ok(Err(e)) if e.is_permanent() => Dispatch::PermanentFailure(e.to_string()),
        Ok(Err(e)) => Dispatch::RetryableFailure(e.to_string()),
        Err(_) => Dispatch::RetryableFailure(format!(
            "send deadline of {:?} exceeded",
            ctx.opts.send_timeout
        )),
    }
}

fn compose(
    campaign: &Campaign,
    job: &Job,
    sender: &str,
) -> Result<Email, crate::mail::MailError> {
    Email::builder()
        .from(sender.to_string())
        .to(job.recipient.clone())
        .subject(campaign.subject.clone())
        .html(campaign.body.clone())
        .attachments(campaign.attachments.iter().cloned())
        .build()
}

/// Apply a patch under the pending CAS, retrying backend failures.
///
/// Returns `false` when the CAS was lost or the row is gone: a duplicate
/// worker already reported a terminal state, so this report is dropped
/// without a resend. Backend exhaustion propagates so the caller halts.
async fn update_pending(ctx: &WorkerCtx, job_id: uuid::Uuid, patch: JobPatch) -> Result<bool, StoreError> {
    match store_retry(&ctx.clock, || {
        ctx.store.update_job(job_id, patch.clone(), JobStatus::Pending)
    })
    .await
    {
        Ok(()) => Ok(true),
        Err(StoreError::CasMismatch { actual }) => {
            tracing::warn!(%actual, "job already terminal, dropping duplicate transition");
            Ok(false)
        }
        Err(StoreError::NotFound) => {
            tracing::warn!("job row missing, dropping transition");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Run a store operation, retrying backend failures a bounded number of
/// times. Logical outcomes (CAS, not-found) return immediately.
async fn store_retry<T, F, Fut>(clock: &Arc<dyn Clock>, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(StoreError::Backend(message)) if attempt < 3 => {
                tracing::warn!(error = %message, attempt, "store operation failed, retrying");
                clock.sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}
