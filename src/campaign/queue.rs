//! Durable delayed-job register.
//!
//! Holds every job that still needs work, ordered by due time, and hands out
//! time-bounded leases to workers. The register itself is volatile; the
//! [`Store`](crate::store::Store) is the recovery source of truth and
//! [`DelayQueue::recover_from_store`] rebuilds the register on boot. A job
//! whose lease holder died simply becomes eligible again once the lease
//! expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{Store, StoreError};

use super::model::Job;

/// Retry policy applied by [`DelayQueue::fail`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum Mailer attempts per job (including the first).
    pub max_attempts: u32,
    /// First retry delay; doubles on each subsequent failure.
    pub backoff_base: Duration,
    /// Upper bound on any single backoff.
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempts`-th failed attempt (1-based):
    /// `base * 2^(attempts - 1)`, capped.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

/// Result of a lease request.
#[derive(Debug)]
pub enum Lease {
    /// A job is due; the caller holds it until the lease expires.
    Ready(LeasedJob),
    /// The register is empty.
    Empty,
    /// Nothing due yet; the earliest instant worth waking at.
    WaitUntil(OffsetDateTime),
}

/// A claimed job plus how many Mailer attempts it has already consumed.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: Job,
    pub attempts: u32,
}

/// Outcome of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled with backoff; still pending.
    Retried {
        attempts: u32,
        next_due: OffsetDateTime,
    },
    /// Retry budget exhausted; removed from the register.
    Permanent { attempts: u32 },
}

/// Aggregate register counts, shaped for the queue-status endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: u64,
    pub failed: u64,
}

struct Entry {
    job: Job,
    due: OffsetDateTime,
    attempts: u32,
    lease_until: Option<OffsetDateTime>,
    lease_owner: Option<String>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Uuid, Entry>,
    completed: u64,
    failed: u64,
}

pub struct DelayQueue {
    inner: Mutex<Inner>,
    wake: Notify,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl DelayQueue {
    pub fn new(clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            wake: Notify::new(),
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Register a job. Idempotent on the job id: a job already present in
    /// any state is left untouched. Returns whether the job was inserted.
    pub async fn enqueue(&self, job: Job, due: OffsetDateTime) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(&job.id) {
            return false;
        }
        let attempts = job.attempts;
        inner.entries.insert(
            job.id,
            Entry {
                job,
                due,
                attempts,
                lease_until: None,
                lease_owner: None,
            },
        );
        drop(inner);
        self.wake.notify_waiters();
        true
    }

    /// Claim the earliest due job, due-time order with job-id tiebreak.
    ///
    /// Entries whose lease has expired are eligible again; an entry leased
    /// into the future is skipped but still bounds the returned wake-up
    /// instant.
    pub async fn lease_next(&self, worker_id: &str, lease_duration: Duration) -> Lease {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let mut best: Option<(OffsetDateTime, Uuid)> = None;
        let mut earliest_wake: Option<OffsetDateTime> = None;
        for (id, entry) in &inner.entries {
            let leased = entry.lease_until.is_some_and(|until| until > now);
            if leased {
                let wake = entry.lease_until.unwrap_or(now);
                earliest_wake = Some(earliest_wake.map_or(wake, |w| w.min(wake)));
                continue;
            }
            if entry.due <= now {
                let key = (entry.due, *id);
                if best.map_or(true, |b| key < b) {
                    best = Some(key);
                }
            } else {
                earliest_wake = Some(earliest_wake.map_or(entry.due, |w| w.min(entry.due)));
            }
        }

        if let Some((_, id)) = best {
            let entry = inner
                .entries
                .get_mut(&id)
                .unwrap_or_else(|| unreachable!("entry selected under the same lock"));
            entry.lease_until = Some(now + lease_duration);
            entry.lease_owner = Some(worker_id.to_string());
            return Lease::Ready(LeasedJob {
                job: entry.job.clone(),
                attempts: entry.attempts,
            });
        }

        match earliest_wake {
            Some(t) => Lease::WaitUntil(t),
            None => Lease::Empty,
        }
    }

    /// Remove a job the worker is done with.
    pub async fn complete(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if inner.entries.remove(&job_id).is_some() {
            inner.completed += 1;
        }
    }

    /// Push a job's due time out and release its lease.
    pub async fn defer(&self, job_id: Uuid, until: OffsetDateTime) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&job_id) {
            entry.due = until;
            entry.lease_until = None;
            entry.lease_owner = None;
        }
        drop(inner);
        self.wake.notify_waiters();
    }

    /// Record a failed Mailer attempt. Either reschedules with exponential
    /// backoff or, once the budget is spent, removes the job for good.
    pub async fn fail(&self, job_id: Uuid) -> FailOutcome {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(&job_id) else {
            // Unknown job: nothing left to retry.
            return FailOutcome::Permanent { attempts: 0 };
        };

        entry.attempts += 1;
        let attempts = entry.attempts;
        if attempts < self.policy.max_attempts {
            let next_due = now + self.policy.backoff_for(attempts);
            entry.due = next_due;
            entry.lease_until = None;
            entry.lease_owner = None;
            drop(inner);
            self.wake.notify_waiters();
            FailOutcome::Retried { attempts, next_due }
        } else {
            inner.entries.remove(&job_id);
            inner.failed += 1;
            FailOutcome::Permanent { attempts }
        }
    }

    /// Release a lease without touching the due time. Used when a worker
    /// halts mid-job and wants the work picked up by someone else.
    pub async fn release(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&job_id) {
            entry.lease_until = None;
            entry.lease_owner = None;
        }
        drop(inner);
        self.wake.notify_waiters();
    }

    /// Rebuild the register from the store's pending jobs.
    ///
    /// Jobs whose scheduled time already passed become due immediately;
    /// enqueue idempotency makes the sweep safe to run alongside live
    /// submissions.
    pub async fn recover_from_store(&self, store: &dyn Store) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let pending = store.load_pending_jobs().await?;
        let mut recovered = 0;
        for job in pending {
            let due = job.scheduled_time.max(now);
            if self.enqueue(job, due).await {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            waiting: 0,
            active: 0,
            delayed: 0,
            completed: inner.completed,
            failed: inner.failed,
        };
        for entry in inner.entries.values() {
            if entry.lease_until.is_some_and(|until| until > now) {
                stats.active += 1;
            } else if entry.due <= now {
                stats.waiting += 1;
            } else {
                stats.delayed += 1;
            }
        }
        stats
    }

    /// Sleep until `deadline` (if any), a new job arrives, or a lease is
    /// released, whichever comes first.
    pub async fn idle_wait(&self, deadline: Option<OffsetDateTime>) {
        let notified = self.wake.notified();
        match deadline {
            Some(t) => {
                tokio::select! {
                    _ = self.clock.sleep_until(t) => {}
                    _ = notified => {}
                }
            }
            None => notified.await,
        }
    }
}
