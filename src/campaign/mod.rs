//! The campaign core: scheduling, rate limiting, queueing, workers, and
//! aggregation behind one constructed [`Core`] value.
//!
//! # Architecture
//!
//! - [`model`] — Campaign and Job records plus the view types.
//! - [`Scheduler`] — validates submissions and fans out per-recipient jobs.
//! - [`DelayQueue`] — volatile delayed-job register; the store is the
//!   recovery source of truth.
//! - [`RateLimiter`] — rolling-hour budget per sender over the KV store.
//! - worker pool — leases due jobs, sends, and records transitions.
//! - aggregator — coalesces job transitions into campaign recomputes.
//!
//! # Quick Start
//!
//! ```ignore
//! let core = Arc::new(Core::new(CoreOptions::default(), store, kv, mailer, clock));
//! let handle = core.start().await?;   // recovery sweep + workers + aggregator
//! let receipt = core.submit(input).await?;
//! // ...
//! handle.shutdown().await;            // stop leasing, let in-flight sends finish
//! ```

pub mod limiter;
pub mod model;
pub mod progress;
pub mod queue;
pub mod submit;
pub mod worker;

pub use limiter::{RateDecision, RateLimiter};
pub use model::{
    Campaign, CampaignDetail, CampaignStatus, CampaignView, Job, JobPatch, JobStatus, JobView,
    SubmitInput, SubmitReceipt,
};
pub use queue::{DelayQueue, QueueStats, RetryPolicy};
pub use submit::{Scheduler, SubmitError};
pub use worker::{Health, WorkerOpts};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::Config;
use crate::kv::Kv;
use crate::mail::Mailer;
use crate::store::{Store, StoreError};

use worker::WorkerCtx;

/// Tunables for a [`Core`], with production defaults.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    pub worker: WorkerOpts,
    pub retry: RetryPolicy,
    /// Budget applied when a campaign does not carry its own hourly limit.
    pub default_hourly_limit: u32,
    /// How long the aggregator soaks up notifications before recomputing.
    pub coalesce_window: Duration,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            worker: WorkerOpts::default(),
            retry: RetryPolicy::default(),
            default_hourly_limit: 200,
            coalesce_window: Duration::from_millis(250),
        }
    }
}

impl From<&Config> for CoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            worker: WorkerOpts {
                concurrency: config.worker_concurrency,
                pacing_floor: config.pacing_floor(),
                sender: config.mailer_from.clone(),
                ..WorkerOpts::default()
            },
            default_hourly_limit: config.max_emails_per_hour,
            ..Self::default()
        }
    }
}

/// The assembled core. Capabilities are injected; the queue, limiter, and
/// scheduler are built here. Share it behind an `Arc`.
pub struct Core {
    store: Arc<dyn Store>,
    queue: Arc<DelayQueue>,
    limiter: Arc<RateLimiter>,
    mailer: Arc<dyn Mailer>,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler,
    health: Arc<Health>,
    opts: CoreOptions,
}

impl Core {
    pub fn new(
        opts: CoreOptions,
        store: Arc<dyn Store>,
        kv: Arc<dyn Kv>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = Arc::new(DelayQueue::new(clock.clone(), opts.retry.clone()));
        let limiter = Arc::new(RateLimiter::new(kv, store.clone(), clock.clone()));
        let scheduler = Scheduler::new(
            store.clone(),
            queue.clone(),
            clock.clone(),
            opts.default_hourly_limit,
        );
        Self {
            store,
            queue,
            limiter,
            mailer,
            clock,
            scheduler,
            health: Arc::new(Health::new()),
            opts,
        }
    }

    /// Run the recovery sweep, then spawn the aggregator and worker pool.
    pub async fn start(&self) -> Result<CoreHandle, StoreError> {
        let recovered = self.queue.recover_from_store(self.store.as_ref()).await?;
        if recovered > 0 {
            tracing::info!(recovered, "re-enqueued pending jobs from store");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (progress, aggregator) = progress::spawn(
            self.store.clone(),
            self.clock.clone(),
            self.opts.coalesce_window,
            shutdown_rx.clone(),
        );

        let ctx = Arc::new(WorkerCtx {
            queue: self.queue.clone(),
            store: self.store.clone(),
            limiter: self.limiter.clone(),
            mailer: self.mailer.clone(),
            clock: self.clock.clone(),
            progress,
            health: self.health.clone(),
            opts: self.opts.worker.clone(),
        });
        let workers = worker::spawn(ctx, shutdown_rx);
        tracing::info!(workers = workers.len(), "worker pool running");

        Ok(CoreHandle {
            shutdown: shutdown_tx,
            workers,
            aggregator,
        })
    }

    /// Accept a campaign; refused while the process is unhealthy.
    pub async fn submit(&self, input: SubmitInput) -> Result<SubmitReceipt, SubmitError> {
        if !self.health.is_healthy() {
            return Err(SubmitError::Store(StoreError::Backend(
                "storage unavailable".into(),
            )));
        }
        self.scheduler.submit(input).await
    }

    pub async fn campaign(&self, id: Uuid) -> Result<Option<CampaignDetail>, StoreError> {
        let Some(campaign) = self.store.read_campaign(id).await? else {
            return Ok(None);
        };
        let jobs = self.store.jobs_for_campaign(id).await?;
        Ok(Some(CampaignDetail {
            campaign: CampaignView::from(&campaign),
            jobs: jobs.iter().map(JobView::from).collect(),
        }))
    }

    pub async fn campaigns_by_owner(&self, owner: &str) -> Result<Vec<CampaignView>, StoreError> {
        let campaigns = self.store.list_campaigns_by_owner(owner).await?;
        Ok(campaigns.iter().map(CampaignView::from).collect())
    }

    pub async fn terminal_jobs_by_owner(&self, owner: &str) -> Result<Vec<JobView>, StoreError> {
        let jobs = self.store.list_terminal_jobs_by_owner(owner).await?;
        Ok(jobs.iter().map(JobView::from).collect())
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }
}

/// Running background tasks of a started [`Core`].
pub struct CoreHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    aggregator: JoinHandle<()>,
}

impl CoreHandle {
    /// Stop new leases and wait for in-flight jobs to settle. Un-completed
    /// leases simply expire and are picked up again on the next boot.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        let _ = self.aggregator.await;
        tracing::info!("core stopped");
    }
}
