//! End-to-end scenarios over the in-memory backends.
//!
//! Each test assembles a full core (scheduler, queue, limiter, workers,
//! aggregator) with a scripted mailer, then observes campaign and job state
//! through the store. Timings are kept small and asserted through a bounded
//! polling helper rather than fixed sleeps.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;
use uuid::Uuid;

use mailblast::campaign::{
    CampaignStatus, Core, CoreHandle, CoreOptions, JobStatus, RetryPolicy, SubmitInput,
    SubmitReceipt, WorkerOpts,
};
use mailblast::clock::SystemClock;
use mailblast::kv::MemoryKv;
use mailblast::mail::{Email, MailError, Mailer};
use mailblast::store::{MemoryStore, Store};

const SENDER: &str = "test@mailblast.dev";

/// Mailer that records every call and plays back per-recipient scripts.
#[derive(Default)]
struct ScriptedMailer {
    calls: std::sync::Mutex<Vec<(String, Instant)>>,
    scripts: std::sync::Mutex<HashMap<String, VecDeque<Result<(), MailError>>>>,
}

impl ScriptedMailer {
    fn script(self, recipient: &str, results: Vec<Result<(), MailError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(recipient.to_string(), results.into());
        self
    }

    fn calls(&self) -> Vec<(String, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, recipient: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == recipient)
            .count()
    }
}

#[async_trait::async_trait]
impl Mailer for ScriptedMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        let recipient = email.to[0].clone();
        self.calls
            .lock()
            .unwrap()
            .push((recipient.clone(), Instant::now()));
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&recipient)
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(()))
    }
}

fn transient(message: &str) -> MailError {
    MailError::Transport {
        message: message.to_string(),
        permanent: false,
    }
}

fn permanent(message: &str) -> MailError {
    MailError::Transport {
        message: message.to_string(),
        permanent: true,
    }
}

fn fast_opts() -> CoreOptions {
    CoreOptions {
        worker: WorkerOpts {
            concurrency: 5,
            lease_duration: Duration::from_secs(5),
            pacing_floor: Duration::ZERO,
            sender: SENDER.to_string(),
            send_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
        },
        retry: RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(50),
            backoff_cap: Duration::from_secs(1),
        },
        default_hourly_limit: 1000,
        coalesce_window: Duration::from_millis(10),
    }
}

struct Rig {
    core: Arc<Core>,
    handle: CoreHandle,
    store: Arc<MemoryStore>,
    mailer: Arc<ScriptedMailer>,
}

async fn start_rig(opts: CoreOptions, mailer: ScriptedMailer) -> Rig {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let mailer = Arc::new(mailer);
    let core = Arc::new(Core::new(
        opts,
        store.clone(),
        kv,
        mailer.clone(),
        clock,
    ));
    let handle = core.start().await.expect("core starts");
    Rig {
        core,
        handle,
        store,
        mailer,
    }
}

fn input(recipients: &[&str], delay_ms: u64, hourly_limit: Option<u32>) -> SubmitInput {
    SubmitInput {
        campaign_id: None,
        owner: "u1".to_string(),
        subject: "Hi".to_string(),
        body: "<p>Hi</p>".to_string(),
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        start_time: OffsetDateTime::now_utc(),
        delay_ms,
        hourly_limit,
        attachments: vec![],
    }
}

async fn submit(rig: &Rig, input: SubmitInput) -> SubmitReceipt {
    rig.core.submit(input).await.expect("submit accepted")
}

/// Poll `check` every 10ms until it holds or 5s pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Some assertions depend on the whole test staying inside one rate-limit
/// hour; wait out the boundary when it is seconds away.
async fn avoid_hour_boundary() {
    let now = OffsetDateTime::now_utc();
    let into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    if into_hour >= 3595 {
        tokio::time::sleep(Duration::from_secs(3600 - into_hour + 1)).await;
    }
}

#[tokio::test]
async fn single_recipient_completes_with_one_send() {
    let rig = start_rig(fast_opts(), ScriptedMailer::default()).await;
    let receipt = submit(&rig, input(&["a@x.io"], 0, Some(10))).await;
    assert_eq!(receipt.total_emails, 1);

    eventually("campaign completion", || async {
        let campaign = rig.store.read_campaign(receipt.campaign_id).await.unwrap();
        campaign.is_some_and(|c| c.status == CampaignStatus::Completed)
    })
    .await;

    let campaign = rig
        .store
        .read_campaign(receipt.campaign_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(campaign.sent_count, 1);
    assert_eq!(campaign.failed_count, 0);
    assert_eq!(rig.mailer.calls_for("a@x.io"), 1);

    rig.handle.shutdown().await;
}

#[tokio::test]
async fn recipients_are_attempted_with_the_configured_stagger() {
    let rig = start_rig(fast_opts(), ScriptedMailer::default()).await;
    let receipt = submit(&rig, input(&["a@x.io", "b@x.io", "c@x.io"], 300, Some(100))).await;

    eventually("all three sends", || async {
        rig.mailer.calls().len() == 3
    })
    .await;

    let calls = rig.mailer.calls();
    let recipients: Vec<_> = calls.iter().map(|(r, _)| r.clone()).collect();
    assert_eq!(recipients, ["a@x.io", "b@x.io", "c@x.io"]);

    // Due times are 300ms apart; a late first attempt can shave a little
    // off the observed gap but not much.
    let gap_ab = calls[1].1.duration_since(calls[0].1);
    let gap_bc = calls[2].1.duration_since(calls[1].1);
    assert!(gap_ab >= Duration::from_millis(200), "gap a->b was {gap_ab:?}");
    assert!(gap_bc >= Duration::from_millis(200), "gap b->c was {gap_bc:?}");

    eventually("campaign completion", || async {
        let campaign = rig.store.read_campaign(receipt.campaign_id).await.unwrap();
        campaign.is_some_and(|c| c.status == CampaignStatus::Completed)
    })
    .await;

    rig.handle.shutdown().await;
}

#[tokio::test]
async fn hourly_budget_defers_the_overflow_to_the_next_bucket() {
    avoid_hour_boundary().await;

    // One worker so budget checks serialize and exactly two sends pass.
    let mut opts = fast_opts();
    opts.worker.concurrency = 1;
    let rig = start_rig(opts, ScriptedMailer::default()).await;
    let receipt = submit(&rig, input(&["a@x.io", "b@x.io", "c@x.io"], 0, Some(2))).await;

    eventually("two sends and a deferral", || async {
        let stats = rig.core.queue_stats().await;
        rig.mailer.calls().len() == 2 && stats.delayed == 1
    })
    .await;

    // Settle: the third job must stay deferred, not sneak through.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.mailer.calls().len(), 2);

    let campaign = rig
        .store
        .read_campaign(receipt.campaign_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(campaign.sent_count, 2);
    assert_eq!(campaign.status, CampaignStatus::InProgress);

    let jobs = rig.store.jobs_for_campaign(receipt.campaign_id).await.unwrap();
    let pending: Vec<_> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 0);

    rig.handle.shutdown().await;
}

#[tokio::test]
async fn transient_failure_retries_and_then_succeeds() {
    let mailer = ScriptedMailer::default().script(
        "b@x.io",
        vec![Err(transient("421 service busy, try again"))],
    );
    let rig = start_rig(fast_opts(), mailer).await;
    let receipt = submit(&rig, input(&["a@x.io", "b@x.io"], 0, Some(100))).await;

    eventually("campaign completion", || async {
        let campaign = rig.store.read_campaign(receipt.campaign_id).await.unwrap();
        campaign.is_some_and(|c| c.status == CampaignStatus::Completed)
    })
    .await;

    let campaign = rig
        .store
        .read_campaign(receipt.campaign_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(campaign.sent_count, 2);
    assert_eq!(campaign.failed_count, 0);

    let jobs = rig.store.jobs_for_campaign(receipt.campaign_id).await.unwrap();
    let b = jobs.iter().find(|j| j.recipient == "b@x.io").unwrap();
    assert_eq!(b.status, JobStatus::Sent);
    assert_eq!(b.attempts, 2);
    assert!(b.sent_time.is_some());
    assert_eq!(rig.mailer.calls_for("b@x.io"), 2);

    rig.handle.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_fails_once_and_stays_failed() {
    let mailer = ScriptedMailer::default().script(
        "a@x.io",
        vec![Err(permanent("550 mailbox does not exist"))],
    );
    let rig = start_rig(fast_opts(), mailer).await;
    let receipt = submit(&rig, input(&["a@x.io"], 0, Some(100))).await;

    eventually("campaign completion", || async {
        let campaign = rig.store.read_campaign(receipt.campaign_id).await.unwrap();
        campaign.is_some_and(|c| c.status == CampaignStatus::Completed)
    })
    .await;

    let jobs = rig.store.jobs_for_campaign(receipt.campaign_id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].attempts, 1);
    assert!(jobs[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("550 mailbox does not exist"));

    // No further attempts after settling.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.mailer.calls_for("a@x.io"), 1);

    let campaign = rig
        .store
        .read_campaign(receipt.campaign_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((campaign.sent_count, campaign.failed_count), (0, 1));

    rig.handle.shutdown().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_marks_the_job_failed() {
    let mailer = ScriptedMailer::default().script(
        "a@x.io",
        vec![
            Err(transient("timeout")),
            Err(transient("timeout")),
            Err(transient("timeout")),
        ],
    );
    let rig = start_rig(fast_opts(), mailer).await;
    let receipt = submit(&rig, input(&["a@x.io"], 0, Some(100))).await;

    eventually("campaign completion", || async {
        let campaign = rig.store.read_campaign(receipt.campaign_id).await.unwrap();
        campaign.is_some_and(|c| c.status == CampaignStatus::Completed)
    })
    .await;

    let jobs = rig.store.jobs_for_campaign(receipt.campaign_id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].attempts, 3);
    assert_eq!(rig.mailer.calls_for("a@x.io"), 3);

    rig.handle.shutdown().await;
}

#[tokio::test]
async fn pending_jobs_survive_a_restart_and_get_attempted() {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));

    // First process: accept the campaign, then "crash" before any worker
    // runs. The store has the rows; the volatile register is lost.
    {
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let mailer = Arc::new(ScriptedMailer::default());
        let core = Core::new(fast_opts(), store.clone(), kv, mailer.clone(), clock.clone());
        core.submit(input(&["a@x.io", "b@x.io", "c@x.io"], 0, Some(100)))
            .await
            .expect("submit accepted");
        assert_eq!(mailer.calls().len(), 0);
    }

    let pending = store.load_pending_jobs().await.unwrap();
    assert_eq!(pending.len(), 3);
    let campaign_id = pending[0].campaign_id;

    // Second process over the same store: recovery re-enqueues everything.
    let kv = Arc::new(MemoryKv::new(clock.clone()));
    let mailer = Arc::new(ScriptedMailer::default());
    let core = Arc::new(Core::new(
        fast_opts(),
        store.clone(),
        kv,
        mailer.clone(),
        clock,
    ));
    let handle = core.start().await.expect("core starts");

    eventually("recovered campaign completion", || async {
        let campaign = store.read_campaign(campaign_id).await.unwrap();
        campaign.is_some_and(|c| c.status == CampaignStatus::Completed)
    })
    .await;

    let campaign = store.read_campaign(campaign_id).await.unwrap().unwrap();
    assert_eq!(campaign.sent_count + campaign.failed_count, 3);
    assert_eq!(mailer.calls().len(), 3);

    handle.shutdown().await;
}

#[tokio::test]
async fn resubmitting_the_same_campaign_id_creates_nothing_new() {
    let rig = start_rig(fast_opts(), ScriptedMailer::default()).await;

    let id = Uuid::new_v4();
    let mut first = input(&["a@x.io", "b@x.io"], 0, Some(100));
    first.campaign_id = Some(id);
    let receipt = submit(&rig, first).await;
    assert_eq!(receipt.campaign_id, id);
    assert_eq!(receipt.created_jobs, 2);

    eventually("campaign completion", || async {
        let campaign = rig.store.read_campaign(id).await.unwrap();
        campaign.is_some_and(|c| c.status == CampaignStatus::Completed)
    })
    .await;

    let mut again = input(&["a@x.io", "b@x.io"], 0, Some(100));
    again.campaign_id = Some(id);
    let receipt = submit(&rig, again).await;
    assert_eq!(receipt.campaign_id, id);
    assert_eq!(receipt.created_jobs, 0);
    assert_eq!(receipt.total_emails, 2);

    // The duplicate neither re-enqueued nor re-sent anything.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.mailer.calls().len(), 2);
    assert_eq!(rig.store.jobs_for_campaign(id).await.unwrap().len(), 2);

    rig.handle.shutdown().await;
}
