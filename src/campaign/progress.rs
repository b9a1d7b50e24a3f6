//! Campaign aggregate reconciliation.
//!
//! Workers report job transitions by campaign id; a single task coalesces
//! bursts of notifications and recomputes each touched campaign once per
//! window. Keeping the recompute single-writer per campaign means counter
//! fields are only ever written here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::Store;

/// Cheap handle workers use to report a terminal job transition.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl ProgressHandle {
    /// Request a recompute of `campaign_id`. Never blocks; notifications for
    /// the same campaign inside one window collapse into a single recompute.
    pub fn notify(&self, campaign_id: Uuid) {
        let _ = self.tx.send(campaign_id);
    }
}

/// Spawn the coalescing aggregator task.
pub fn spawn(
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (ProgressHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();

    let task = tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let mut batch = HashSet::new();
            batch.insert(first);

            // Soak up everything else that arrives inside the window.
            let mut window_sleep = clock.sleep(window);
            let mut closed = false;
            loop {
                tokio::select! {
                    _ = &mut window_sleep => break,
                    id = rx.recv() => match id {
                        Some(id) => {
                            batch.insert(id);
                        }
                        None => {
                            closed = true;
                            break;
                        }
                    },
                }
            }

            for campaign_id in batch {
                recompute(store.as_ref(), &clock, campaign_id).await;
            }

            if closed {
                break;
            }
        }
        tracing::debug!("aggregator stopped");
    });

    (ProgressHandle { tx }, task)
}

/// Recompute one campaign with a short bounded retry. A persistent failure
/// is logged and left for the next notification to repair.
async fn recompute(store: &dyn Store, clock: &Arc<dyn Clock>, campaign_id: Uuid) {
    let mut delay = Duration::from_millis(100);
    for attempt in 1..=3 {
        match store.recompute_campaign(campaign_id).await {
            Ok(campaign) => {
                tracing::debug!(
                    %campaign_id,
                    sent = campaign.sent_count,
                    failed = campaign.failed_count,
                    status = %campaign.status,
                    "campaign recomputed"
                );
                return;
            }
            Err(e) if attempt < 3 => {
                tracing::warn!(%campaign_id, error = %e, attempt, "recompute failed, retrying");
                clock.sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                tracing::error!(%campaign_id, error = %e, "recompute failed, giving up");
            }
        }
    }
}
