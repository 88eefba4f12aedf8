//! Queue poll loop.
//!
//! A single task polls the remote queue on a fixed interval and fans
//! items out to worker tasks gated by a semaphore. In-flight items never
//! delay the next tick; overlapping polls may interleave. Each item gets
//! its own deadline, and every outcome is acknowledged back to the
//! queue (`processed` with the JSON result, or `error` with the
//! diagnostic).

pub mod actions;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::QueueConfig;

use actions::{ApiClient, QueueAction};
use queue::{QueueClient, QueueItem};

/// Deadline for a single item's dispatch.
const ITEM_DEADLINE: Duration = Duration::from_secs(30);

pub struct QueuePoller {
    queue: QueueClient,
    api: ApiClient,
    poll_interval: Duration,
    batch_limit: u32,
    workers: Arc<Semaphore>,
    item_deadline: Duration,
}

impl QueuePoller {
    pub fn new(queue: QueueClient, api: ApiClient, config: &QueueConfig) -> Self {
        Self {
            queue,
            api,
            poll_interval: config.poll_interval,
            batch_limit: config.batch_limit,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            item_deadline: ITEM_DEADLINE,
        }
    }

    /// Polls until shutdown. On cancellation, in-flight items get one
    /// deadline's worth of time to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // Reap whatever finished since the last tick.
                    while inflight.try_join_next().is_some() {}
                    Arc::clone(&self).poll_once(&mut inflight).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        if !inflight.is_empty() {
            log::info!(
                "queue poller stopping, waiting for {} in-flight item(s)",
                inflight.len()
            );
            let _ = tokio::time::timeout(self.item_deadline, async {
                while inflight.join_next().await.is_some() {}
            })
            .await;
        }
        log::debug!("queue poller stopped");
    }

    /// One poll: fetch ready items and spawn a handler per item. The
    /// semaphore bounds how many handlers run at once; the rest queue
    /// on the permit.
    pub(crate) async fn poll_once(self: Arc<Self>, inflight: &mut JoinSet<()>) {
        let items = match self.queue.fetch_ready(self.batch_limit).await {
            Ok(items) => items,
            Err(e) => {
                log::warn!("queue poll failed: {e}");
                return;
            }
        };
        if items.is_empty() {
            return;
        }
        log::debug!("fetched {} queue item(s)", items.len());

        for item in items {
            let poller = Arc::clone(&self);
            inflight.spawn(async move {
                let Ok(_permit) = Arc::clone(&poller.workers).acquire_owned().await else {
                    return;
                };
                poller.process_item(item).await;
            });
        }
    }

    /// Claim → parse → dispatch → acknowledge for one item. Errors end
    /// up on the item; the poller itself never fails.
    async fn process_item(&self, item: QueueItem) {
        let sys_id = item.sys_id;
        if let Err(e) = self.queue.update_item(&sys_id, "processing", "").await {
            // Could not claim; leave the item for the next poll.
            log::warn!("failed to claim queue item {sys_id}: {e}");
            return;
        }

        let action: QueueAction = match serde_json::from_str(&item.payload) {
            Ok(action) => action,
            Err(e) => {
                self.finish(&sys_id, "error", &format!("invalid payload: {e}"))
                    .await;
                return;
            }
        };
        let name = action.name();

        match tokio::time::timeout(self.item_deadline, self.api.dispatch(action)).await {
            Ok(Ok(result)) => {
                let output = result.to_string();
                self.finish(&sys_id, "processed", &output).await;
                if let Err(e) = self.queue.post_response(name, &sys_id, &output).await {
                    log::warn!("failed to post response item for {sys_id}: {e}");
                }
            }
            Ok(Err(e)) => self.finish(&sys_id, "error", &e.to_string()).await,
            Err(_) => {
                self.finish(
                    &sys_id,
                    "error",
                    &format!("dispatch timed out after {:?}", self.item_deadline),
                )
                .await
            }
        }
    }

    async fn finish(&self, sys_id: &str, state: &str, output: &str) {
        if let Err(e) = self.queue.update_item(sys_id, state, output).await {
            log::warn!("failed to mark queue item {sys_id} {state}: {e}");
        }
    }
}
