use crate::queue::QueueManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Every Nth heartbeat tick, transiently failed tasks are re-queued.
const RETRY_EVERY_TICKS: u64 = 10;

/// Age bound for the periodic failed-task retry sweep.
const RETRY_MAX_AGE_HOURS: i64 = 24;

/// Periodic background work: liveness heartbeat, expired-lease reclaim, and
/// an occasional retry sweep over transient failures.
pub struct HeartbeatLoop {
    queue: Arc<QueueManager>,
    interval: Duration,
}

impl HeartbeatLoop {
    pub fn new(queue: Arc<QueueManager>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Tick until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat loop started");
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("heartbeat loop shutting down");
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                info!("heartbeat loop shutting down");
                break;
            }

            tick += 1;
            self.tick(tick).await;
        }
    }

    /// One round of background maintenance.
    pub async fn tick(&self, tick: u64) {
        match self.queue.heartbeat().await {
            Ok(true) => {}
            Ok(false) => warn!(
                server_id = %self.queue.server_id(),
                "heartbeat found no registration row, re-registering"
            ),
            Err(e) => error!(error = %e, "heartbeat failed"),
        }

        match self.queue.recover_abandoned_tasks().await {
            Ok(reclaimed) if reclaimed > 0 => {
                info!(reclaimed, "reclaimed tasks with expired leases");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "expired-lock cleanup failed"),
        }

        if tick % RETRY_EVERY_TICKS == 0 {
            if let Err(e) = self.queue.retry_failed_tasks(RETRY_MAX_AGE_HOURS).await {
                error!(error = %e, "failed-task retry sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;
    use crate::types::*;
    use crate::store::PipelineStore;

    fn queue(store: Arc<MemoryStore>) -> Arc<QueueManager> {
        Arc::new(QueueManager::new(
            store,
            ServerType::Cpu,
            Duration::from_secs(1800),
            BackoffPolicy::default(),
            3,
        ))
    }

    #[tokio::test]
    async fn tick_heartbeats_and_reclaims() {
        let store = Arc::new(MemoryStore::new());
        let q = queue(store.clone());
        q.register_server().await.unwrap();

        q.add_task(NewTask::new(1, "a.pdf", "acme")).await.unwrap();
        let task = q.next_task().await.unwrap().unwrap();
        store.advance_clock(Duration::from_secs(1801)).await;

        let hb = HeartbeatLoop::new(q.clone(), Duration::from_secs(30));
        hb.tick(1).await;

        let reclaimed = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert!(reclaimed.locked_by.is_none());

        let row = store.server_row(q.server_id()).await.unwrap();
        assert_eq!(row.current_load, 0);
    }
}
