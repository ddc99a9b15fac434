//! Retention sweeper: periodically deletes finished tasks older than the
//! retention window.
//!
//! Only terminal tasks are eligible, aged from `completed_at` (or
//! `created_at` when a record never completed). A swept task leaves the
//! registry first, so status and download calls see `NotFound` from that
//! moment; its directory goes once any in-progress download has released
//! the task's file guard.

use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct RetentionSweeper {
    store: Arc<TaskStore>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
}

impl RetentionSweeper {
    pub fn new(store: Arc<TaskStore>, interval: Duration, retention: Duration) -> Self {
        Self {
            store,
            interval,
            retention,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        debug!("Retention sweeper: shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let swept = self.sweep_once(Utc::now()).await;
                        if swept > 0 {
                            info!("Retention sweeper removed {} expired tasks", swept);
                        }
                    }
                }
            }
        })
    }

    /// Stop the loop; an in-progress sweep finishes first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Delete every task expired at `now`. Returns how many were removed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let mut swept = 0;
        for entry in self.store.entries() {
            let task = entry.snapshot().await;
            if !task.is_expired(now, self.retention) {
                continue;
            }
            let Some(removed) = self.store.remove(task.id) else {
                continue;
            };
            match self.store.purge(&removed).await {
                Ok(()) => {
                    debug!(task_id = %task.id, state = %task.state, "Swept expired task");
                    swept += 1;
                }
                Err(e) => error!(task_id = %task.id, "Failed to remove expired task: {e}"),
            }
        }
        swept
    }
}
