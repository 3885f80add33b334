//! ReaperLoop - Lease 期限切れの回収
//!
//! Runs on its own cadence, separate from the scheduler, so a slow project
//! tick never delays lease recovery.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::queue::TaskQueue;

use super::status::LoopMonitor;

/// ReaperLoop は lease が期限切れになったタスクを `queued` に戻す
///
/// # フロー
/// 1. interval ごとに `TaskQueue::sweep_expired_leases()`
/// 2. 回収したら待機中の worker を起こす（queue 側で通知）
pub struct ReaperLoop {
    queue: TaskQueue,
    interval: Duration,
    monitor: LoopMonitor,
}

impl ReaperLoop {
    pub fn new(queue: TaskQueue, monitor: LoopMonitor, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            monitor,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.monitor.set_alive(true);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.monitor.record_tick(self.queue.clock().now());
                    if let Err(err) = self.queue.sweep_expired_leases().await {
                        tracing::warn!(error = %err, "lease sweep failed");
                        self.monitor.record_error();
                    }
                }
            }
        }

        self.monitor.set_alive(false);
        tracing::info!("reaper stopped");
    }
}
