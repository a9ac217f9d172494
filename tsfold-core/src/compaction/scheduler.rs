//! Background compaction task

use crate::partition::StoragePartition;
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs select + execute for one partition on a tick or on demand.
///
/// Each pass drains every plan the selector offers, then purges parked
/// files. Merges run on the blocking pool.
pub struct CompactionScheduler {
    partition: Arc<StoragePartition>,
    interval: Duration,
}

/// Control handle of a running scheduler
pub struct SchedulerHandle {
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    completed: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl CompactionScheduler {
    pub fn new(partition: Arc<StoragePartition>) -> Self {
        let interval = partition.config().compaction.schedule_interval();
        Self {
            partition,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the loop on the current tokio runtime
    pub fn start(self) -> SchedulerHandle {
        let trigger = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let completed = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(run(
            self.partition,
            self.interval,
            Arc::clone(&trigger),
            cancel.clone(),
            Arc::clone(&completed),
        ));

        SchedulerHandle {
            trigger,
            cancel,
            completed,
            task,
        }
    }
}

async fn run(
    partition: Arc<StoragePartition>,
    period: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    completed: Arc<AtomicU64>,
) {
    info!(
        "Compaction scheduler for {} started (every {:?})",
        partition.id(),
        period
    );
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = trigger.notified() => {}
        }

        let done = pass(&partition, &cancel).await;
        if done > 0 {
            completed.fetch_add(done, Ordering::SeqCst);
        }
    }
    info!("Compaction scheduler for {} stopped", partition.id());
}

/// One drain of the selector; returns the number of merges that finished
async fn pass(partition: &Arc<StoragePartition>, cancel: &CancellationToken) -> u64 {
    let partition = Arc::clone(partition);
    let cancel = cancel.clone();
    let id = partition.id().clone();

    let result = tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut done = 0;
        while !cancel.is_cancelled() {
            match partition.compact_once(&cancel)? {
                Some(outcome) => {
                    debug!(
                        "{} produced {} target(s), {} parked",
                        outcome.kind,
                        outcome.targets.len(),
                        outcome.parked
                    );
                    done += 1;
                }
                None => break,
            }
        }
        partition.purge_retired()?;
        Ok(done)
    })
    .await;

    match result {
        Ok(Ok(done)) => done,
        Ok(Err(e)) => {
            warn!("Compaction pass for {} failed: {}", id, e);
            0
        }
        Err(e) => {
            warn!("Compaction pass for {} panicked: {}", id, e);
            0
        }
    }
}

impl SchedulerHandle {
    /// Run a pass now instead of waiting for the next tick
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Merges finished since start
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Stop the loop; a running merge aborts at its next series boundary
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Compaction scheduler task failed: {}", e);
        }
    }
}
