//! Periodic refresh of live sources.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::Schedule;
use crate::source::{RefreshOutcome, Source};

/// Sources the scheduler refreshes, shared with the manager.
pub type SourceList = Arc<RwLock<Vec<Arc<Source>>>>;

/// Repeating refresh timer with an initial delay.
#[derive(Debug, Clone)]
pub struct Scheduler {
    interval: Duration,
    initial_delay: Duration,
}

impl Scheduler {
    pub fn new(interval: Duration, initial_delay: Duration) -> Self {
        Self { interval, initial_delay }
    }

    pub fn from_schedule(schedule: &Schedule) -> Self {
        Self::new(schedule.interval(), schedule.initial_delay())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Start ticking. Each tick refreshes every live source in its own task.
    pub fn spawn(&self, sources: SourceList) -> SchedulerHandle {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let mut timer =
            tokio::time::interval_at(Instant::now() + self.initial_delay, self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.interval.as_secs(),
            initial_delay_ms = self.initial_delay.as_millis() as u64,
            "Scheduler started"
        );

        let task = tokio::spawn(async move {
            loop {
                timer.tick().await;
                let tick = counter.fetch_add(1, Ordering::Relaxed) + 1;
                let snapshot: Vec<Arc<Source>> = sources.read().await.clone();
                trace!(tick, sources = snapshot.len(), "Scheduler tick");

                for source in snapshot {
                    if !source.state().await.is_live() {
                        continue;
                    }
                    tokio::spawn(refresh(source));
                }
            }
        });

        SchedulerHandle { task, ticks }
    }
}

async fn refresh(source: Arc<Source>) {
    match source.refresh().await {
        Ok(RefreshOutcome::Refreshed) => trace!(source = %source.name(), "Source refreshed"),
        Ok(RefreshOutcome::Skipped) => {
            debug!(source = %source.name(), "Tick dropped, source busy");
        }
        Ok(RefreshOutcome::Discarded) => {}
        Err(e) => warn!(source = %source.name(), error = %e, "Scheduled refresh failed"),
    }
}

/// Running scheduler. Dropping the handle cancels it.
#[derive(Debug)]
pub struct SchedulerHandle {
    task: JoinHandle<()>,
    ticks: Arc<AtomicU64>,
}

impl SchedulerHandle {
    /// Stop further ticks. Refreshes already spawned run to completion.
    pub fn cancel(self) {
        info!(ticks = self.ticks(), "Scheduler cancelled");
    }

    /// Number of ticks fired so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
