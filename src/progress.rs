//! Background progress persistence for a running job.
//!
//! The encoder reports into a `watch` channel and never waits on the store.
//! A [`ProgressWriter`] drains that channel on its own task, persisting only
//! the latest value each time it wakes up, so bursts of reports coalesce
//! into a single write. Write failures are logged and dropped.
//!
//! In-flight writes stop at [`MAX_IN_FLIGHT_PROGRESS`]; only the completion
//! write sets 100. With a heartbeat configured, a quiet period rewrites the
//! last value so the job keeps looking alive to stall recovery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use vf_core::{ConversionJobId, JobPatch, JobStore, MAX_IN_FLIGHT_PROGRESS};

/// Handle to a spawned progress-writing task.
pub struct ProgressWriter {
    handle: JoinHandle<WriterStats>,
}

/// What a writer did over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Progress writes that were persisted.
    pub written: u32,
    /// Heartbeat writes that were persisted.
    pub heartbeats: u32,
    /// Writes the store rejected.
    pub dropped: u32,
    /// Last persisted percent.
    pub last: u8,
}

impl ProgressWriter {
    /// Start persisting progress for `job_id` from `rx`.
    ///
    /// The task ends once every sender for `rx` has been dropped and the
    /// final value has been handled.
    pub fn spawn(store: Arc<dyn JobStore>, job_id: ConversionJobId, rx: watch::Receiver<u8>) -> Self {
        Self::spawn_with_heartbeat(store, job_id, rx, None)
    }

    /// Like [`spawn`](Self::spawn), and when a whole `heartbeat` period
    /// passes without a progress write, rewrite the last value. A zero
    /// period disables the heartbeat.
    ///
    /// Every write bumps the row's `updated_at`, so an encode that reports
    /// nothing for a long time (ffmpeg without a probed duration) is not
    /// mistaken for a stalled job by
    /// [`recover_stalled`](crate::recovery::recover_stalled).
    pub fn spawn_with_heartbeat(
        store: Arc<dyn JobStore>,
        job_id: ConversionJobId,
        mut rx: watch::Receiver<u8>,
        heartbeat: Option<Duration>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut stats = WriterStats::default();
            let mut ticker = heartbeat.filter(|every| !every.is_zero()).map(|every| {
                let mut interval = tokio::time::interval_at(Instant::now() + every, every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
            let mut wrote_since_tick = false;

            loop {
                let (pct, is_heartbeat) = tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let pct = (*rx.borrow_and_update()).min(MAX_IN_FLIGHT_PROGRESS);
                        if pct <= stats.last {
                            continue;
                        }
                        (pct, false)
                    }
                    _ = next_tick(&mut ticker) => {
                        if std::mem::take(&mut wrote_since_tick) {
                            continue;
                        }
                        (stats.last, true)
                    }
                };

                match store.update_job(job_id, JobPatch::progress(pct)) {
                    Ok(_) if is_heartbeat => {
                        stats.heartbeats += 1;
                        tracing::trace!(job_id = %job_id, progress = pct, "progress heartbeat");
                    }
                    Ok(_) => {
                        stats.written += 1;
                        stats.last = pct;
                        wrote_since_tick = true;
                    }
                    Err(e) => {
                        stats.dropped += 1;
                        tracing::debug!(job_id = %job_id, progress = pct, error = %e, "progress write dropped");
                    }
                }
            }
            stats
        });
        Self { handle }
    }

    /// Wait for the task to drain. Call after dropping the reporter.
    pub async fn finish(self) -> WriterStats {
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "progress writer task failed");
                WriterStats::default()
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
