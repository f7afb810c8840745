//! Change notifications for job store writes.
//!
//! [`ChangeNotifier`] wraps a `tokio::sync::broadcast` channel with a bounded
//! history of recent records. Every persisted write produces exactly one
//! [`ChangeRecord`], stamped with a process-wide sequence number and the id of
//! the user who owns the affected video. Records are broadcast in sequence
//! order.
//!
//! Observers call [`ChangeNotifier::subscribe`] to get a [`Subscription`]
//! scoped to one user. Falling behind the channel capacity is reported as
//! [`Delivery::Lagged`]. The observer then asks
//! [`ChangeNotifier::replay_since`] for what it missed, and resyncs from the
//! store only when the history no longer reaches back that far.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::ids::{ConversionJobId, UserId, VideoId};
use crate::models::{ConversionJob, Video, VideoPatch};

/// Records retained for replay when no history size is given.
pub const DEFAULT_HISTORY: usize = 1024;

// ---------------------------------------------------------------------------
// ChangeEvent
// ---------------------------------------------------------------------------

/// One persisted mutation of the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// Carries the new row, but observers re-fetch the video with its jobs.
    VideoInserted { video: Video },
    /// Only the fields that were written, plus the new row version.
    VideoUpdated {
        id: VideoId,
        fields: VideoPatch,
        version: u64,
        updated_at: DateTime<Utc>,
    },
    VideoDeleted { id: VideoId },
    JobInserted { job: ConversionJob },
    /// Full post-write job row.
    JobUpdated { job: ConversionJob },
    JobDeleted {
        id: ConversionJobId,
        video_id: VideoId,
    },
}

impl ChangeEvent {
    /// The video this event belongs to.
    pub fn video_id(&self) -> VideoId {
        match self {
            Self::VideoInserted { video } => video.id,
            Self::VideoUpdated { id, .. } | Self::VideoDeleted { id } => *id,
            Self::JobInserted { job } | Self::JobUpdated { job } => job.video_id,
            Self::JobDeleted { video_id, .. } => *video_id,
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VideoInserted { .. } => "video_inserted",
            Self::VideoUpdated { .. } => "video_updated",
            Self::VideoDeleted { .. } => "video_deleted",
            Self::JobInserted { .. } => "job_inserted",
            Self::JobUpdated { .. } => "job_updated",
            Self::JobDeleted { .. } => "job_deleted",
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeRecord
// ---------------------------------------------------------------------------

/// A sequenced, user-scoped change event ready for broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonic per-notifier sequence number, starting at 1.
    pub seq: u64,
    /// Owner of the affected video.
    pub user_id: UserId,
    /// When the record was published.
    pub timestamp: DateTime<Utc>,
    pub event: ChangeEvent,
}

// ---------------------------------------------------------------------------
// ChangeNotifier
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded history of recent records.
pub struct ChangeNotifier {
    tx: broadcast::Sender<ChangeRecord>,
    seq: AtomicU64,
    history: usize,
    /// Oldest first.
    recent: RwLock<VecDeque<ChangeRecord>>,
}

impl ChangeNotifier {
    /// Create a new notifier keeping [`DEFAULT_HISTORY`] records for replay.
    ///
    /// `capacity` is the per-subscriber backlog before a subscriber lags.
    pub fn new(capacity: usize) -> Self {
        Self::with_history(capacity, DEFAULT_HISTORY)
    }

    /// Create a notifier that keeps the last `history` records for replay.
    pub fn with_history(capacity: usize, history: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: AtomicU64::new(0),
            history,
            recent: RwLock::new(VecDeque::with_capacity(history)),
        }
    }

    /// Publish an event on behalf of `user_id` and return its record.
    ///
    /// Callers publish after their write has committed, while still holding
    /// whatever lock orders writes to the entity.
    pub fn publish(&self, user_id: UserId, event: ChangeEvent) -> ChangeRecord {
        // Held across sequencing and send so history and channel agree on order.
        let mut recent = self.recent.write();
        let record = ChangeRecord {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            user_id,
            timestamp: Utc::now(),
            event,
        };

        if self.history > 0 {
            if recent.len() >= self.history {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }

        tracing::trace!(seq = record.seq, kind = record.event.kind(), "change published");

        // No subscribers is fine.
        let _ = self.tx.send(record.clone());
        record
    }

    /// Sequence number of the latest published record, 0 before the first.
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Open a subscription delivering changes for videos owned by `user_id`.
    pub fn subscribe(&self, user_id: UserId) -> Subscription {
        Subscription {
            user_id,
            rx: Some(self.tx.subscribe()),
            cancel: CancellationToken::new(),
        }
    }

    /// `user_id`'s records published after `after_seq`, oldest first.
    ///
    /// Returns `None` when the history has already evicted some record
    /// after `after_seq`, in which case the caller has to reload from the
    /// store.
    pub fn replay_since(&self, user_id: UserId, after_seq: u64) -> Option<Vec<ChangeRecord>> {
        let recent = self.recent.read();
        let covered = match recent.front() {
            Some(oldest) => oldest.seq <= after_seq + 1,
            None => self.last_seq() <= after_seq,
        };
        if !covered {
            return None;
        }
        Some(
            recent
                .iter()
                .filter(|r| r.seq > after_seq && r.user_id == user_id)
                .cloned()
                .collect(),
        )
    }

    /// Number of currently open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Change(ChangeRecord),
    /// The subscriber fell behind and this many records were dropped.
    Lagged(u64),
}

/// A cancellable stream of change records for one user.
pub struct Subscription {
    user_id: UserId,
    rx: Option<broadcast::Receiver<ChangeRecord>>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the subscription is cancelled or the notifier is
    /// gone. Records received after cancellation are discarded.
    pub async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.cancel.is_cancelled() {
                self.rx = None;
                return None;
            }

            let received = {
                let rx = self.rx.as_mut()?;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    r = rx.recv() => Some(r),
                }
            };
            let Some(received) = received else {
                self.rx = None;
                return None;
            };

            match received {
                Ok(record) if self.cancel.is_cancelled() => {
                    tracing::trace!(seq = record.seq, "dropping record after cancel");
                }
                Ok(record) if record.user_id == self.user_id => {
                    return Some(Delivery::Change(record));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => return Some(Delivery::Lagged(missed)),
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Stop delivery. The receiver is released on the next poll.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this subscription from another task.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
