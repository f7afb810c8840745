//! The encoder capability.
//!
//! An [`Encoder`] turns source bytes into an encoded blob for one target
//! resolution, reporting progress through a [`ProgressReporter`]. The
//! orchestrator picks one implementation per run: [`FfmpegEncoder`] when it
//! is available, otherwise [`FallbackEncoder`].
//!
//! [`FfmpegEncoder`]: crate::FfmpegEncoder
//! [`FallbackEncoder`]: crate::FallbackEncoder

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use vf_core::{Resolution, Result};

/// Transcoding capability.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Short name used in logs ("ffmpeg", "fallback").
    fn name(&self) -> &'static str;

    /// Whether this encoder can run on the current host.
    async fn is_available(&self) -> bool;

    /// Encode `source` to `target`.
    ///
    /// Progress reported through `progress` is non-decreasing and reaches
    /// 100 on success. Any failure is a single [`vf_core::Error`].
    async fn encode(
        &self,
        source: &Bytes,
        target: Resolution,
        progress: &ProgressReporter,
    ) -> Result<Bytes>;
}

/// Per-invocation progress sink.
///
/// Backed by a `watch` channel, so reporting never blocks: a slow reader only
/// ever sees the latest value. Values are whole percent and only move up.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<u8>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver that observes it.
    pub fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, rx)
    }

    /// Report a fraction of completion in `[0, 1]`.
    ///
    /// Mapped to `round(fraction * 100)`. Out-of-range and non-finite values
    /// are clamped; values below the last report are ignored.
    pub fn report(&self, fraction: f64) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.report_percent((fraction * 100.0).round() as u8);
    }

    /// Report whole percent directly.
    pub fn report_percent(&self, pct: u8) {
        let pct = pct.min(100);
        self.tx.send_if_modified(|current| {
            if pct > *current {
                *current = pct;
                true
            } else {
                false
            }
        });
    }

    /// The last reported percent.
    pub fn current(&self) -> u8 {
        *self.tx.borrow()
    }
}
