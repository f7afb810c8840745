//! Deterministic stand-in encoder for hosts without ffmpeg.

use async_trait::async_trait;
use bytes::Bytes;
use vf_core::config::FallbackConfig;
use vf_core::{Resolution, Result};

use crate::encoder::{Encoder, ProgressReporter};

/// Emulates an encode by pacing through fixed steps and returning the source
/// bytes unchanged.
///
/// With the default configuration it runs 10 steps, reporting `k/10` after
/// step `k`, and waits `300ms + 200ms * height / 1080` before each step.
#[derive(Debug, Clone, Default)]
pub struct FallbackEncoder {
    config: FallbackConfig,
}

impl FallbackEncoder {
    pub fn new(config: FallbackConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Encoder for FallbackEncoder {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn encode(
        &self,
        source: &Bytes,
        target: Resolution,
        progress: &ProgressReporter,
    ) -> Result<Bytes> {
        let steps = self.config.steps.max(1);
        let delay = self.config.step_delay(target);

        tracing::debug!(resolution = %target, steps, delay_ms = delay.as_millis() as u64, "emulating encode");

        for step in 1..=steps {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            progress.report(f64::from(step) / f64::from(steps));
        }

        Ok(source.clone())
    }
}
