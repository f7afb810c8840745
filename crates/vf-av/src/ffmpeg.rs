//! H.264/AAC downscale encoding using ffmpeg.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use vf_core::config::EncoderConfig;
use vf_core::{Error, Resolution, Result};

use crate::command::ToolCommand;
use crate::encoder::{Encoder, ProgressReporter};
use crate::tools::ToolRegistry;
use crate::workspace::Workspace;

/// Encodes without a configured timeout still get killed eventually.
const MAX_ENCODE_TIME: Duration = Duration::from_secs(86400);

/// Real encoder backed by the ffmpeg CLI.
///
/// Encodes are serialized through an internal lock; one instance never runs
/// two ffmpeg processes at once.
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: Option<PathBuf>,
    config: EncoderConfig,
    lock: Mutex<()>,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: PathBuf, ffprobe: Option<PathBuf>, config: EncoderConfig) -> Self {
        Self {
            ffmpeg,
            ffprobe,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Build from discovered tools. Fails if ffmpeg was not found.
    pub fn from_registry(tools: &ToolRegistry, config: EncoderConfig) -> Result<Self> {
        let ffmpeg = tools.require("ffmpeg")?.path.clone();
        let ffprobe = tools.get("ffprobe").map(|t| t.path.clone());
        Ok(Self::new(ffmpeg, ffprobe, config))
    }

    /// Source duration in seconds, if ffprobe is available and can read it.
    async fn probe_duration(&self, input: &Path) -> Option<f64> {
        let ffprobe = self.ffprobe.as_ref()?;
        let output = ToolCommand::new(ffprobe.clone())
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input.to_string_lossy().as_ref())
            .timeout(Duration::from_secs(30))
            .execute()
            .await;

        match output {
            Ok(out) => out
                .stdout
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|d| *d > 0.0),
            Err(e) => {
                tracing::debug!(error = %e, "ffprobe could not read source duration");
                None
            }
        }
    }
}

/// ffmpeg arguments for one encode.
pub fn build_args(
    input: &Path,
    output: &Path,
    target: Resolution,
    config: &EncoderConfig,
) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-progress", "pipe:2", "-nostats", "-i"]
        .into_iter()
        .map(String::from)
        .collect();
    args.push(input.to_string_lossy().to_string());
    args.push("-vf".into());
    args.push(format!("scale=-2:{}", target.height()));
    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            config.video_preset.as_str(),
            "-crf",
        ]
        .map(String::from),
    );
    args.push(config.video_crf.to_string());
    args.extend(["-c:a", "aac", "-b:a", config.audio_bitrate.as_str()].map(String::from));
    args.extend(["-movflags", "+faststart"].map(String::from));
    args.push(output.to_string_lossy().to_string());
    args
}

/// Accumulates `-progress` key/value lines into completion fractions.
#[derive(Debug, Default)]
pub struct ProgressParser {
    duration_secs: Option<f64>,
    last_out_time_us: Option<i64>,
}

impl ProgressParser {
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs,
            last_out_time_us: None,
        }
    }

    /// Feed one line. Returns a fraction at the end of each progress block.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if let Some(val) = line.strip_prefix("out_time_us=") {
            self.last_out_time_us = val.parse::<i64>().ok();
            None
        } else if let Some(state) = line.strip_prefix("progress=") {
            if state == "end" {
                return Some(1.0);
            }
            let dur = self.duration_secs.filter(|d| *d > 0.0)?;
            let out_us = self.last_out_time_us?;
            Some((out_us as f64 / 1_000_000.0 / dur).clamp(0.0, 1.0))
        } else {
            None
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    async fn is_available(&self) -> bool {
        ToolCommand::new(self.ffmpeg.clone())
            .arg("-version")
            .timeout(Duration::from_secs(10))
            .execute()
            .await
            .is_ok()
    }

    async fn encode(
        &self,
        source: &Bytes,
        target: Resolution,
        progress: &ProgressReporter,
    ) -> Result<Bytes> {
        let _guard = self.lock.lock().await;
        let to_encode = |e: Error| Error::encode(target, e.to_string());

        let ws = Workspace::new(format!("output_{target}.mp4")).map_err(to_encode)?;
        ws.write_input(source).await.map_err(to_encode)?;

        let duration = self.probe_duration(&ws.input()).await;
        tracing::info!(
            resolution = %target,
            source_bytes = source.len(),
            duration_secs = ?duration,
            preset = %self.config.video_preset,
            crf = self.config.video_crf,
            "ffmpeg encode starting"
        );

        let mut cmd = ToolCommand::new(self.ffmpeg.clone());
        cmd.args(build_args(&ws.input(), &ws.output(), target, &self.config));
        cmd.timeout(self.config.timeout().unwrap_or(MAX_ENCODE_TIME));

        let mut parser = ProgressParser::new(duration);
        cmd.execute_with_progress(|line| {
            if let Some(fraction) = parser.feed(line) {
                progress.report(fraction);
            }
        })
        .await
        .map_err(to_encode)?;

        let encoded = ws.read_output().await.map_err(to_encode)?;
        progress.report(1.0);

        tracing::info!(resolution = %target, output_bytes = encoded.len(), "ffmpeg encode finished");
        Ok(encoded)
    }
}
