//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries the
//! database, storage, tool, encoder, sync, and recovery settings. Every
//! section defaults sensibly so a completely empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::media::Resolution;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub encoder: EncoderConfig,
    pub fallback: FallbackConfig,
    pub sync: SyncConfig,
    pub recovery: RecoveryConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None`, the file does not exist, or it fails to parse.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.encoder.video_crf > 51 {
            warnings.push(format!(
                "encoder.video_crf {} is outside libx264's 0-51 range",
                self.encoder.video_crf
            ));
        }

        let presets = [
            "ultrafast",
            "superfast",
            "veryfast",
            "faster",
            "fast",
            "medium",
            "slow",
            "slower",
            "veryslow",
        ];
        if !presets.contains(&self.encoder.video_preset.as_str()) {
            warnings.push(format!(
                "encoder.video_preset '{}' is not a recognized x264 preset",
                self.encoder.video_preset
            ));
        }

        if self.encoder.timeout_secs == 0 {
            warnings.push("encoder.timeout_secs is 0; encodes will never time out".into());
        }

        if self.fallback.steps == 0 {
            warnings.push("fallback.steps is 0; treating it as 1".into());
        }

        if self.sync.channel_capacity < 16 {
            warnings.push(format!(
                "sync.channel_capacity {} is small; observers will resync often",
                self.sync.channel_capacity
            ));
        }

        if self.sync.history < self.sync.channel_capacity {
            warnings.push(format!(
                "sync.history {} is below sync.channel_capacity {}; lagging observers \
                 will reload from the store instead of replaying",
                self.sync.history, self.sync.channel_capacity
            ));
        }

        if self.recovery.stall_timeout_secs < self.encoder.timeout_secs {
            warnings.push(
                "recovery.stall_timeout_secs is shorter than encoder.timeout_secs; \
                 running encodes may be marked stalled"
                    .into(),
            );
        }

        if self.storage.public_base_url.is_empty() {
            warnings.push("storage.public_base_url is empty; output urls will be bare paths".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/vidforge.db"),
        }
    }
}

/// Local media storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory that storage paths are resolved against.
    pub root: PathBuf,
    /// Prefix joined with a storage path to form its public url.
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/media"),
            public_base_url: "http://localhost:8080/media".into(),
        }
    }
}

/// Paths to external CLI tools. Unset tools are looked up on `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// How the orchestrator picks its encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderMode {
    /// Use ffmpeg when available, otherwise the fallback emulator.
    #[default]
    Auto,
    /// Always use the fallback emulator.
    Fallback,
}

/// Real encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub mode: EncoderMode,
    pub video_preset: String,
    pub video_crf: u32,
    pub audio_bitrate: String,
    /// Wall-clock limit for a single encode. 0 disables the limit.
    pub timeout_secs: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            mode: EncoderMode::Auto,
            video_preset: "fast".into(),
            video_crf: 23,
            audio_bitrate: "128k".into(),
            timeout_secs: 600,
        }
    }
}

impl EncoderConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Fallback emulator pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub steps: u32,
    pub base_step_ms: u64,
    /// Extra delay per step at 1080p, scaled linearly by output height.
    pub per_height_step_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            steps: 10,
            base_step_ms: 300,
            per_height_step_ms: 200,
        }
    }
}

impl FallbackConfig {
    /// No delay between steps. Used by tests.
    pub fn instant() -> Self {
        Self {
            base_step_ms: 0,
            per_height_step_ms: 0,
            ..Self::default()
        }
    }

    /// Delay between two steps when emulating `target`.
    pub fn step_delay(&self, target: Resolution) -> Duration {
        let scaled = self.per_height_step_ms * u64::from(target.height()) / 1080;
        Duration::from_millis(self.base_step_ms + scaled)
    }
}

/// Change notifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Records buffered per subscriber before it lags.
    pub channel_capacity: usize,
    /// Recent records kept so a lagging observer can replay instead of
    /// reloading everything.
    pub history: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            history: crate::events::DEFAULT_HISTORY,
        }
    }
}

/// Stall recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub stall_timeout_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 900,
        }
    }
}

impl RecoveryConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}
