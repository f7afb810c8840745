//! Application context.
//!
//! [`AppContext`] wires the configured store, storage, and tools together
//! and hands out orchestrators. It is cheaply cloneable because it only holds
//! `Arc`s.

use std::sync::Arc;
use std::time::Duration;

use vf_av::{Encoder, FallbackEncoder, FfmpegEncoder, ToolRegistry};
use vf_core::config::{Config, EncoderMode};
use vf_core::{ChangeNotifier, JobStore, Result};
use vf_db::{init_pool, DbPool, SqliteJobStore};

use crate::orchestrator::Orchestrator;
use crate::storage::LocalStorage;

#[derive(Clone)]
pub struct AppContext {
    /// Immutable configuration snapshot.
    pub config: Arc<Config>,
    pub db: DbPool,
    pub store: Arc<dyn JobStore>,
    pub storage: Arc<LocalStorage>,
    /// Discovered ffmpeg/ffprobe.
    pub tools: Arc<ToolRegistry>,
}

impl AppContext {
    /// Open the database and discover tools.
    pub fn init(config: Config) -> Result<Self> {
        tracing::info!(path = %config.database.path.display(), "opening database");
        let db = init_pool(&config.database.path)?;
        Ok(Self::with_pool(config, db))
    }

    /// Build a context around an existing pool.
    pub fn with_pool(config: Config, db: DbPool) -> Self {
        let notifier = Arc::new(ChangeNotifier::with_history(
            config.sync.channel_capacity,
            config.sync.history,
        ));
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone(), notifier));
        let storage = Arc::new(LocalStorage::from_config(&config.storage));
        let tools = Arc::new(ToolRegistry::discover(&config.tools));
        Self {
            config: Arc::new(config),
            db,
            store,
            storage,
            tools,
        }
    }

    /// The real encoder, unless configuration or `force_fallback` rules it
    /// out or ffmpeg was not found.
    pub fn encoder(&self, force_fallback: bool) -> Option<Arc<dyn Encoder>> {
        if force_fallback || self.config.encoder.mode == EncoderMode::Fallback {
            return None;
        }
        match FfmpegEncoder::from_registry(&self.tools, self.config.encoder.clone()) {
            Ok(encoder) => Some(Arc::new(encoder)),
            Err(e) => {
                tracing::info!(error = %e, "real encoder not configured");
                None
            }
        }
    }

    pub fn orchestrator(&self, force_fallback: bool) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.storage.clone(),
            self.encoder(force_fallback),
            Arc::new(FallbackEncoder::new(self.config.fallback.clone())),
        )
        .with_heartbeat(Some(self.heartbeat()))
    }

    /// A third of the stall timeout.
    fn heartbeat(&self) -> Duration {
        Duration::from_secs((self.config.recovery.stall_timeout_secs / 3).max(1))
    }
}
