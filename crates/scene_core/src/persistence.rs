//! Persistence of finished generations.
//!
//! Sessions are written through a [`GenerationSink`]. The orchestrator awaits
//! the sink under a short timeout and only logs its failures, so storage
//! problems never change a session's outcome.
//!
//! [`JsonFileSink`] stores one document per session:
//! ```text
//! <dir>/<session_id>.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::result::GenerationResult;
use crate::stage::StageRecord;

/// Receiver of finished generations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationSink: Send + Sync {
    async fn record_generation(
        &self,
        session_id: &str,
        stage_log: &[StageRecord],
        result: &GenerationResult,
    ) -> CoreResult<()>;
}

/// Stored form of one generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub stages: Vec<StageRecord>,
    pub result: GenerationResult,
}

/// Sink writing pretty JSON files into a directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    /// Load a previously recorded session.
    pub async fn load(&self, session_id: &str) -> CoreResult<SessionRecord> {
        let path = self.record_path(session_id);
        if !path.exists() {
            return Err(CoreError::SessionNotFound(session_id.to_string()));
        }
        let content = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&content).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl GenerationSink for JsonFileSink {
    async fn record_generation(
        &self,
        session_id: &str,
        stage_log: &[StageRecord],
        result: &GenerationResult,
    ) -> CoreResult<()> {
        let record = SessionRecord {
            session_id: session_id.to_string(),
            recorded_at: Utc::now(),
            stages: stage_log.to_vec(),
            result: result.clone(),
        };
        let content =
            serde_json::to_string_pretty(&record).map_err(|e| CoreError::Serialization(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.record_path(session_id);
        tokio::fs::write(&path, content).await?;
        debug!("Recorded session {} to {}", session_id, path.display());
        Ok(())
    }
}
