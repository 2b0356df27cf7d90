//! Runtime checkpoints: persist stages, breadcrumbs and hands to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ery_types::Result;
use serde::{Deserialize, Serialize};

use crate::breadcrumb::{BreadcrumbArena, BreadcrumbId};
use crate::runtime::{HandId, HandStatus, Stage, StageId};

const CHECKPOINT_FILE: &str = "runtime.json";

/// Serialized form of a hand, with a snapshot of its variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandRecord {
    pub id: HandId,
    pub module: String,
    pub frontend: String,
    pub language: String,
    pub stage: Option<StageId>,
    pub current_breadcrumb: Option<BreadcrumbId>,
    pub status: HandStatus,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeCheckpoint {
    pub stages: Vec<Stage>,
    pub breadcrumbs: BreadcrumbArena,
    pub hands: Vec<HandRecord>,
    /// RFC 3339 time the checkpoint was taken.
    pub timestamp: String,
}

impl RuntimeCheckpoint {
    pub fn new(stages: Vec<Stage>, breadcrumbs: BreadcrumbArena, hands: Vec<HandRecord>) -> Self {
        Self {
            stages,
            breadcrumbs,
            hands,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Write `<dir>/runtime.json`, creating `dir` if needed.
pub async fn save_checkpoint(checkpoint: &RuntimeCheckpoint, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(CHECKPOINT_FILE);
    let json = serde_json::to_string_pretty(checkpoint)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), hands = checkpoint.hands.len(), "Checkpoint saved");
    Ok(path)
}

/// Returns `Ok(None)` when no checkpoint exists.
pub async fn load_checkpoint(dir: &Path) -> Result<Option<RuntimeCheckpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}

pub async fn clear_checkpoint(dir: &Path) -> Result<()> {
    let path = dir.join(CHECKPOINT_FILE);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}
