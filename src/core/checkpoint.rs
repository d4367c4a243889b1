//! 运行状态检查点
//!
//! 每次阶段切换后保存 WorkflowState，用于澄清挂起后的 resume 与跨进程恢复。
//! 提供内存存储（测试 / 单进程）与 JSON 文件存储（每个 run 一个 `<run_id>.json`）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::state::WorkflowState;
use crate::core::ResearchError;

/// 检查点存储 trait
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, state: &WorkflowState) -> Result<(), ResearchError>;

    /// 读取检查点；不存在时返回 None
    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, ResearchError>;
}

/// 内存检查点
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    states: RwLock<HashMap<String, WorkflowState>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), ResearchError> {
        self.states
            .write()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, ResearchError> {
        Ok(self.states.read().await.get(run_id).cloned())
    }
}

/// JSON 文件检查点：目录不存在时自动创建
#[derive(Debug)]
pub struct JsonFileCheckpointStore {
    dir: PathBuf,
}

impl JsonFileCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, ResearchError> {
        // run_id 只允许出现在文件名里
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.contains("..") {
            return Err(ResearchError::Checkpoint(format!("invalid run id: {run_id}")));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

#[async_trait]
impl CheckpointStore for JsonFileCheckpointStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), ResearchError> {
        let path = self.path_for(&state.run_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ResearchError::Checkpoint(format!("create {}: {e}", self.dir.display())))?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| ResearchError::Checkpoint(format!("serialize: {e}")))?;
        // 先写临时文件再改名，避免中途失败留下半个文件
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ResearchError::Checkpoint(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ResearchError::Checkpoint(format!("rename {}: {e}", path.display())))?;
        tracing::debug!(run_id = %state.run_id, path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<WorkflowState>, ResearchError> {
        let path = self.path_for(run_id)?;
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ResearchError::Checkpoint(format!("read {}: {e}", path.display())));
            }
        };
        serde_json::from_str(&data)
            .map(Some)
            .map_err(|e| ResearchError::Checkpoint(format!("parse {}: {e}", path.display())))
    }
}
