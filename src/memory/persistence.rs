//! 会话快照持久化
//!
//! 将窗口（摘要 + 对话条目）与核心记忆写入 / 从 JSON 文件加载，用于进程重启后继续同一会话。
//! 压力提示是临时性的，不写入快照。

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::memory::Entry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub summary: String,
    pub entries: Vec<Entry>,
    pub core_memory: Vec<(String, String)>,
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

/// 单文件 JSON 快照
#[derive(Debug)]
pub struct SnapshotPersistence {
    path: PathBuf,
}

impl SnapshotPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回 None
    pub fn load(&self) -> anyhow::Result<Option<SessionSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read snapshot {}", self.path.display()))?;
        let snapshot: SessionSnapshot = serde_json::from_str(&data)
            .with_context(|| format!("parse snapshot {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    /// 写入快照；父目录不存在时自动创建。先写临时文件再改名，避免留下半个文件
    pub fn save(&self, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)
            .with_context(|| format!("write snapshot {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename snapshot to {}", self.path.display()))?;
        Ok(())
    }
}
