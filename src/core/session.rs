//! 会话状态：一次智能体会话拥有的全部可变状态
//!
//! 持有会话 id、QueueController、CoreMemoryBlock、本轮迭代计数以及两个存储的共享句柄。
//! 由 Agent 包在单个 tokio Mutex 中，一轮对话期间独占，保证单写者。

use std::sync::Arc;

use serde::Serialize;

use crate::core::AgentError;
use crate::memory::{
    ArchiveStore, CoreMemoryBlock, Entry, IndexStore, Message, QueueController, SessionSnapshot,
    WindowStatus,
};

/// 只读检索所需的句柄，可脱离会话锁并发使用
#[derive(Clone)]
pub struct StoreHandles {
    pub session_id: String,
    pub archive: Arc<dyn ArchiveStore>,
    pub index: Arc<dyn IndexStore>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub window: WindowStatus,
    /// (段名, 已用字符数)
    pub core_memory: Vec<(String, usize)>,
    pub turn_iterations: usize,
    /// 生成服务累计 token（由 Agent 填入）
    pub llm_tokens: LlmTokenUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LlmTokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<(u64, u64, u64)> for LlmTokenUsage {
    fn from((prompt_tokens, completion_tokens, total_tokens): (u64, u64, u64)) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

/// `/memory` 输出
#[derive(Debug, Clone, Serialize)]
pub struct MemoryDump {
    pub core_memory: Vec<(String, String)>,
    pub summary: String,
    pub window: Vec<Entry>,
}

pub struct SessionState {
    queue: QueueController,
    core_memory: CoreMemoryBlock,
    archive: Arc<dyn ArchiveStore>,
    index: Arc<dyn IndexStore>,
    turn_iterations: usize,
}

impl SessionState {
    pub fn new(
        queue: QueueController,
        core_memory: CoreMemoryBlock,
        archive: Arc<dyn ArchiveStore>,
        index: Arc<dyn IndexStore>,
    ) -> Self {
        Self {
            queue,
            core_memory,
            archive,
            index,
            turn_iterations: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        self.queue.session_id()
    }

    pub fn queue(&self) -> &QueueController {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut QueueController {
        &mut self.queue
    }

    pub fn core_memory(&self) -> &CoreMemoryBlock {
        &self.core_memory
    }

    pub fn core_memory_mut(&mut self) -> &mut CoreMemoryBlock {
        &mut self.core_memory
    }

    pub fn archive(&self) -> Arc<dyn ArchiveStore> {
        Arc::clone(&self.archive)
    }

    pub fn index(&self) -> Arc<dyn IndexStore> {
        Arc::clone(&self.index)
    }

    pub fn store_handles(&self) -> StoreHandles {
        StoreHandles {
            session_id: self.session_id().to_string(),
            archive: self.archive(),
            index: self.index(),
        }
    }

    pub fn turn_iterations(&self) -> usize {
        self.turn_iterations
    }

    pub fn begin_turn(&mut self) {
        self.turn_iterations = 0;
    }

    pub fn record_iteration(&mut self) -> usize {
        self.turn_iterations += 1;
        self.turn_iterations
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id().to_string(),
            window: self.queue.status(),
            core_memory: self
                .core_memory
                .snapshot()
                .into_iter()
                .map(|(name, content)| (name, content.chars().count()))
                .collect(),
            turn_iterations: self.turn_iterations,
            llm_tokens: LlmTokenUsage::default(),
        }
    }

    pub fn memory_dump(&self) -> MemoryDump {
        MemoryDump {
            core_memory: self.core_memory.snapshot(),
            summary: self.queue.current_summary().to_string(),
            window: self.queue.entries().to_vec(),
        }
    }

    /// 清空窗口与核心记忆；归档 / 索引存储不动
    pub fn reset(&mut self) {
        self.queue.clear();
        self.core_memory.reset();
        self.turn_iterations = 0;
        tracing::info!(session_id = %self.session_id(), "session reset");
    }

    /// 发往生成服务的完整上下文：system（提示词 + 工具说明 + 核心记忆）+ 窗口
    pub fn build_context(&self, system_prompt: &str, tools_section: &str) -> Vec<Message> {
        let system = format!(
            "{}\n\n{}\n{}",
            system_prompt.trim_end(),
            tools_section.trim_end(),
            self.core_memory.to_prompt_section()
        );
        let mut messages = vec![Message::system(system)];
        messages.extend(self.queue.to_messages());
        messages
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id().to_string(),
            summary: self.queue.current_summary().to_string(),
            entries: self
                .queue
                .entries()
                .iter()
                .filter(|e| e.is_conversation())
                .cloned()
                .collect(),
            core_memory: self.core_memory.snapshot(),
            saved_at: chrono::Utc::now(),
        }
    }

    /// 从快照恢复窗口与核心记忆；会话 id 不一致时拒绝
    pub fn restore(&mut self, snapshot: SessionSnapshot) -> Result<(), AgentError> {
        if snapshot.session_id != self.session_id() {
            return Err(AgentError::Validation(format!(
                "snapshot belongs to session {}, current session is {}",
                snapshot.session_id,
                self.session_id()
            )));
        }
        self.core_memory.restore(&snapshot.core_memory)?;
        self.queue.restore(snapshot.summary, snapshot.entries);
        Ok(())
    }
}
