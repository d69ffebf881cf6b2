//! Agent 运行时
//!
//! 按配置组装生成服务、归档 / 索引存储、摘要器、QueueController 与核心记忆，
//! 对外提供 chat / chat_stream / status / memory_dump / reset / evict / ingest 以及快照保存。
//! 会话状态放在单个 tokio Mutex 中：一轮对话期间独占，保证单写者。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::config::AppConfig;
use crate::core::{AgentError, MemoryDump, RecoveryEngine, RetryConfig, SessionState, SessionStatus};
use crate::llm::{create_embedder_from_config, create_llm_from_config, LlmClient};
use crate::memory::{
    ingest_messages, load_messages, open_sqlite_pool, ArchiveStore, ConcatSummarizer,
    CoreMemoryBlock, EvictionPipeline, EvictionReport, InMemoryArchive, InMemoryIndex,
    IndexStore, IngestReport, LlmSummarizer, QueueController, SnapshotPersistence, SqliteArchive,
    SqliteIndex, Summarizer,
};
use crate::react::{FunctionChainLoop, Planner, ReactEvent, TurnResult};
use crate::tools::ToolExecutor;

/// 无模型摘要的总长度上限（字符）
const CONCAT_SUMMARY_MAX_CHARS: usize = 2000;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant with a paged memory. \
Only the recent conversation fits in your context window; older messages are summarized and archived. \
Keep durable facts about the user and yourself in core memory, store longer notes with archival_memory_insert, \
and use conversation_search or archival_memory_search to recall what is no longer in view. \
Every reply to the user must go through send_message. \
When you see a memory pressure alert, save what matters before it is evicted.";

/// 从 config/prompts/system.md 读取系统提示词，找不到时使用内置默认值
pub fn load_system_prompt() -> String {
    ["config/prompts/system.md", "../config/prompts/system.md"]
        .into_iter()
        .find_map(|p| std::fs::read_to_string(p).ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

pub struct Agent {
    planner: Planner,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    system_prompt: String,
    iteration_cap: usize,
    persist_retry: RetryConfig,
    state: Arc<Mutex<SessionState>>,
    snapshots: Option<SnapshotPersistence>,
}

impl Agent {
    /// 按配置选择生成服务后组装
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let llm = create_llm_from_config(cfg);
        Self::with_llm(cfg, llm).await
    }

    /// 使用给定的生成服务组装（测试中注入 MockLlmClient）
    pub async fn with_llm(cfg: &AppConfig, llm: Arc<dyn LlmClient>) -> Result<Self, AgentError> {
        cfg.validate()?;

        let snapshots = cfg.app.snapshot_path.as_ref().map(SnapshotPersistence::new);
        let snapshot = match snapshots.as_ref().map(|s| s.load()) {
            Some(Ok(found)) => found,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "ignoring unreadable session snapshot");
                None
            }
            None => None,
        };
        // 未固定会话 id 时沿用快照中的会话
        let session_id = match (&cfg.app.session_id, &snapshot) {
            (None, Some(snap)) => snap.session_id.clone(),
            _ => cfg.session_id(),
        };

        let embedder = cfg.storage.embedding_model.as_deref().and_then(|model| {
            create_embedder_from_config(cfg.storage.embedding_base_url.as_deref(), model)
        });
        let page_size = cfg.storage.page_size;
        let (archive, index): (Arc<dyn ArchiveStore>, Arc<dyn IndexStore>) =
            if cfg.storage.backend == "sqlite" {
                let db_path = cfg.db_path();
                let pool = open_sqlite_pool(&db_path).await?;
                tracing::info!(path = %db_path.display(), "using SQLite archive and index");
                (
                    Arc::new(SqliteArchive::new(pool.clone(), page_size).await?),
                    Arc::new(SqliteIndex::new(pool, page_size, embedder).await?),
                )
            } else {
                tracing::info!("using in-memory archive and index");
                (
                    Arc::new(InMemoryArchive::new(page_size)),
                    Arc::new(InMemoryIndex::new(page_size, embedder)),
                )
            };

        let summarizer: Arc<dyn Summarizer> = match cfg.llm.summarizer.as_str() {
            "concat" => Arc::new(ConcatSummarizer::new(
                cfg.memory.concat_excerpt_chars,
                CONCAT_SUMMARY_MAX_CHARS,
            )),
            _ => Arc::new(LlmSummarizer::new(llm.clone())),
        };

        let queue = QueueController::new(
            cfg.queue_config()?,
            cfg.token_counter(),
            session_id,
            EvictionPipeline {
                summarizer,
                archive: archive.clone(),
                index: index.clone(),
                persist_retry: cfg.persist_retry(),
                summarize_timeout: Duration::from_secs(cfg.llm.timeouts.summarize),
            },
        );
        let core_memory = CoreMemoryBlock::new(cfg.memory.sections.clone());
        let mut state = SessionState::new(queue, core_memory, archive, index);

        if let Some(snap) = snapshot {
            match state.restore(snap) {
                Ok(()) => tracing::info!(
                    session_id = %state.session_id(),
                    entries = state.queue().conversation_len(),
                    "session restored from snapshot"
                ),
                Err(e) => tracing::warn!(error = %e, "snapshot not restored"),
            }
        }

        Ok(Self {
            planner: Planner::new(llm),
            executor: ToolExecutor::new(
                Duration::from_secs(cfg.chain.tool_timeout_secs),
                cfg.persist_retry(),
            ),
            recovery: RecoveryEngine::new(),
            system_prompt: load_system_prompt(),
            iteration_cap: cfg.chain.iteration_cap,
            persist_retry: cfg.persist_retry(),
            state: Arc::new(Mutex::new(state)),
            snapshots,
        })
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub async fn session_id(&self) -> String {
        self.state.lock().await.session_id().to_string()
    }

    /// 跑一轮对话
    pub async fn chat(&self, user_input: &str) -> Result<TurnResult, AgentError> {
        let mut state = self.state.lock().await;
        FunctionChainLoop::new(&self.planner, &self.executor, &self.recovery, &self.system_prompt)
            .with_iteration_cap(self.iteration_cap)
            .run_turn(&mut state, user_input)
            .await
    }

    /// 跑一轮对话，同时把过程事件推送到 event_tx
    pub async fn chat_stream(
        &self,
        user_input: &str,
        event_tx: &mpsc::UnboundedSender<ReactEvent>,
    ) -> Result<TurnResult, AgentError> {
        let mut state = self.state.lock().await;
        FunctionChainLoop::new(&self.planner, &self.executor, &self.recovery, &self.system_prompt)
            .with_iteration_cap(self.iteration_cap)
            .with_event_tx(event_tx)
            .run_turn(&mut state, user_input)
            .await
    }

    pub async fn status(&self) -> SessionStatus {
        let mut status = self.state.lock().await.status();
        status.llm_tokens = self.planner.token_usage().into();
        status
    }

    pub async fn memory_dump(&self) -> MemoryDump {
        self.state.lock().await.memory_dump()
    }

    pub async fn reset(&self) {
        self.state.lock().await.reset();
    }

    /// 手动触发一次驱逐（窗口只剩一条对话时为空操作）
    pub async fn evict(&self) -> Result<Option<EvictionReport>, AgentError> {
        self.state.lock().await.queue_mut().evict().await
    }

    /// 把 JSON 文件中的旧消息导入当前会话的归档与索引
    pub async fn ingest(&self, path: impl AsRef<Path>) -> anyhow::Result<IngestReport> {
        let messages = load_messages(path)?;
        let state = self.state.lock().await;
        let handles = state.store_handles();
        let report = ingest_messages(
            &messages,
            &handles.session_id,
            &handles.archive,
            &handles.index,
            state.queue().counter(),
            &self.persist_retry,
        )
        .await?;
        Ok(report)
    }

    /// 保存会话快照；未配置 snapshot_path 时返回 false
    pub async fn save_snapshot(&self) -> anyhow::Result<bool> {
        let Some(ref store) = self.snapshots else {
            return Ok(false);
        };
        let snapshot = self.state.lock().await.snapshot();
        store.save(&snapshot)?;
        tracing::info!(path = %store.path().display(), "session snapshot saved");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::react::TurnStatus;

    fn memory_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.storage.backend = "memory".to_string();
        cfg.llm.summarizer = "concat".to_string();
        cfg
    }

    #[tokio::test]
    async fn test_chat_with_mock() {
        let agent = Agent::with_llm(&memory_config(), Arc::new(MockLlmClient::new()))
            .await
            .unwrap();
        let result = agent.chat("ping").await.unwrap();
        assert_eq!(result.status, TurnStatus::Completed);
        assert_eq!(result.response, "Echo from Mock: ping");

        let status = agent.status().await;
        assert!(status.window.usage_tokens > 0);
        assert_eq!(status.turn_iterations, 1);
        assert!(status.llm_tokens.prompt_tokens > 0);
        assert!(status.llm_tokens.completion_tokens > 0);
        assert_eq!(
            status.llm_tokens.total_tokens,
            status.llm_tokens.prompt_tokens + status.llm_tokens.completion_tokens
        );
    }

    #[tokio::test]
    async fn test_chat_stream_emits_message_done() {
        let agent = Agent::with_llm(&memory_config(), Arc::new(MockLlmClient::new()))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        agent.chat_stream("hi", &tx).await.unwrap();
        drop(tx);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert!(matches!(events.last(), Some(ReactEvent::MessageDone)));
        assert!(events.iter().any(|e| matches!(e, ReactEvent::ToolCall { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = memory_config();
        cfg.app.snapshot_path = Some(dir.path().join("session.json"));

        let first = Agent::with_llm(&cfg, Arc::new(MockLlmClient::new())).await.unwrap();
        first.chat("remember me").await.unwrap();
        let session_id = first.session_id().await;
        assert!(first.save_snapshot().await.unwrap());

        let second = Agent::with_llm(&cfg, Arc::new(MockLlmClient::new())).await.unwrap();
        assert_eq!(second.session_id().await, session_id);
        let dump = second.memory_dump().await;
        assert!(dump.window.iter().any(|e| e.content() == "remember me"));
    }

    #[tokio::test]
    async fn test_ingested_messages_reachable_by_conversation_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old_sessions.json");
        std::fs::write(
            &path,
            r#"[
                {"role": "user", "content": "Remember: never use Docker here.", "timestamp": "2024-01-15 09:01:00"},
                {"role": "assistant", "content": "Noted, no Docker.", "timestamp": "2024-01-15 09:01:04"}
            ]"#,
        )
        .unwrap();

        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok(r#"{"tool": "conversation_search", "args": {"query": "docker"}}"#.into()),
            Ok(r#"{"tool": "archival_memory_search", "args": {"query": "Docker"}}"#.into()),
            Ok(r#"{"tool": "send_message", "args": {"content": "No Docker."}}"#.into()),
        ]));
        let agent = Agent::with_llm(&memory_config(), mock).await.unwrap();
        let report = agent.ingest(&path).await.unwrap();
        assert_eq!(report.archived, 2);
        assert_eq!(report.archive_total, 2);

        // 导入不占用窗口
        assert_eq!(agent.memory_dump().await.window.len(), 1);

        let result = agent.chat("what did I say about containers?").await.unwrap();
        assert_eq!(result.response, "No Docker.");
        let dump = agent.memory_dump().await;
        let results: Vec<&str> = dump
            .window
            .iter()
            .filter(|e| e.role() == crate::memory::Role::FunctionResult)
            .map(|e| e.content())
            .collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].contains("never use Docker here."));
        assert!(results[0].contains("\"results_count\": 2"));
        assert!(results[1].contains(&report.range_id));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut cfg = memory_config();
        cfg.memory.warn_threshold = 0.99;
        let err = Agent::with_llm(&cfg, Arc::new(MockLlmClient::new())).await;
        assert!(matches!(err, Err(AgentError::Config(_))));
    }
}
