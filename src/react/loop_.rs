//! 函数链主循环
//!
//! 用户输入 -> push 进窗口 -> 拼上下文 -> 生成 -> 解析工具调用 -> 依次执行并写回 function-result ->
//! 直到第一个成功的 send_message 或达到 iteration_cap。工具错误写回窗口让智能体自我纠正，
//! 相邻的只读检索并发执行、按调用顺序写回。
//! 可选 event_tx：向 REPL 等前端推送 Thinking / ToolCall / Observation / MessageDone。

use futures_util::future::join_all;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine, SessionState};
use crate::memory::Role;
use crate::react::{Planner, ReactEvent};
use crate::tools::{FunctionResult, ToolCall, ToolExecutor, ToolOutput};

/// 默认每轮最多调用生成服务的次数
pub const DEFAULT_ITERATION_CAP: usize = 10;
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// 智能体通过 send_message 回复了用户
    Completed,
    /// 达到迭代上限，response 为合成的失败回复
    IterationCapExceeded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub response: String,
    pub status: TurnStatus,
    /// 本轮调用生成服务的次数
    pub iterations: usize,
}

/// 函数链循环配置
pub struct FunctionChainLoop<'a> {
    planner: &'a Planner,
    executor: &'a ToolExecutor,
    recovery: &'a RecoveryEngine,
    system_prompt: &'a str,
    tools_section: String,
    iteration_cap: usize,
    event_tx: Option<&'a UnboundedSender<ReactEvent>>,
}

impl<'a> FunctionChainLoop<'a> {
    pub fn new(
        planner: &'a Planner,
        executor: &'a ToolExecutor,
        recovery: &'a RecoveryEngine,
        system_prompt: &'a str,
    ) -> Self {
        Self {
            planner,
            executor,
            recovery,
            system_prompt,
            tools_section: crate::tools::tools_prompt_section(),
            iteration_cap: DEFAULT_ITERATION_CAP,
            event_tx: None,
        }
    }

    /// 设置迭代上限（至少为 1）
    pub fn with_iteration_cap(mut self, cap: usize) -> Self {
        self.iteration_cap = cap.max(1);
        self
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send_event(&self, ev: ReactEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 写入窗口并在需要时驱逐；驱逐失败不终止本轮（窗口保留待重试的驱逐，下次 push 再试）
    async fn record(&self, state: &mut SessionState, role: Role, content: String) {
        match state.queue_mut().push(role, content).await {
            Ok(outcome) => {
                if outcome.advisory_injected {
                    let report = state.queue().check_pressure();
                    self.send_event(ReactEvent::MemoryPressure {
                        usage_tokens: report.usage_tokens,
                        max_tokens: state.queue().config().max_tokens,
                    });
                }
                for ev in outcome.evictions {
                    self.send_event(ReactEvent::Eviction {
                        evicted: ev.evicted,
                        tokens_before: ev.tokens_before,
                        tokens_after: ev.tokens_after,
                        range_id: ev.range_id,
                    });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "eviction pending after failed persistence");
                self.send_event(ReactEvent::Error {
                    text: format!("Eviction deferred: {}", e),
                });
            }
        }
    }

    async fn record_result(&self, state: &mut SessionState, result: FunctionResult) {
        let preview: String = result.message.chars().take(OBSERVATION_PREVIEW_CHARS).collect();
        self.send_event(ReactEvent::Observation {
            tool: result.name.clone(),
            ok: result.ok,
            preview,
        });
        self.record(state, Role::FunctionResult, result.render()).await;
    }

    /// 工具错误交给 RecoveryEngine：FeedBack / Retry 写回窗口，AbortTurn 终止本轮
    fn tool_failure(&self, call: &ToolCall, err: AgentError) -> Result<FunctionResult, AgentError> {
        let action = self.recovery.handle(&err);
        let message = match action {
            RecoveryAction::FeedBack(msg) => msg,
            RecoveryAction::Retry => format!("{}. Try the call again.", err),
            RecoveryAction::AbortTurn => {
                self.send_event(ReactEvent::Recovery {
                    action: "AbortTurn".to_string(),
                    detail: err.to_string(),
                });
                return Err(err);
            }
        };
        self.send_event(ReactEvent::Recovery {
            action: "FeedBack".to_string(),
            detail: message.clone(),
        });
        Ok(FunctionResult::failure(call.name(), message))
    }

    fn to_result(
        &self,
        call: &ToolCall,
        result: Result<ToolOutput, AgentError>,
    ) -> Result<FunctionResult, AgentError> {
        match result {
            Ok(out) => Ok(FunctionResult::success(call.name(), out)),
            Err(e) => self.tool_failure(call, e),
        }
    }

    fn finish(&self, response: String, status: TurnStatus, iterations: usize) -> TurnResult {
        self.send_event(ReactEvent::MessageChunk {
            text: response.clone(),
        });
        self.send_event(ReactEvent::MessageDone);
        TurnResult {
            response,
            status,
            iterations,
        }
    }

    /// 执行一轮：返回 send_message 的内容，或达到上限时的合成回复
    pub async fn run_turn(
        &self,
        state: &mut SessionState,
        user_input: &str,
    ) -> Result<TurnResult, AgentError> {
        state.begin_turn();
        self.record(state, Role::User, user_input.to_string()).await;

        loop {
            if state.turn_iterations() >= self.iteration_cap {
                let iterations = state.turn_iterations();
                tracing::warn!(iterations, "iteration cap reached without send_message");
                self.record(
                    state,
                    Role::System,
                    format!("Turn ended after {iterations} steps without a reply to the user."),
                )
                .await;
                let response = format!(
                    "Sorry, I could not finish this request within {} steps.",
                    self.iteration_cap
                );
                return Ok(self.finish(response, TurnStatus::IterationCapExceeded, iterations));
            }

            let step = state.record_iteration();
            self.send_event(ReactEvent::StepUpdate {
                step,
                max_steps: self.iteration_cap,
            });

            let context = state.build_context(self.system_prompt, &self.tools_section);
            self.send_event(ReactEvent::Thinking);
            let generation = match self.planner.generate(&context).await {
                Ok(g) => g,
                Err(e) => {
                    let err = AgentError::from(e);
                    let corrupt = matches!(err, AgentError::CorruptResponse(_));
                    match self.recovery.handle(&err) {
                        RecoveryAction::FeedBack(msg) if corrupt => {
                            tracing::debug!(step, "unparseable generation fed back");
                            self.send_event(ReactEvent::Recovery {
                                action: "FeedBack".to_string(),
                                detail: msg.clone(),
                            });
                            self.record_result(state, FunctionResult::failure("tool_call", msg))
                                .await;
                            continue;
                        }
                        RecoveryAction::AbortTurn => {
                            self.record(state, Role::System, format!("Turn aborted: {}", err))
                                .await;
                            self.send_event(ReactEvent::Error {
                                text: err.to_string(),
                            });
                            return Err(err);
                        }
                        _ => {
                            tracing::warn!(error = %err, "generation service failed after retries");
                            self.record(
                                state,
                                Role::System,
                                format!("Generation service unavailable: {}", err),
                            )
                            .await;
                            self.send_event(ReactEvent::Error {
                                text: err.to_string(),
                            });
                            // 超时保持原样，其余服务故障归为暂时性 I/O
                            return Err(match err {
                                timeout @ AgentError::Timeout(_) => timeout,
                                other => AgentError::TransientIo(other.to_string()),
                            });
                        }
                    }
                }
            };

            if !generation.text.is_empty() {
                self.record(state, Role::Assistant, generation.text.clone()).await;
            }
            if generation.tool_calls.is_empty() {
                let text: String = generation.text.chars().take(THINKING_PREVIEW_CHARS).collect();
                self.send_event(ReactEvent::ThinkingContent { text });
                continue;
            }

            let calls = generation.tool_calls;
            let mut i = 0;
            while i < calls.len() {
                // 相邻的只读检索并发执行
                if calls[i].is_read_only() {
                    let mut j = i;
                    while j < calls.len() && calls[j].is_read_only() {
                        j += 1;
                    }
                    let batch = &calls[i..j];
                    for call in batch {
                        self.send_event(ReactEvent::ToolCall {
                            tool: call.name().to_string(),
                            args: call.args_json(),
                        });
                    }
                    let handles = state.store_handles();
                    let outputs = join_all(
                        batch
                            .iter()
                            .map(|call| self.executor.execute_read_only(&handles, call)),
                    )
                    .await;
                    for (call, output) in batch.iter().zip(outputs) {
                        let result = self.to_result(call, output)?;
                        self.record_result(state, result).await;
                    }
                    i = j;
                    continue;
                }

                let call = &calls[i];
                i += 1;
                self.send_event(ReactEvent::ToolCall {
                    tool: call.name().to_string(),
                    args: call.args_json(),
                });
                let output = self.executor.execute(state, call).await;

                if let (Some(reply), Ok(_)) = (call.terminal_reply(), &output) {
                    return Ok(self.finish(
                        reply.to_string(),
                        TurnStatus::Completed,
                        state.turn_iterations(),
                    ));
                }

                let result = self.to_result(call, output)?;
                self.record_result(state, result).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RetryConfig;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::memory::{
        ArchiveStore, ConcatSummarizer, CoreMemoryBlock, EntryKind, EvictionPipeline,
        InMemoryArchive, InMemoryIndex, IndexStore, QueueConfig, QueueController, TokenCounter,
    };
    use std::sync::Arc;
    use std::time::Duration;

    fn state() -> SessionState {
        let archive: Arc<dyn ArchiveStore> = Arc::new(InMemoryArchive::default());
        let index: Arc<dyn IndexStore> = Arc::new(InMemoryIndex::default());
        let queue = QueueController::new(
            QueueConfig::new(100_000, 0.7, 0.95).unwrap(),
            TokenCounter::default(),
            "s1",
            EvictionPipeline {
                summarizer: Arc::new(ConcatSummarizer::default()),
                archive: archive.clone(),
                index: index.clone(),
                persist_retry: RetryConfig::default(),
                summarize_timeout: Duration::from_secs(1),
            },
        );
        SessionState::new(queue, CoreMemoryBlock::default(), archive, index)
    }

    fn executor() -> ToolExecutor {
        ToolExecutor::new(Duration::from_secs(5), RetryConfig::default())
    }

    #[tokio::test]
    async fn test_send_message_ends_turn() {
        let planner = Planner::new(Arc::new(MockLlmClient::new()));
        let exec = executor();
        let recovery = RecoveryEngine::new();
        let chain = FunctionChainLoop::new(&planner, &exec, &recovery, "You are helpful.");
        let mut s = state();

        let result = chain.run_turn(&mut s, "hello").await.unwrap();
        assert_eq!(result.status, TurnStatus::Completed);
        assert_eq!(result.response, "Echo from Mock: hello");
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn test_tool_error_fed_back_then_recovered() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok(r#"{"tool": "core_memory_append", "args": {"section": "pets", "content": "cat"}}"#.into()),
            Ok(r#"{"tool": "core_memory_append", "args": {"section": "human", "content": "Has a cat"}}"#.into()),
            Ok(r#"{"tool": "send_message", "args": {"content": "Noted!"}}"#.into()),
        ]));
        let planner = Planner::new(mock.clone());
        let exec = executor();
        let recovery = RecoveryEngine::new();
        let chain = FunctionChainLoop::new(&planner, &exec, &recovery, "sys");
        let mut s = state();

        let result = chain.run_turn(&mut s, "I have a cat").await.unwrap();
        assert_eq!(result.response, "Noted!");
        assert_eq!(result.iterations, 3);
        assert!(s.core_memory().get("human").unwrap_or("").contains("Has a cat"));

        let feedback = s
            .queue()
            .entries()
            .iter()
            .find(|e| e.role() == Role::FunctionResult && e.content().contains("Status: error"))
            .map(|e| e.content().to_string())
            .unwrap_or_default();
        assert!(feedback.contains("Unknown core memory section: pets"));
    }

    #[tokio::test]
    async fn test_text_only_output_is_monologue() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok("Let me think about what the user wants.".into()),
            Ok(r#"{"tool": "send_message", "args": {"content": "Hi!"}}"#.into()),
        ]));
        let planner = Planner::new(mock);
        let exec = executor();
        let recovery = RecoveryEngine::new();
        let chain = FunctionChainLoop::new(&planner, &exec, &recovery, "sys");
        let mut s = state();

        let result = chain.run_turn(&mut s, "hey").await.unwrap();
        assert_eq!(result.response, "Hi!");
        assert!(s
            .queue()
            .entries()
            .iter()
            .any(|e| e.role() == Role::Assistant && e.content().starts_with("Let me think")));
    }

    #[tokio::test]
    async fn test_corrupt_output_fed_back() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok(r#"{"tool": "send_message", "args": {"content": }"#.into()),
            Ok(r#"{"tool": "send_message", "args": {"content": "fixed"}}"#.into()),
        ]));
        let planner = Planner::new(mock);
        let exec = executor();
        let recovery = RecoveryEngine::new();
        let chain = FunctionChainLoop::new(&planner, &exec, &recovery, "sys");
        let mut s = state();

        let result = chain.run_turn(&mut s, "hey").await.unwrap();
        assert_eq!(result.response, "fixed");
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn test_generation_failure_ends_turn_with_transient_io() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Err(LlmError::ServiceUnavailable(
            "503".into(),
        ))]));
        let planner = Planner::new(mock);
        let exec = executor();
        let recovery = RecoveryEngine::new();
        let chain = FunctionChainLoop::new(&planner, &exec, &recovery, "sys");
        let mut s = state();

        let err = chain.run_turn(&mut s, "hey").await.unwrap_err();
        assert!(matches!(err, AgentError::TransientIo(_)));
        assert!(s
            .queue()
            .entries()
            .iter()
            .any(|e| e.role() == Role::System && e.kind() == EntryKind::Conversation));

        // 会话仍可用
        let ok = chain.run_turn(&mut s, "again").await.unwrap();
        assert_eq!(ok.status, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn test_generation_timeout_surfaces_as_timeout() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Err(LlmError::Timeout)]));
        let planner = Planner::new(mock);
        let exec = executor();
        let recovery = RecoveryEngine::new();
        let chain = FunctionChainLoop::new(&planner, &exec, &recovery, "sys");
        let mut s = state();

        let err = chain.run_turn(&mut s, "hey").await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)), "got {err:?}");
        assert!(s
            .queue()
            .entries()
            .iter()
            .any(|e| e.role() == Role::System && e.content().contains("Timed out")));
    }

    #[tokio::test]
    async fn test_read_only_searches_recorded_in_call_order() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok(r#"[{"tool": "conversation_search", "args": {"query": "zebra"}}, {"tool": "archival_memory_search", "args": {"query": "zebra"}}]"#.into()),
            Ok(r#"{"tool": "send_message", "args": {"content": "done"}}"#.into()),
        ]));
        let planner = Planner::new(mock);
        let exec = executor();
        let recovery = RecoveryEngine::new();
        let chain = FunctionChainLoop::new(&planner, &exec, &recovery, "sys");
        let mut s = state();

        chain.run_turn(&mut s, "find zebra").await.unwrap();
        let results: Vec<String> = s
            .queue()
            .entries()
            .iter()
            .filter(|e| e.role() == Role::FunctionResult)
            .map(|e| e.content().lines().next().unwrap_or("").to_string())
            .collect();
        assert_eq!(
            results,
            vec![
                "Function: conversation_search".to_string(),
                "Function: archival_memory_search".to_string()
            ]
        );
    }
}
