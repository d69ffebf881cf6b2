//! 工具执行器
//!
//! 对每次调用施加超时，存储调用按 RetryConfig 重试；失败时返回 AgentError，由函数链循环交给 RecoveryEngine。
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::time::timeout;

use crate::core::{retry, AgentError, RetryConfig, SessionState, StoreHandles};
use crate::tools::call::{SearchArgs, ToolCall};

/// 工具成功时的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub message: String,
    pub output: serde_json::Value,
}

/// 写回窗口的 function-result 条目内容
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResult {
    pub name: String,
    pub ok: bool,
    pub message: String,
    pub output: Option<serde_json::Value>,
}

impl FunctionResult {
    pub fn success(name: impl Into<String>, out: ToolOutput) -> Self {
        Self {
            name: name.into(),
            ok: true,
            message: out.message,
            output: Some(out.output),
        }
    }

    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ok: false,
            message: message.into(),
            output: None,
        }
    }

    /// "Function: x\nStatus: success\nMessage: ...\nOutput: {...}"
    pub fn render(&self) -> String {
        let status = if self.ok { "success" } else { "error" };
        let mut out = format!(
            "Function: {}\nStatus: {}\nMessage: {}",
            self.name, status, self.message
        );
        if let Some(ref output) = self.output {
            let pretty = serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
            out.push_str(&format!("\nOutput: {pretty}"));
        }
        out
    }
}

pub struct ToolExecutor {
    timeout: Duration,
    store_retry: RetryConfig,
}

impl ToolExecutor {
    pub fn new(timeout: Duration, store_retry: RetryConfig) -> Self {
        Self {
            timeout,
            store_retry,
        }
    }

    /// 执行任意工具（可修改核心记忆）；超时返回 AgentError::Timeout
    pub async fn execute(
        &self,
        state: &mut SessionState,
        call: &ToolCall,
    ) -> Result<ToolOutput, AgentError> {
        let start = Instant::now();
        let result = match timeout(self.timeout, self.run(state, call)).await {
            Ok(r) => r,
            Err(_) => Err(AgentError::Timeout(format!("tool {}", call.name()))),
        };
        audit(call, &result, start);
        result
    }

    /// 只读检索，不需要会话锁；供同一次生成中的多个检索并发执行
    pub async fn execute_read_only(
        &self,
        stores: &StoreHandles,
        call: &ToolCall,
    ) -> Result<ToolOutput, AgentError> {
        let start = Instant::now();
        let result = match timeout(self.timeout, self.search(stores, call)).await {
            Ok(r) => r,
            Err(_) => Err(AgentError::Timeout(format!("tool {}", call.name()))),
        };
        audit(call, &result, start);
        result
    }

    async fn run(&self, state: &mut SessionState, call: &ToolCall) -> Result<ToolOutput, AgentError> {
        match call {
            ToolCall::SendMessage(args) => Ok(ToolOutput {
                message: "Message sent to user".to_string(),
                output: json!({ "status": "message_sent", "content": args.content }),
            }),
            ToolCall::CoreMemoryAppend(args) => {
                state.core_memory_mut().append(&args.section, &args.content)?;
                Ok(ToolOutput {
                    message: format!("Appended to {}", args.section),
                    output: json!({ "section": args.section }),
                })
            }
            ToolCall::CoreMemoryReplace(args) => {
                state
                    .core_memory_mut()
                    .replace(&args.section, &args.old_content, &args.new_content)?;
                Ok(ToolOutput {
                    message: format!("Replaced content in {}", args.section),
                    output: json!({ "section": args.section }),
                })
            }
            ToolCall::ArchivalMemoryInsert(args) => {
                let index = state.index();
                let session_id = state.session_id().to_string();
                let document_id = format!("insert-{}", uuid::Uuid::new_v4());
                {
                    let index = &index;
                    let (content, sid, doc) = (&args.content, &session_id, &document_id);
                    retry(&self.store_retry, "index.insert", move || index.insert(content, sid, doc))
                        .await?;
                }
                Ok(ToolOutput {
                    message: "Content inserted into archival memory".to_string(),
                    output: json!({ "document_id": document_id }),
                })
            }
            ToolCall::ArchivalMemorySearch(_) | ToolCall::ConversationSearch(_) => {
                self.search(&state.store_handles(), call).await
            }
            ToolCall::Unknown { reason, .. } => Err(AgentError::Validation(reason.clone())),
        }
    }

    async fn search(&self, stores: &StoreHandles, call: &ToolCall) -> Result<ToolOutput, AgentError> {
        match call {
            ToolCall::ArchivalMemorySearch(SearchArgs { query, page }) => {
                let index = &stores.index;
                let hits = retry(&self.store_retry, "index.search", move || {
                    index.search(query, *page)
                })
                .await?;
                let results: Vec<_> = hits
                    .iter()
                    .map(|d| json!({ "content": d.document_text, "similarity": d.score, "range_id": d.range_id }))
                    .collect();
                Ok(search_output(query, *page, results))
            }
            ToolCall::ConversationSearch(SearchArgs { query, page }) => {
                let archive = &stores.archive;
                let session_id = stores.session_id.as_str();
                let hits = retry(&self.store_retry, "archive.search", move || {
                    archive.search(query, Some(session_id), *page)
                })
                .await?;
                let results: Vec<_> = hits
                    .iter()
                    .map(|e| {
                        json!({
                            "role": e.role().as_str(),
                            "content": e.content(),
                            "timestamp": e.timestamp().to_rfc3339(),
                        })
                    })
                    .collect();
                Ok(search_output(query, *page, results))
            }
            other => Err(AgentError::Validation(format!(
                "{} is not a read-only tool",
                other.name()
            ))),
        }
    }
}

fn search_output(query: &str, page: usize, results: Vec<serde_json::Value>) -> ToolOutput {
    ToolOutput {
        message: format!("Found {} result(s) on page {}", results.len(), page),
        output: json!({
            "query": query,
            "page": page,
            "results_count": results.len(),
            "results": results,
        }),
    }
}

fn audit(call: &ToolCall, result: &Result<ToolOutput, AgentError>, start: Instant) {
    let (ok, outcome) = match result {
        Ok(_) => (true, "ok".to_string()),
        Err(AgentError::Timeout(_)) => (false, "timeout".to_string()),
        Err(e) => (false, e.to_string()),
    };
    let audit = json!({
        "event": "tool_audit",
        "tool": call.name(),
        "ok": ok,
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview(&call.args_json()),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
