//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 默认取最后一条 User 消息，回显为 send_message 工具调用，便于本地跑通函数链循环；
//! scripted 模式按顺序返回预设输出，用完后回到回显行为。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息，或按脚本返回
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    /// 始终返回同一输出（优先于 script）
    fixed: Option<String>,
    calls: AtomicUsize,
    last_context: Mutex<Vec<Message>>,
    /// 按 4 字符/token 粗略累计
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(outputs: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(outputs.into()),
            ..Self::default()
        }
    }

    /// 每次调用都返回同一段文本
    pub fn always(output: impl Into<String>) -> Self {
        Self {
            fixed: Some(output.into()),
            ..Self::default()
        }
    }

    /// 已被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 最近一次调用收到的完整上下文
    pub fn last_context(&self) -> Vec<Message> {
        self.last_context
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn echo(messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        serde_json::json!({
            "tool": "send_message",
            "args": { "content": format!("Echo from Mock: {}", last_user) }
        })
        .to_string()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_context.lock() {
            *last = messages.to_vec();
        }
        let prompt: usize = messages.iter().map(|m| m.content.len()).sum();
        self.prompt_tokens
            .fetch_add(prompt.div_ceil(4) as u64, Ordering::SeqCst);
        let output = match self.fixed {
            Some(ref fixed) => Ok(fixed.clone()),
            None => {
                let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
                scripted.unwrap_or_else(|| Ok(Self::echo(messages)))
            }
        };
        if let Ok(ref text) = output {
            self.completion_tokens
                .fetch_add(text.len().div_ceil(4) as u64, Ordering::SeqCst);
        }
        output
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        let prompt = self.prompt_tokens.load(Ordering::SeqCst);
        let completion = self.completion_tokens.load(Ordering::SeqCst);
        (prompt, completion, prompt + completion)
    }
}
