//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::complete；
//! RetryingLlmClient 在调用点为任意后端加上超时与有界重试。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{retry, RetryConfig, Retryable};
use crate::memory::Message;

/// 生成服务错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    /// 输出中的 tool call 语法无法解析；由函数链循环写回，不视为崩溃
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Generation timed out")]
    Timeout,
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ServiceUnavailable(_) | LlmError::RateLimited { .. } | LlmError::Timeout
        )
    }

    fn timed_out(_label: &str) -> Self {
        LlmError::Timeout
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 为内部客户端加上超时与重试（ServiceUnavailable / RateLimited / Timeout 可重试）
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let inner = &self.inner;
        retry(&self.config, "llm.complete", move || inner.complete(messages)).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use std::time::Duration;

    #[tokio::test]
    async fn test_retrying_client_recovers_from_unavailable() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Err(LlmError::ServiceUnavailable("503".into())),
            Ok("hello".to_string()),
        ]));
        let client = RetryingLlmClient::new(
            mock.clone(),
            RetryConfig::new(3, Duration::from_millis(1), Duration::from_secs(1)),
        );
        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "hello");
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_retrying_client_does_not_retry_invalid_response() {
        let mock = Arc::new(MockLlmClient::scripted(vec![Err(LlmError::InvalidResponse(
            "{".into(),
        ))]));
        let client = RetryingLlmClient::new(
            mock.clone(),
            RetryConfig::new(3, Duration::from_millis(1), Duration::from_secs(1)),
        );
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
        assert_eq!(mock.calls(), 1);
    }
}
