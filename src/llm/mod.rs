//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock），嵌入，按配置选择后端

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::RetryConfig;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, DEEPSEEK_CHAT};
pub use traits::{LlmClient, LlmError, RetryingLlmClient};

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock），并套上超时与重试
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    let base: Arc<dyn LlmClient> = if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        Arc::new(MockLlmClient::new())
    } else if has_deepseek_key || (provider == "deepseek" && has_openai_key) {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(OpenAiClient::deepseek(Some(&model)))
    } else if has_openai_key {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), &model, None))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient::new())
    };

    Arc::new(RetryingLlmClient::new(
        base,
        RetryConfig::new(
            cfg.llm.max_attempts,
            Duration::from_millis(cfg.llm.retry_backoff_ms),
            Duration::from_secs(cfg.llm.timeouts.request),
        ),
    ))
}
