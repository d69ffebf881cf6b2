//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MEMPAGER__*` 覆盖（双下划线表示嵌套，如 `MEMPAGER__MEMORY__MAX_TOKENS=4096`）。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{AgentError, RetryConfig};
use crate::memory::{default_sections, QueueConfig, SectionSpec, TokenCounter};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default, rename = "loop")]
    pub chain: LoopSection,
    #[serde(default)]
    pub storage: StorageSection,
}

/// [app] 段：应用名、会话 id、数据目录、快照
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 固定会话 id；未设置时每次启动生成新的 UUID
    pub session_id: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 会话快照文件；设置后启动时加载、退出时保存
    pub snapshot_path: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            session_id: None,
            data_dir: default_data_dir(),
            snapshot_path: None,
        }
    }
}

/// [llm] 段：后端选择、超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
    /// 生成调用最大尝试次数（含首次）
    #[serde(default = "default_llm_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_llm_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 摘要方式：llm（递归摘要）/ concat（不调用模型）
    #[serde(default = "default_summarizer")]
    pub summarizer: String,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_llm_attempts() -> u32 {
    3
}

fn default_llm_backoff_ms() -> u64 {
    500
}

fn default_summarizer() -> String {
    "llm".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmDeepSeekSection::default(),
            openai: LlmOpenAiSection::default(),
            timeouts: LlmTimeoutsSection::default(),
            max_attempts: default_llm_attempts(),
            retry_backoff_ms: default_llm_backoff_ms(),
            summarizer: default_summarizer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

/// [llm.timeouts] 段（秒）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    #[serde(default = "default_summarize_timeout")]
    pub summarize: u64,
}

fn default_request_timeout() -> u64 {
    60
}

fn default_summarize_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            summarize: default_summarize_timeout(),
        }
    }
}

/// [memory] 段：窗口大小、压力阈值、token 估算参数、核心记忆段
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: f64,
    #[serde(default = "default_evict_threshold")]
    pub evict_threshold: f64,
    #[serde(default = "default_per_entry_overhead")]
    pub per_entry_overhead: usize,
    #[serde(default = "default_empty_text_cost")]
    pub empty_text_cost: usize,
    /// 无模型摘要时每次驱逐保留的转录字符数
    #[serde(default = "default_concat_excerpt_chars")]
    pub concat_excerpt_chars: usize,
    #[serde(default = "default_sections")]
    pub sections: Vec<SectionSpec>,
}

fn default_max_tokens() -> usize {
    8192
}

fn default_warn_threshold() -> f64 {
    0.70
}

fn default_evict_threshold() -> f64 {
    0.95
}

fn default_per_entry_overhead() -> usize {
    4
}

fn default_empty_text_cost() -> usize {
    1
}

fn default_concat_excerpt_chars() -> usize {
    500
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            warn_threshold: default_warn_threshold(),
            evict_threshold: default_evict_threshold(),
            per_entry_overhead: default_per_entry_overhead(),
            empty_text_cost: default_empty_text_cost(),
            concat_excerpt_chars: default_concat_excerpt_chars(),
            sections: default_sections(),
        }
    }
}

/// [loop] 段：每轮最多调用生成服务的次数、单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct LoopSection {
    #[serde(default = "default_iteration_cap")]
    pub iteration_cap: usize,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_iteration_cap() -> usize {
    10
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            iteration_cap: default_iteration_cap(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

/// [storage] 段：归档 / 索引后端、分页、持久化重试
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// sqlite / memory
    #[serde(default = "default_backend")]
    pub backend: String,
    /// 未设置时为 `<data_dir>/mempager.db`
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,
    #[serde(default = "default_persist_timeout_secs")]
    pub persist_timeout_secs: u64,
    /// 设置后索引按嵌入相似度检索（需要 OPENAI_API_KEY），否则按关键词
    pub embedding_model: Option<String>,
    pub embedding_base_url: Option<String>,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_page_size() -> usize {
    5
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_persist_backoff_ms() -> u64 {
    200
}

fn default_persist_timeout_secs() -> u64 {
    10
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_path: None,
            page_size: default_page_size(),
            persist_attempts: default_persist_attempts(),
            persist_backoff_ms: default_persist_backoff_ms(),
            persist_timeout_secs: default_persist_timeout_secs(),
            embedding_model: None,
            embedding_base_url: None,
        }
    }
}

impl AppConfig {
    /// 校验相互依赖的取值；加载后、构建会话前调用
    pub fn validate(&self) -> Result<(), AgentError> {
        self.queue_config()?;

        let m = &self.memory;
        if m.per_entry_overhead == 0 {
            return Err(AgentError::Config(
                "memory.per_entry_overhead must be > 0".to_string(),
            ));
        }
        if m.sections.is_empty() {
            return Err(AgentError::Config("memory.sections must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for s in &m.sections {
            if !seen.insert(s.name.as_str()) {
                return Err(AgentError::Config(format!("duplicate core memory section '{}'", s.name)));
            }
            if s.cap_chars == 0 || s.default_content.chars().count() > s.cap_chars {
                return Err(AgentError::Config(format!(
                    "section '{}': cap must be > 0 and hold its default content",
                    s.name
                )));
            }
        }

        if self.chain.iteration_cap == 0 {
            return Err(AgentError::Config("loop.iteration_cap must be > 0".to_string()));
        }
        if self.storage.page_size == 0 {
            return Err(AgentError::Config("storage.page_size must be > 0".to_string()));
        }
        if !matches!(self.storage.backend.as_str(), "sqlite" | "memory") {
            return Err(AgentError::Config(format!(
                "storage.backend must be sqlite or memory, got '{}'",
                self.storage.backend
            )));
        }
        if !matches!(self.llm.summarizer.as_str(), "llm" | "concat") {
            return Err(AgentError::Config(format!(
                "llm.summarizer must be llm or concat, got '{}'",
                self.llm.summarizer
            )));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> Result<QueueConfig, AgentError> {
        QueueConfig::new(
            self.memory.max_tokens,
            self.memory.warn_threshold,
            self.memory.evict_threshold,
        )
    }

    pub fn token_counter(&self) -> TokenCounter {
        TokenCounter::new(self.memory.per_entry_overhead, self.memory.empty_text_cost)
    }

    pub fn persist_retry(&self) -> RetryConfig {
        RetryConfig::new(
            self.storage.persist_attempts,
            Duration::from_millis(self.storage.persist_backoff_ms),
            Duration::from_secs(self.storage.persist_timeout_secs),
        )
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage
            .db_path
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("mempager.db"))
    }

    pub fn session_id(&self) -> String {
        self.app
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

/// 从 config 目录加载配置，环境变量 MEMPAGER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MEMPAGER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MEMPAGER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.chain.iteration_cap, 10);
        assert_eq!(cfg.memory.sections.len(), 2);
        assert_eq!(cfg.storage.page_size, 5);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut cfg = AppConfig::default();
        cfg.memory.warn_threshold = 0.96;
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_overhead() {
        let mut cfg = AppConfig::default();
        cfg.memory.per_entry_overhead = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let mut cfg = AppConfig::default();
        cfg.storage.backend = "redis".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[memory]\nmax_tokens = 100\n\n[loop]\niteration_cap = 4\n\n[[memory.sections]]\nname = \"notes\"\ncap_chars = 50\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.memory.max_tokens, 100);
        assert_eq!(cfg.chain.iteration_cap, 4);
        assert_eq!(cfg.memory.sections[0].name, "notes");
        assert!(cfg.validate().is_ok());
    }
}
