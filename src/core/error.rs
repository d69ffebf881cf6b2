//! 错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定 FeedBack（写回循环让智能体自我纠正）/ Retry / AbortTurn。

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::CoreMemoryError;

/// 会话运行过程中可能出现的错误（校验、容量、存储 I/O、超时、模型输出损坏等）
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    /// 未知 section、工具参数格式错误、未知工具
    #[error("Validation error: {0}")]
    Validation(String),

    /// Core memory section 已满（绝不静默截断）
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// 生成服务或存储调用失败，重试已耗尽
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// 生成服务返回了无法解析的 tool call 语法
    #[error("Corrupt response: {0}")]
    CorruptResponse(String),

    #[error("LLM error: {0}")]
    Llm(LlmError),

    #[error("Config error: {0}")]
    Config(String),
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::InvalidResponse(raw) => AgentError::CorruptResponse(raw),
            LlmError::Timeout => AgentError::Timeout("generation service".to_string()),
            other => AgentError::Llm(other),
        }
    }
}

impl From<CoreMemoryError> for AgentError {
    fn from(e: CoreMemoryError) -> Self {
        match e {
            CoreMemoryError::CapacityExceeded { .. } => AgentError::Capacity(e.to_string()),
            CoreMemoryError::UnknownSection(_) | CoreMemoryError::NotFound { .. } => {
                AgentError::Validation(e.to_string())
            }
        }
    }
}

impl From<StorageError> for AgentError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Timeout(op) => AgentError::Timeout(op),
            other => AgentError::TransientIo(other.to_string()),
        }
    }
}

/// 归档 / 索引存储错误
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage call timed out: {0}")]
    Timeout(String),

    /// 已存数据无法解码（不重试）
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 以 function-result 的形式写回窗口，下一轮由智能体自行纠正
    FeedBack(String),
    /// 在调用点重试
    Retry,
    /// 终止当前轮次（会话保持可用）
    AbortTurn,
}
