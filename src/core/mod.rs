//! 核心层：错误分类与恢复、有界重试、会话聚合状态

pub mod error;
pub mod recovery;
pub mod retry;
pub mod session;

pub use error::{AgentError, RecoveryAction, StorageError};
pub use recovery::RecoveryEngine;
pub use retry::{retry, RetryConfig, Retryable};
pub use session::{LlmTokenUsage, MemoryDump, SessionState, SessionStatus, StoreHandles};
