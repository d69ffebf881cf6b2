//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供函数链循环决定是写回让智能体纠正、重试还是终止本轮。

use crate::core::{AgentError, RecoveryAction};
use crate::llm::LlmError;

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::CorruptResponse(raw) => RecoveryAction::FeedBack(format!(
                "Your last output could not be parsed as a tool call: {raw}. \
                 Reply with a single JSON object {{\"tool\": \"<name>\", \"args\": {{...}}}} \
                 or a JSON array of such objects, and nothing else."
            )),
            AgentError::Validation(msg) => RecoveryAction::FeedBack(format!(
                "{msg}. Check the tool name and arguments against the tool list and try again."
            )),
            AgentError::Capacity(msg) => RecoveryAction::FeedBack(format!(
                "{msg}. Condense the section with core_memory_replace or move details to archival memory."
            )),
            AgentError::TransientIo(msg) | AgentError::Timeout(msg) => {
                RecoveryAction::FeedBack(format!("{msg}. The store may be busy; retry later or continue without it."))
            }
            AgentError::Llm(LlmError::RateLimited { .. })
            | AgentError::Llm(LlmError::ServiceUnavailable(_)) => RecoveryAction::Retry,
            AgentError::Llm(_) | AgentError::Config(_) => RecoveryAction::AbortTurn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_corrupt_response_feeds_back() {
        let engine = RecoveryEngine::new();
        let action = engine.handle(&AgentError::CorruptResponse("{oops".to_string()));
        match action {
            RecoveryAction::FeedBack(msg) => assert!(msg.contains("JSON")),
            _ => panic!("Expected FeedBack"),
        }
    }

    #[test]
    fn test_recovery_capacity_feeds_back() {
        let engine = RecoveryEngine::new();
        let action = engine.handle(&AgentError::Capacity("section 'human' is full".to_string()));
        match action {
            RecoveryAction::FeedBack(msg) => assert!(msg.contains("human")),
            _ => panic!("Expected FeedBack"),
        }
    }

    #[test]
    fn test_recovery_rate_limit_retries() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Llm(LlmError::RateLimited { retry_after_ms: 1000 });
        assert!(matches!(engine.handle(&err), RecoveryAction::Retry));
    }

    #[test]
    fn test_recovery_config_error_aborts_turn() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Config("memory.max_tokens must be > 0".into());
        assert!(matches!(engine.handle(&err), RecoveryAction::AbortTurn));
    }

    #[test]
    fn test_invalid_response_maps_to_corrupt_response() {
        let err: AgentError = LlmError::InvalidResponse("bad".into()).into();
        assert!(matches!(err, AgentError::CorruptResponse(_)));
        assert!(matches!(RecoveryEngine::new().handle(&err), RecoveryAction::FeedBack(_)));
    }
}
