//! Planner：调用生成服务并把输出解析为类型化的工具调用
//!
//! 输出可以是 ```json 代码块、单个 `{"tool": ..., "args": ...}` 对象或它们的数组；
//! 没有 JSON 时视为内心独白（不含工具调用），JSON 损坏时返回 LlmError::InvalidResponse。

use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::tools::ToolCall;

/// 一次生成的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Deserialize)]
struct RawToolCall {
    tool: String,
    #[serde(default)]
    args: serde_json::Value,
}

const RAW_PREVIEW_CHARS: usize = 200;

fn invalid(reason: impl std::fmt::Display, raw: &str) -> LlmError {
    let preview: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
    LlmError::InvalidResponse(format!("{reason} in `{preview}`"))
}

/// 定位输出中的 JSON：```json 代码块优先；以 `[` 开头的整段视为数组；否则取第一个 `{` 到最后一个 `}`
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if trimmed.starts_with('[') {
        return Some(trimmed.rfind(']').map(|end| &trimmed[..=end]).unwrap_or(trimmed));
    }
    let start = trimmed.find('{')?;
    Some(trimmed.rfind('}').map(|end| &trimmed[start..=end]).unwrap_or(&trimmed[start..]))
}

pub fn parse_generation(output: &str) -> Result<Generation, LlmError> {
    let trimmed = output.trim();
    let text = trimmed.to_string();

    let Some(json_str) = extract_json(trimmed) else {
        return Ok(Generation {
            text,
            tool_calls: Vec::new(),
        });
    };

    let value: serde_json::Value =
        serde_json::from_str(json_str).map_err(|e| invalid(e, json_str))?;
    let raw_calls: Vec<RawToolCall> = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()
            .map_err(|e| invalid(e, json_str))?,
        obj @ serde_json::Value::Object(_) => {
            vec![serde_json::from_value(obj).map_err(|e| invalid(e, json_str))?]
        }
        _ => return Err(invalid("expected a tool call object or array", json_str)),
    };

    Ok(Generation {
        text,
        tool_calls: raw_calls
            .into_iter()
            .map(|c| ToolCall::from_raw(&c.tool, c.args))
            .collect(),
    })
}

/// Planner：持有生成服务，把完整上下文交给它并解析输出
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn generate(&self, context: &[Message]) -> Result<Generation, LlmError> {
        let output = self.llm.complete(context).await?;
        parse_generation(&output)
    }
}
