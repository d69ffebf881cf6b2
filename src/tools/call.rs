//! 类型化的工具调用
//!
//! 模型输出 `{"tool": "...", "args": {...}}`，由 from_raw 解析为封闭的 ToolCall 枚举；
//! 未知工具或参数不合法时得到 Unknown，执行时作为校验错误写回窗口。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SendMessageArgs {
    /// 发给用户的消息内容
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CoreMemoryAppendArgs {
    /// 核心记忆段名，如 persona、human
    pub section: String,
    /// 追加的内容
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CoreMemoryReplaceArgs {
    /// 核心记忆段名，如 persona、human
    pub section: String,
    /// 要被替换的原文（逐字匹配）
    pub old_content: String,
    /// 新内容
    pub new_content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArchivalMemoryInsertArgs {
    /// 写入索引存储的内容
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// 检索词
    pub query: String,
    /// 页码，从 0 开始
    #[serde(default)]
    pub page: usize,
}

pub const SEND_MESSAGE: &str = "send_message";
pub const CORE_MEMORY_APPEND: &str = "core_memory_append";
pub const CORE_MEMORY_REPLACE: &str = "core_memory_replace";
pub const ARCHIVAL_MEMORY_INSERT: &str = "archival_memory_insert";
pub const ARCHIVAL_MEMORY_SEARCH: &str = "archival_memory_search";
pub const CONVERSATION_SEARCH: &str = "conversation_search";

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    SendMessage(SendMessageArgs),
    CoreMemoryAppend(CoreMemoryAppendArgs),
    CoreMemoryReplace(CoreMemoryReplaceArgs),
    ArchivalMemoryInsert(ArchivalMemoryInsertArgs),
    ArchivalMemorySearch(SearchArgs),
    ConversationSearch(SearchArgs),
    /// 未知工具名或参数无法解析
    Unknown { name: String, reason: String },
}

fn parse_args<T: serde::de::DeserializeOwned>(
    name: &str,
    args: serde_json::Value,
    wrap: fn(T) -> ToolCall,
) -> ToolCall {
    // 无参数时按空对象处理，让缺失字段的报错更明确
    let args = if args.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        args
    };
    match serde_json::from_value::<T>(args) {
        Ok(parsed) => wrap(parsed),
        Err(e) => ToolCall::Unknown {
            name: name.to_string(),
            reason: format!("Invalid arguments for {name}: {e}"),
        },
    }
}

impl ToolCall {
    pub fn from_raw(name: &str, args: serde_json::Value) -> Self {
        match name {
            SEND_MESSAGE => parse_args(name, args, ToolCall::SendMessage),
            CORE_MEMORY_APPEND => parse_args(name, args, ToolCall::CoreMemoryAppend),
            CORE_MEMORY_REPLACE => parse_args(name, args, ToolCall::CoreMemoryReplace),
            ARCHIVAL_MEMORY_INSERT => parse_args(name, args, ToolCall::ArchivalMemoryInsert),
            ARCHIVAL_MEMORY_SEARCH => parse_args(name, args, ToolCall::ArchivalMemorySearch),
            CONVERSATION_SEARCH => parse_args(name, args, ToolCall::ConversationSearch),
            other => ToolCall::Unknown {
                name: other.to_string(),
                reason: format!("Unknown function: {other}"),
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ToolCall::SendMessage(_) => SEND_MESSAGE,
            ToolCall::CoreMemoryAppend(_) => CORE_MEMORY_APPEND,
            ToolCall::CoreMemoryReplace(_) => CORE_MEMORY_REPLACE,
            ToolCall::ArchivalMemoryInsert(_) => ARCHIVAL_MEMORY_INSERT,
            ToolCall::ArchivalMemorySearch(_) => ARCHIVAL_MEMORY_SEARCH,
            ToolCall::ConversationSearch(_) => CONVERSATION_SEARCH,
            ToolCall::Unknown { name, .. } => name,
        }
    }

    /// 只读检索：同一次生成中相邻的检索可以并发执行
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ToolCall::ArchivalMemorySearch(_) | ToolCall::ConversationSearch(_)
        )
    }

    /// send_message 把控制权交还用户，结束本轮；返回给用户的回复
    pub fn terminal_reply(&self) -> Option<&str> {
        match self {
            ToolCall::SendMessage(args) => Some(&args.content),
            _ => None,
        }
    }

    /// 审计日志与事件中展示的参数
    pub fn args_json(&self) -> serde_json::Value {
        let value = match self {
            ToolCall::SendMessage(a) => serde_json::to_value(a),
            ToolCall::CoreMemoryAppend(a) => serde_json::to_value(a),
            ToolCall::CoreMemoryReplace(a) => serde_json::to_value(a),
            ToolCall::ArchivalMemoryInsert(a) => serde_json::to_value(a),
            ToolCall::ArchivalMemorySearch(a) | ToolCall::ConversationSearch(a) => {
                serde_json::to_value(a)
            }
            ToolCall::Unknown { reason, .. } => Ok(serde_json::json!({ "error": reason })),
        };
        value.unwrap_or(serde_json::Value::Null)
    }
}
