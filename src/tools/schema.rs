//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将「合法 tool call」的 JSON 结构与每个工具的参数 Schema 注入 system prompt，减少模型输出格式错误。

use schemars::schema::RootSchema;
use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

use crate::tools::call::{
    ArchivalMemoryInsertArgs, CoreMemoryAppendArgs, CoreMemoryReplaceArgs, SearchArgs,
    SendMessageArgs, ARCHIVAL_MEMORY_INSERT, ARCHIVAL_MEMORY_SEARCH, CONVERSATION_SEARCH,
    CORE_MEMORY_APPEND, CORE_MEMORY_REPLACE, SEND_MESSAGE,
};

/// 工具调用请求格式：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 send_message、core_memory_append
    pub tool: String,
    /// 工具参数，依工具不同而不同
    pub args: HashMap<String, serde_json::Value>,
}

pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: RootSchema,
}

pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: SEND_MESSAGE,
            description: "Sends a message to the user. This yields control back to the user.",
            schema: schema_for!(SendMessageArgs),
        },
        ToolSpec {
            name: CORE_MEMORY_APPEND,
            description: "Append content to a section of core memory. Use this to save important information you must always see.",
            schema: schema_for!(CoreMemoryAppendArgs),
        },
        ToolSpec {
            name: CORE_MEMORY_REPLACE,
            description: "Replace the exact old_content in a core memory section with new_content. Use this to update outdated information.",
            schema: schema_for!(CoreMemoryReplaceArgs),
        },
        ToolSpec {
            name: ARCHIVAL_MEMORY_INSERT,
            description: "Insert content into archival memory for later semantic search.",
            schema: schema_for!(ArchivalMemoryInsertArgs),
        },
        ToolSpec {
            name: ARCHIVAL_MEMORY_SEARCH,
            description: "Search archival memory by similarity, including summaries of evicted conversation. Paginated.",
            schema: schema_for!(SearchArgs),
        },
        ToolSpec {
            name: CONVERSATION_SEARCH,
            description: "Search the full conversation history (recall memory) by text, newest first. Paginated.",
            schema: schema_for!(SearchArgs),
        },
    ]
}

/// 返回工具调用外层格式的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 拼入 system prompt 的工具说明段
pub fn tools_prompt_section() -> String {
    let mut out = String::from("## Tools\n");
    out.push_str(
        "Call tools by replying with JSON only: {\"tool\": \"<name>\", \"args\": {...}}. \
         To call several tools at once reply with a JSON array of such objects. \
         Reply with send_message to talk to the user; any other reply continues your turn.\n\n",
    );
    out.push_str("Call format schema:\n");
    out.push_str(&tool_call_schema_json());
    out.push_str("\n\n");
    for spec in tool_specs() {
        let args = serde_json::to_string(&spec.schema.schema).unwrap_or_default();
        out.push_str(&format!("- {}: {}\n  args: {}\n", spec.name, spec.description, args));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_tool_has_a_schema() {
        let specs = tool_specs();
        assert_eq!(specs.len(), 6);
        let replace = specs.iter().find(|s| s.name == CORE_MEMORY_REPLACE).unwrap();
        let json = serde_json::to_string(&replace.schema).unwrap();
        assert!(json.contains("old_content"));
    }

    #[test]
    fn test_prompt_section_lists_tools() {
        let section = tools_prompt_section();
        for spec in tool_specs() {
            assert!(section.contains(spec.name));
        }
        assert!(section.contains("\"tool\""));
    }
}
