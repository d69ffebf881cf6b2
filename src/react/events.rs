//! 函数链循环过程事件：供 REPL 等前端展示思考、工具调用、记忆压力与回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// 当前第几次调用生成服务
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用生成服务
    Thinking,
    /// 没有工具调用的输出（内心独白）
    ThinkingContent { text: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 错误恢复动作（FeedBack / Retry / AbortTurn）
    Recovery { action: String, detail: String },
    /// 用量跨过警告阈值，已注入压力提示
    MemoryPressure {
        usage_tokens: usize,
        max_tokens: usize,
    },
    /// 一次驱逐完成
    Eviction {
        evicted: usize,
        tokens_before: usize,
        tokens_after: usize,
        range_id: String,
    },
    /// 最终回复
    MessageChunk { text: String },
    MessageDone,
    Error { text: String },
}
