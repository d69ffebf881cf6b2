//! 智能体可调用的记忆工具：类型化调用、参数 schema 与执行器

pub mod call;
pub mod executor;
pub mod schema;

pub use call::ToolCall;
pub use executor::{FunctionResult, ToolExecutor, ToolOutput};
pub use schema::{tool_call_schema_json, tool_specs, tools_prompt_section, ToolSpec};
