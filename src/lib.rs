//! Mempager - 分页上下文智能体
//!
//! 有限的上下文窗口之外，旧对话被摘要并写入归档 / 索引存储，智能体通过工具调用自行检索与维护记忆。
//!
//! 模块划分：
//! - **agent**: Agent 运行时（按配置组装各组件，chat / status / reset / evict / 快照）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、有界重试、会话状态
//! - **llm**: 生成服务抽象与实现（OpenAI 兼容 / DeepSeek / Mock）、嵌入
//! - **memory**: 窗口与记忆压力控制、核心记忆、归档 / 索引存储、摘要、快照
//! - **observability**: 日志初始化
//! - **react**: Planner、函数链主循环、过程事件
//! - **tools**: 记忆工具的类型化调用、schema 与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use agent::Agent;
