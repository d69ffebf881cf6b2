//! 认知层：Planner（生成与解析）、函数链主循环、过程事件

pub mod events;
pub mod loop_;
pub mod planner;

pub use events::ReactEvent;
pub use loop_::{FunctionChainLoop, TurnResult, TurnStatus, DEFAULT_ITERATION_CAP};
pub use planner::{parse_generation, Generation, Planner};
