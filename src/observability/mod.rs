//! 可观测性：tracing 订阅器初始化（RUST_LOG 覆盖默认的 info）

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 日志写到 stderr，不与 REPL 的 stdout 输出混在一起
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
