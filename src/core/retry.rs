//! 有界重试 + 单次调用超时
//!
//! 生成服务与存储调用共用：每次尝试套一层 tokio 超时，可重试错误按线性退避重试，
//! 超过 max_attempts 后返回最后一次错误。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次），至少为 1
    pub max_attempts: u32,
    /// 第 n 次失败后等待 backoff * n
    pub backoff: Duration,
    /// 单次尝试超时
    pub timeout: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, backoff: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            timeout,
        }
    }

    /// 不重试，仅保留超时
    pub fn once(timeout: Duration) -> Self {
        Self::new(1, Duration::ZERO, timeout)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_secs(10))
    }
}

/// 可参与重试判定的错误类型
pub trait Retryable: Display {
    fn is_retryable(&self) -> bool;

    /// 单次尝试超时时构造的错误
    fn timed_out(label: &str) -> Self;
}

/// 执行 op，失败时按策略重试；不可重试的错误立即返回
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, label: &str, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match timeout(config.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => E::timed_out(label),
        };

        if !err.is_retryable() || attempt >= config.max_attempts {
            if attempt > 1 {
                tracing::warn!(op = label, attempt, error = %err, "retries exhausted");
            }
            return Err(err);
        }

        tracing::warn!(op = label, attempt, error = %err, "call failed, retrying");
        sleep(config.backoff * attempt).await;
    }
}

impl Retryable for crate::core::StorageError {
    fn is_retryable(&self) -> bool {
        !matches!(self, crate::core::StorageError::Corrupt(_))
    }

    fn timed_out(label: &str) -> Self {
        crate::core::StorageError::Timeout(label.to_string())
    }
}
