//! 有界重试探测
//!
//! 扩展注入与页面脚本异步进行，单次检查会系统性漏掉晚注入的钱包。
//! 这里把“轮询 + 指数退避 + 总时长上限”收敛为一个函数，由调用方传入探测谓词。

use std::time::Duration;

use tokio::time::Instant;

use crate::config::DetectionConfig;

/// 探测策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    /// 总等待上限
    pub budget: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            budget: Duration::from_millis(1500),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
        }
    }
}

impl From<&DetectionConfig> for ProbePolicy {
    fn from(config: &DetectionConfig) -> Self {
        Self {
            budget: config.budget(),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// 单次探测的结论
#[derive(Debug)]
pub enum ProbeStep<T> {
    /// 已满足，立即返回
    Done(T),
    /// 尚未满足；预算耗尽时返回携带的部分结果
    Partial(T),
}

/// 反复执行 `attempt` 直到返回 `Done` 或预算耗尽
///
/// 第一次探测立即执行；之后每次等待的退避时间翻倍，且不会越过预算截止时间
pub async fn poll_with_backoff<T, F>(policy: ProbePolicy, mut attempt: F) -> T
where
    F: FnMut(u32) -> ProbeStep<T>,
{
    let deadline = Instant::now() + policy.budget;
    let mut backoff = policy.initial_backoff;
    let mut round = 0u32;

    loop {
        let partial = match attempt(round) {
            ProbeStep::Done(value) => return value,
            ProbeStep::Partial(value) => value,
        };

        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(rounds = round + 1, "probe budget exhausted");
            return partial;
        }

        let wait = backoff.min(deadline - now);
        tokio::time::sleep(wait).await;
        backoff = (backoff * 2).min(policy.max_backoff);
        round += 1;
    }
}
