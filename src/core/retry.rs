//! 有界重试模块
//!
//! 按失败类别区分退避策略：限流走长指数退避，服务端错误走
//! 短线性退避，校验错误一律不重试。所有重试都有明确的次数上限。

use crate::core::error::{FailureClass, GatewayError};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

/// 单类错误的退避配置
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避因子，1.0 即线性
    pub backoff_factor: f64,
    /// 是否添加抖动
    pub jitter: bool,
}

impl BackoffConfig {
    /// 限流错误：慢速指数退避
    pub fn rate_limit_default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 2000,
            max_delay_ms: 60000,
            backoff_factor: 3.0,
            jitter: false,
        }
    }

    /// 服务端/网络瞬时错误：快一些，接近线性
    pub fn transient_default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_factor: 1.5,
            jitter: true,
        }
    }

    /// 计算第 attempt 次（从0开始）重试前的延迟
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let mut delay_ms = base.min(self.max_delay_ms as f64) as u64;

        if self.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0..=delay_ms.max(4) / 4);
            delay_ms += jitter;
        }

        Duration::from_millis(delay_ms)
    }
}

/// 重试策略集合，按失败类别路由
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicies {
    #[serde(default = "BackoffConfig::rate_limit_default")]
    pub rate_limit: BackoffConfig,
    #[serde(default = "BackoffConfig::transient_default")]
    pub transient: BackoffConfig,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            rate_limit: BackoffConfig::rate_limit_default(),
            transient: BackoffConfig::transient_default(),
        }
    }
}

/// 重试执行的显式结果
#[derive(Debug)]
pub enum RetryOutcome<T> {
    /// 成功（可能经过若干次重试）
    Success(T),
    /// 可重试错误在用尽次数后仍失败
    Exhausted(GatewayError),
    /// 不可重试错误，立即向上抛出
    NonRetryable(GatewayError),
}

impl<T> RetryOutcome<T> {
    /// 压平为普通 Result，错误语义由 error.class() 保留
    pub fn into_result(self) -> Result<T, GatewayError> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted(e) | RetryOutcome::NonRetryable(e) => Err(e),
        }
    }
}

impl RetryPolicies {
    fn config_for(&self, class: FailureClass) -> Option<&BackoffConfig> {
        match class {
            FailureClass::RateLimit => Some(&self.rate_limit),
            FailureClass::Transient => Some(&self.transient),
            _ => None,
        }
    }

    /// 执行带有界重试的异步操作
    pub async fn execute<F, T, Fut>(&self, label: &str, operation: F) -> RetryOutcome<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        log::info!("✅ {} 在第{}次尝试后成功", label, attempt + 1);
                    }
                    return RetryOutcome::Success(value);
                }
                Err(error) => {
                    let class = error.class();
                    let config = match self.config_for(class) {
                        Some(c) => c,
                        None => {
                            log::warn!("{} 失败且不可重试: {}", label, error);
                            return RetryOutcome::NonRetryable(error);
                        }
                    };

                    if attempt >= config.max_retries {
                        log::error!(
                            "❌ {} 重试{}次后仍失败: {}",
                            label,
                            config.max_retries,
                            error
                        );
                        return RetryOutcome::Exhausted(error);
                    }

                    // 限流时网关明确给出的等待时间优先于本地退避
                    let delay = if class == FailureClass::RateLimit {
                        error
                            .retry_after()
                            .map(Duration::from_secs)
                            .unwrap_or_default()
                            .max(config.delay_for(attempt))
                    } else {
                        config.delay_for(attempt)
                    };

                    log::warn!(
                        "⚠️ {} 失败，{:.1}秒后重试 (尝试 {}/{}): {}",
                        label,
                        delay.as_secs_f64(),
                        attempt + 1,
                        config.max_retries,
                        error
                    );

                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_validation_error_not_retried() {
        let policies = RetryPolicies::default();
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = policies
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GatewayError::ValidationError {
                        field: "size".to_string(),
                        reason: "必须大于0".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::NonRetryable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_exhausted() {
        let mut policies = RetryPolicies::default();
        policies.transient = BackoffConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_factor: 1.0,
            jitter: false,
        };
        let calls = AtomicU32::new(0);

        let outcome: RetryOutcome<()> = policies
            .execute("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(GatewayError::ServerError {
                        code: 503,
                        message: "unavailable".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted(_)));
        // 首次尝试 + 2次重试
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let mut policies = RetryPolicies::default();
        policies.transient.initial_delay_ms = 1;
        policies.transient.jitter = false;
        let calls = AtomicU32::new(0);

        let outcome = policies
            .execute("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(GatewayError::ServerError {
                            code: 500,
                            message: "oops".to_string(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        match outcome {
            RetryOutcome::Success(v) => assert_eq!(v, 42),
            other => panic!("预期成功，实际 {:?}", other),
        }
    }
}
