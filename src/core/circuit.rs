//! 熔断与全局请求节流模块
//!
//! 熔断器按接口族（行情/账户/订单）统计跨交易对的连续失败次数，
//! 达到阈值后进入冷却期，冷却期内同族调用直接短路，避免继续
//! 压垮已经过载的远端服务。

use crate::core::error::GatewayError;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// 网关接口族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointFamily {
    MarketData,
    Account,
    Orders,
}

impl EndpointFamily {
    pub fn name(&self) -> &'static str {
        match self {
            EndpointFamily::MarketData => "market_data",
            EndpointFamily::Account => "account",
            EndpointFamily::Orders => "orders",
        }
    }
}

/// 熔断配置
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitConfig {
    /// 连续失败多少次后熔断
    pub failure_threshold: u32,
    /// 熔断后的冷却时长（秒）
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

#[derive(Debug)]
struct FamilyState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// 按接口族熔断的熔断器
pub struct CircuitBreaker {
    config: CircuitConfig,
    families: Mutex<HashMap<EndpointFamily, FamilyState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            families: Mutex::new(HashMap::new()),
        }
    }

    /// 调用前检查；熔断中返回 CircuitOpen
    pub async fn check(&self, family: EndpointFamily) -> Result<(), GatewayError> {
        let mut families = self.families.lock().await;
        let state = families.entry(family).or_insert(FamilyState {
            consecutive_failures: 0,
            open_until: None,
        });

        if let Some(until) = state.open_until {
            let now = Instant::now();
            if now < until {
                let remaining = (until - now).as_secs().max(1);
                return Err(GatewayError::CircuitOpen {
                    family: family.name().to_string(),
                    cooldown_secs: remaining,
                });
            }
            // 冷却结束，半开：放行一次探测，失败会立刻再次熔断
            state.open_until = None;
            state.consecutive_failures = self.config.failure_threshold.saturating_sub(1);
            log::info!("熔断器半开，放行 {} 探测请求", family.name());
        }

        Ok(())
    }

    /// 报告一次成功，清零该族计数
    pub async fn record_success(&self, family: EndpointFamily) {
        let mut families = self.families.lock().await;
        if let Some(state) = families.get_mut(&family) {
            state.consecutive_failures = 0;
            state.open_until = None;
        }
    }

    /// 报告一次失败，达到阈值则熔断
    pub async fn record_failure(&self, family: EndpointFamily) {
        let mut families = self.families.lock().await;
        let state = families.entry(family).or_insert(FamilyState {
            consecutive_failures: 0,
            open_until: None,
        });

        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold {
            state.open_until =
                Some(Instant::now() + Duration::from_secs(self.config.cooldown_secs));
            log::error!(
                "🚨 {} 连续失败{}次，熔断{}秒",
                family.name(),
                state.consecutive_failures,
                self.config.cooldown_secs
            );
        }
    }
}

/// 全局调用间隔节流器
///
/// 跨所有交易对共享一个最小调用间隔；被限流后间隔自适应放大，
/// 平稳一段时间后逐步恢复。
pub struct CallPacer {
    base_spacing: Duration,
    inner: Mutex<PacerState>,
}

struct PacerState {
    last_call: Option<Instant>,
    current_spacing: Duration,
    last_penalty: Option<Instant>,
}

impl CallPacer {
    pub fn new(min_spacing_ms: u64) -> Self {
        let base = Duration::from_millis(min_spacing_ms);
        Self {
            base_spacing: base,
            inner: Mutex::new(PacerState {
                last_call: None,
                current_spacing: base,
                last_penalty: None,
            }),
        }
    }

    /// 等待直到满足最小调用间隔
    pub async fn acquire(&self) {
        let wait = {
            let mut state = self.inner.lock().await;
            self.maybe_recover(&mut state);

            let now = Instant::now();
            let wait = match state.last_call {
                Some(last) => {
                    let elapsed = now.duration_since(last);
                    state.current_spacing.saturating_sub(elapsed)
                }
                None => Duration::ZERO,
            };
            state.last_call = Some(now + wait);
            wait
        };

        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// 被限流后调用：间隔翻倍（有上限）
    pub async fn report_rate_limited(&self) {
        let mut state = self.inner.lock().await;
        let doubled = state.current_spacing * 2;
        let cap = self.base_spacing * 8;
        state.current_spacing = doubled.min(cap.max(Duration::from_secs(10)));
        state.last_penalty = Some(Instant::now());
        log::warn!(
            "⚠️ 触发限流，全局调用间隔放大到 {}ms",
            state.current_spacing.as_millis()
        );
    }

    /// 30秒无惩罚则逐步恢复基础间隔
    fn maybe_recover(&self, state: &mut PacerState) {
        if state.current_spacing <= self.base_spacing {
            return;
        }
        if let Some(penalty) = state.last_penalty {
            if penalty.elapsed() > Duration::from_secs(30) {
                state.current_spacing =
                    (state.current_spacing / 2).max(self.base_spacing);
                state.last_penalty = Some(Instant::now());
                if state.current_spacing == self.base_spacing {
                    log::info!("全局调用间隔已恢复 {}ms", self.base_spacing.as_millis());
                }
            }
        }
    }
}
