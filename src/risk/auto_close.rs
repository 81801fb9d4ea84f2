//! 仓位上限自动处置模块
//!
//! 监控 持仓价值 = 占用保证金 × 杠杆 是否超过配置上限，超限时
//! 按配置的策略处置。策略名经由别名表在配置解析阶段一次性解析
//! 成枚举，业务逻辑里不做字符串比较。

use crate::core::gateway::GatewayAdapter;
use crate::core::quantize::quantize_quantity;
use crate::core::sync::SymbolState;
use crate::core::types::{OrderRequest, OrderSide, Position, Result};
use crate::risk::margin_guard::MarginGuard;
use serde::Deserialize;

/// 超限处置策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AutoClosePolicy {
    /// 撤掉远离市价的卖侧挂单
    CancelOrders,
    /// 立即市价卖出持仓的固定比例
    ForceSell,
    /// 只撤买侧挂单，阻止继续加仓但不实现亏损
    StopBuy,
    /// 先撤单，不足部分再强制卖出
    Hybrid,
}

impl AutoClosePolicy {
    /// 别名表：用户侧名称与内部标识允许不一致
    pub fn resolve(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "cancel_orders" | "cancel-orders" | "cancel" | "conservative" => {
                Some(AutoClosePolicy::CancelOrders)
            }
            "force_sell" | "force-sell" | "sell" | "aggressive" => {
                Some(AutoClosePolicy::ForceSell)
            }
            "stop_buy" | "stop-buy" | "halt_buy" | "freeze" => Some(AutoClosePolicy::StopBuy),
            "hybrid" | "mixed" | "smart" => Some(AutoClosePolicy::Hybrid),
            _ => None,
        }
    }
}

impl TryFrom<String> for AutoClosePolicy {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        AutoClosePolicy::resolve(&value)
            .ok_or_else(|| format!("未知的自动处置策略: {}", value))
    }
}

/// 自动处置配置
#[derive(Debug, Clone, Deserialize)]
pub struct AutoCloseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 持仓价值上限（USD）
    #[serde(default = "AutoCloseConfig::default_max_value")]
    pub max_position_value: f64,
    /// 账户使用的杠杆倍数
    #[serde(default = "AutoCloseConfig::default_leverage")]
    pub leverage: f64,
    /// force_sell 策略卖出的持仓比例
    #[serde(default = "AutoCloseConfig::default_close_percentage")]
    pub close_percentage: f64,
    /// 撤单策略只动偏离市价超过该比例的卖侧挂单（%）
    #[serde(default = "AutoCloseConfig::default_distant_pct")]
    pub distant_order_pct: f64,
    #[serde(default = "AutoCloseConfig::default_policy")]
    pub policy: AutoClosePolicy,
}

fn default_true() -> bool {
    true
}

impl AutoCloseConfig {
    fn default_max_value() -> f64 {
        1000.0
    }

    fn default_leverage() -> f64 {
        10.0
    }

    fn default_close_percentage() -> f64 {
        0.3
    }

    fn default_distant_pct() -> f64 {
        2.0
    }

    fn default_policy() -> AutoClosePolicy {
        AutoClosePolicy::Hybrid
    }
}

impl Default for AutoCloseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_position_value: Self::default_max_value(),
            leverage: Self::default_leverage(),
            close_percentage: Self::default_close_percentage(),
            distant_order_pct: Self::default_distant_pct(),
            policy: Self::default_policy(),
        }
    }
}

/// 仓位上限处置器
pub struct AutoCloseLimiter {
    config: AutoCloseConfig,
}

impl AutoCloseLimiter {
    pub fn new(config: AutoCloseConfig) -> Self {
        Self { config }
    }

    pub fn policy(&self) -> AutoClosePolicy {
        self.config.policy
    }

    /// 检查持仓价值并按策略处置，返回是否执行了动作
    pub async fn check_position_size(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        guard: &MarginGuard,
    ) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        let authoritative = gateway.get_positions(&state.symbol).await?;
        let position = match authoritative.into_iter().next() {
            Some(p) => p,
            None => return Ok(false),
        };

        let position_value = position.margin_used * self.config.leverage;
        if position_value <= self.config.max_position_value {
            return Ok(false);
        }

        let excess = position_value - self.config.max_position_value;
        log::warn!(
            "⚠️ {} 持仓价值 {:.2} 超过上限 {:.2}，超额 {:.2}，策略 {:?}",
            state.symbol,
            position_value,
            self.config.max_position_value,
            excess,
            self.config.policy
        );

        let acted = match self.config.policy {
            AutoClosePolicy::CancelOrders => {
                let canceled = self
                    .cancel_distant_sells(gateway, state, f64::INFINITY)
                    .await?;
                canceled > 0.0
            }
            AutoClosePolicy::ForceSell => {
                let qty = position.quantity * self.config.close_percentage;
                self.force_sell(gateway, state, &position, qty, guard).await?
            }
            AutoClosePolicy::StopBuy => self.cancel_buy_orders(gateway, state).await?,
            AutoClosePolicy::Hybrid => {
                // 先撤单回收，不足的部分精确补一笔强卖
                let canceled = self.cancel_distant_sells(gateway, state, excess).await?;
                if canceled >= excess {
                    true
                } else {
                    let residual = excess - canceled;
                    let qty = residual / state.mark_price.max(f64::MIN_POSITIVE);
                    let sold = self
                        .force_sell(gateway, state, &position, qty, guard)
                        .await?;
                    sold || canceled > 0.0
                }
            }
        };

        if acted {
            log::info!(
                "{} 自动处置完成: 处置前持仓价值 {:.2} / 上限 {:.2}",
                state.symbol,
                position_value,
                self.config.max_position_value
            );
        }

        Ok(acted)
    }

    /// 撤掉偏离市价超过阈值的卖侧挂单，返回累计撤掉的名义金额
    ///
    /// `target` 达到即提前停止（纯撤单策略传 INFINITY 表示撤完为止）。
    async fn cancel_distant_sells(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        target: f64,
    ) -> Result<f64> {
        let threshold = self.config.distant_order_pct / 100.0;
        let mut candidates: Vec<(String, f64, f64)> = state
            .orders
            .values()
            .filter(|o| o.side == OrderSide::Sell)
            .filter(|o| o.distance_from(state.mark_price) > threshold)
            .map(|o| (o.order_id.clone(), o.distance_from(state.mark_price), o.notional()))
            .collect();
        candidates
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut canceled_notional = 0.0;
        for (order_id, _, notional) in candidates {
            if canceled_notional >= target {
                break;
            }
            if gateway.cancel_order(&order_id, &state.symbol).await? {
                state.orders.remove(&order_id);
                canceled_notional += notional;
                log::info!("自动处置撤卖单 {} (名义 {:.2})", order_id, notional);
            }
        }

        if canceled_notional > 0.0 {
            log::info!(
                "{} 撤单阶段累计回收名义 {:.2}",
                state.symbol,
                canceled_notional
            );
        }
        Ok(canceled_notional)
    }

    /// 只撤买侧挂单
    async fn cancel_buy_orders(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
    ) -> Result<bool> {
        let buys: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.side == OrderSide::Buy)
            .map(|o| o.order_id.clone())
            .collect();

        let mut acted = false;
        for order_id in buys {
            if gateway.cancel_order(&order_id, &state.symbol).await? {
                state.orders.remove(&order_id);
                acted = true;
            }
        }
        if acted {
            log::info!("{} 已撤全部买侧挂单，停止继续加仓", state.symbol);
        }
        Ok(acted)
    }

    /// 只减仓市价卖出指定数量
    async fn force_sell(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        position: &Position,
        raw_qty: f64,
        guard: &MarginGuard,
    ) -> Result<bool> {
        // 自身的处置动作不能反过来击穿保证金防护
        guard.check_margin_safety(gateway, state).await?;

        let info = gateway.get_symbol_info(&state.symbol).await?;
        let qty = quantize_quantity(raw_qty.min(position.quantity), info.lot_size);
        if qty <= 0.0 {
            return Ok(false);
        }

        let request = OrderRequest::reduce_only_market(
            state.symbol.clone(),
            position.side.closing_order_side(),
            qty,
        );
        gateway.create_order(&request).await?;

        log::warn!(
            "🚨 {} 强制卖出 {:.6} (持仓 {:.6} -> {:.6})",
            state.symbol,
            qty,
            position.quantity,
            position.quantity - qty
        );
        Ok(true)
    }
}
