//! 保证金防护模块
//!
//! 两级联动干预：一级撤掉离市价最远的挂单（对市场影响最小地
//! 释放保证金），二级对持仓强制只减仓。两级各自可配置、可单独
//! 开关，且一级永远先于二级尝试。

use crate::core::gateway::GatewayAdapter;
use crate::core::quantize::quantize_quantity;
use crate::core::sync::SymbolState;
use crate::core::types::{OrderRequest, Result};
use serde::Deserialize;

/// 保证金防护配置
#[derive(Debug, Clone, Deserialize)]
pub struct MarginGuardConfig {
    /// 一级开关：撤远端挂单
    #[serde(default = "default_true")]
    pub cancel_enabled: bool,
    /// 空闲保证金低于该比例时触发一级（%）
    #[serde(default = "MarginGuardConfig::default_cancel_threshold")]
    pub cancel_threshold_pct: f64,
    /// 二级开关：强制减仓
    #[serde(default = "default_true")]
    pub reduce_enabled: bool,
    /// 空闲保证金低于该比例时触发二级（%）
    #[serde(default = "MarginGuardConfig::default_reduce_threshold")]
    pub reduce_threshold_pct: f64,
    /// 二级减仓的持仓比例
    #[serde(default = "MarginGuardConfig::default_reduce_fraction")]
    pub reduce_fraction: f64,
}

fn default_true() -> bool {
    true
}

impl MarginGuardConfig {
    fn default_cancel_threshold() -> f64 {
        20.0
    }

    fn default_reduce_threshold() -> f64 {
        10.0
    }

    fn default_reduce_fraction() -> f64 {
        0.2
    }
}

impl Default for MarginGuardConfig {
    fn default() -> Self {
        Self {
            cancel_enabled: true,
            cancel_threshold_pct: Self::default_cancel_threshold(),
            reduce_enabled: true,
            reduce_threshold_pct: Self::default_reduce_threshold(),
            reduce_fraction: Self::default_reduce_fraction(),
        }
    }
}

/// 防护动作结果
#[derive(Debug, Clone, PartialEq)]
pub enum GuardAction {
    /// 保证金充足，未干预
    None,
    /// 一级：已撤单
    CanceledDistantOrders { count: usize, freed_notional: f64 },
    /// 二级：已提交强制减仓
    ReducedPosition { quantity: f64 },
}

/// 保证金与敞口防护
pub struct MarginGuard {
    config: MarginGuardConfig,
}

impl MarginGuard {
    pub fn new(config: MarginGuardConfig) -> Self {
        Self { config }
    }

    /// 名义敞口 = Σ(|数量| × 当前市价)，只统计持仓
    ///
    /// 挂单还不是风险，不计入敞口。
    pub async fn current_exposure(
        &self,
        gateway: &GatewayAdapter,
        symbol: &str,
    ) -> Result<f64> {
        let positions = gateway.get_positions(symbol).await?;
        Ok(positions.iter().map(|p| p.notional()).sum())
    }

    /// 保证金安全检查，必要时执行联动干预
    ///
    /// 必须在每次下单/补单之前调用，而不是只挂在定时器上，
    /// 否则一批下单会在首个保证金不足之后继续逐个失败。
    pub async fn check_margin_safety(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
    ) -> Result<GuardAction> {
        let account = gateway.get_account_info().await?;
        let mut free_pct = account.margin_free_percent();

        if free_pct >= self.config.cancel_threshold_pct {
            return Ok(GuardAction::None);
        }

        log::warn!(
            "⚠️ {} 空闲保证金 {:.1}% 低于一级阈值 {:.1}%",
            state.symbol,
            free_pct,
            self.config.cancel_threshold_pct
        );

        let mut canceled = 0usize;
        let mut freed_notional = 0.0;

        if self.config.cancel_enabled {
            // 先撤离市价最远的挂单，逐单重新测量，恢复即停
            let mut by_distance: Vec<(String, f64, f64)> = state
                .orders
                .values()
                .map(|o| (o.order_id.clone(), o.distance_from(state.mark_price), o.notional()))
                .collect();
            by_distance
                .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            for (order_id, distance, notional) in by_distance {
                if gateway.cancel_order(&order_id, &state.symbol).await? {
                    state.orders.remove(&order_id);
                    canceled += 1;
                    freed_notional += notional;
                    log::info!(
                        "一级防护撤单 {} (偏离 {:.2}%, 名义 {:.2})",
                        order_id,
                        distance * 100.0,
                        notional
                    );
                }

                let account = gateway.get_account_info().await?;
                free_pct = account.margin_free_percent();
                if free_pct >= self.config.cancel_threshold_pct {
                    break;
                }
            }
        }

        // 一级足以恢复安全时绝不升级到二级
        if free_pct >= self.config.reduce_threshold_pct || !self.config.reduce_enabled {
            if canceled > 0 {
                return Ok(GuardAction::CanceledDistantOrders {
                    count: canceled,
                    freed_notional,
                });
            }
            return Ok(GuardAction::None);
        }

        self.force_reduce(gateway, state).await
    }

    /// 二级：重新核实持仓后提交只减仓市价单
    async fn force_reduce(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
    ) -> Result<GuardAction> {
        // 决策与执行之间持仓可能已被平掉，提交前以权威状态为准
        let authoritative = gateway.get_positions(&state.symbol).await?;
        let position = match authoritative.into_iter().next() {
            Some(p) => p,
            None => {
                log::info!("{} 持仓已不存在，二级防护无需动作", state.symbol);
                state.position = None;
                return Ok(GuardAction::None);
            }
        };

        let info = gateway.get_symbol_info(&state.symbol).await?;
        let raw_qty = position.quantity * self.config.reduce_fraction;
        let qty = quantize_quantity(raw_qty, info.lot_size);
        if qty <= 0.0 {
            return Ok(GuardAction::None);
        }

        let request = OrderRequest::reduce_only_market(
            state.symbol.clone(),
            position.side.closing_order_side(),
            qty,
        );

        let before = position.quantity;
        gateway.create_order(&request).await?;
        log::error!(
            "🚨 二级防护强制减仓 {}: {:.6} -> {:.6}",
            state.symbol,
            before,
            before - qty
        );

        Ok(GuardAction::ReducedPosition { quantity: qty })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::GatewayError;
    use crate::core::gateway::{ExchangeTransport, GatewayConfig};
    use crate::core::types::{
        Order, OrderKind, OrderResult, OrderSide, Position, PositionSide, SymbolInfo,
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// 按调用顺序返回预设账户状态的传输层
    struct ScriptedTransport {
        /// (净值, 已用保证金) 序列，耗尽后重复最后一个
        account_script: Mutex<VecDeque<(f64, f64)>>,
        positions: Mutex<Vec<Position>>,
        canceled: Mutex<Vec<String>>,
        submitted: Mutex<Vec<OrderRequest>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<(f64, f64)>) -> Self {
            Self {
                account_script: Mutex::new(script.into_iter().collect()),
                positions: Mutex::new(Vec::new()),
                canceled: Mutex::new(Vec::new()),
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeTransport for ScriptedTransport {
        async fn fetch_positions(&self) -> Result<Vec<Position>> {
            Ok(self.positions.lock().await.clone())
        }

        async fn fetch_open_orders(&self) -> Result<Vec<Order>> {
            Ok(Vec::new())
        }

        async fn fetch_account_raw(&self) -> Result<serde_json::Value> {
            let mut script = self.account_script.lock().await;
            let (equity, used) = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                *script.front().expect("账户脚本为空")
            };
            Ok(json!({
                "data": { "account_equity": equity, "total_margin_used": used }
            }))
        }

        async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult> {
            self.submitted.lock().await.push(request.clone());
            Ok(OrderResult {
                order_id: "scripted".to_string(),
                take_profit_order_id: None,
                stop_loss_order_id: None,
            })
        }

        async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<bool> {
            self.canceled.lock().await.push(order_id.to_string());
            Ok(true)
        }

        async fn fetch_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
            Ok(SymbolInfo {
                symbol: symbol.to_string(),
                tick_size: 0.1,
                lot_size: 0.001,
            })
        }

        async fn fetch_mark_price(&self, _symbol: &str) -> Result<f64> {
            Err(GatewayError::Other("unused".to_string()))
        }
    }

    fn gateway(transport: Arc<ScriptedTransport>) -> GatewayAdapter {
        let config = GatewayConfig {
            min_call_spacing_ms: 0,
            ..GatewayConfig::default()
        };
        GatewayAdapter::new(transport, &config)
    }

    fn limit_order(id: &str, price: f64) -> Order {
        Order {
            order_id: id.to_string(),
            symbol: "BTC".to_string(),
            side: OrderSide::Buy,
            price,
            size: 1.0,
            kind: OrderKind::Limit,
            created_at: Utc::now(),
            client_order_id: None,
        }
    }

    fn long_position(qty: f64) -> Position {
        Position {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: qty,
            entry_price: 100.0,
            current_price: 100.0,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            margin_used: 10.0,
            opened_at: Utc::now(),
            take_profit_order_id: None,
            stop_loss_order_id: None,
            time_in_loss_seconds: 0,
        }
    }

    fn state_with_orders(orders: Vec<Order>) -> SymbolState {
        let mut state = SymbolState::new("BTC");
        state.mark_price = 100.0;
        for order in orders {
            state.orders.insert(order.order_id.clone(), order);
        }
        state
    }

    #[tokio::test]
    async fn test_no_action_when_margin_healthy() {
        // 空闲 50%
        let transport = Arc::new(ScriptedTransport::new(vec![(1000.0, 500.0)]));
        let gw = gateway(transport.clone());
        let guard = MarginGuard::new(MarginGuardConfig::default());
        let mut state = state_with_orders(vec![limit_order("o1", 90.0)]);

        let action = guard.check_margin_safety(&gw, &mut state).await.unwrap();
        assert_eq!(action, GuardAction::None);
        assert!(transport.canceled.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_level1_fires_between_thresholds() {
        // 空闲 15%：低于 20 高于 10，只触发一级
        let transport = Arc::new(ScriptedTransport::new(vec![(1000.0, 850.0)]));
        let gw = gateway(transport.clone());
        let guard = MarginGuard::new(MarginGuardConfig::default());
        let mut state =
            state_with_orders(vec![limit_order("near", 98.0), limit_order("far", 90.0)]);

        let action = guard.check_margin_safety(&gw, &mut state).await.unwrap();

        match action {
            GuardAction::CanceledDistantOrders { count, .. } => assert_eq!(count, 2),
            other => panic!("预期一级撤单，实际 {:?}", other),
        }
        // 二级不应触发
        assert!(transport.submitted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_most_distant_order_canceled_first() {
        let transport = Arc::new(ScriptedTransport::new(vec![(1000.0, 850.0)]));
        let gw = gateway(transport.clone());
        let guard = MarginGuard::new(MarginGuardConfig::default());
        let mut state =
            state_with_orders(vec![limit_order("near", 98.0), limit_order("far", 90.0)]);

        guard.check_margin_safety(&gw, &mut state).await.unwrap();

        let canceled = transport.canceled.lock().await;
        assert_eq!(canceled.as_slice(), ["far", "near"]);
    }

    #[tokio::test]
    async fn test_level2_not_fired_when_level1_recovers() {
        // 撤掉一单后保证金恢复到 25%
        let transport = Arc::new(ScriptedTransport::new(vec![
            (1000.0, 920.0), // 初检 8%
            (1000.0, 750.0), // 撤单后 25%
        ]));
        let gw = gateway(transport.clone());
        let guard = MarginGuard::new(MarginGuardConfig::default());
        let mut state =
            state_with_orders(vec![limit_order("near", 98.0), limit_order("far", 90.0)]);

        let action = guard.check_margin_safety(&gw, &mut state).await.unwrap();

        match action {
            GuardAction::CanceledDistantOrders { count, .. } => assert_eq!(count, 1),
            other => panic!("预期仅一级动作，实际 {:?}", other),
        }
        assert!(transport.submitted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_level2_reduces_after_level1_insufficient() {
        // 始终 8%：一级撤完仍不安全，升级二级
        let transport = Arc::new(ScriptedTransport::new(vec![(1000.0, 920.0)]));
        transport.positions.lock().await.push(long_position(1.0));
        let gw = gateway(transport.clone());
        let guard = MarginGuard::new(MarginGuardConfig::default());
        let mut state = state_with_orders(vec![limit_order("far", 90.0)]);

        let action = guard.check_margin_safety(&gw, &mut state).await.unwrap();

        match action {
            GuardAction::ReducedPosition { quantity } => {
                assert!((quantity - 0.2).abs() < 1e-9);
            }
            other => panic!("预期二级减仓，实际 {:?}", other),
        }

        // 一级先于二级执行
        assert_eq!(transport.canceled.lock().await.len(), 1);
        let submitted = transport.submitted.lock().await;
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].reduce_only);
        assert_eq!(submitted[0].side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_level2_skipped_when_position_vanished() {
        let transport = Arc::new(ScriptedTransport::new(vec![(1000.0, 920.0)]));
        let gw = gateway(transport.clone());
        let guard = MarginGuard::new(MarginGuardConfig::default());
        let mut state = state_with_orders(vec![]);
        state.position = Some(long_position(1.0));

        let action = guard.check_margin_safety(&gw, &mut state).await.unwrap();

        // 权威侧没有持仓：软失败，清除本地并跳过
        assert_eq!(action, GuardAction::None);
        assert!(state.position.is_none());
        assert!(transport.submitted.lock().await.is_empty());
    }
}
