//! 止盈止损覆盖引擎
//!
//! 保证每个被跟踪的持仓最终都获得保护：优先走网关原生TP/SL，
//! 被拒后退化为本地影子监控。保护价一律基于当前市价计算——
//! 入场价在价格大幅移动后会产生已经被穿越的失效保护位。
//!
//! 每个持仓的状态机:
//! UNPROTECTED -> API_TP_SL_PENDING -> PROTECTED
//! UNPROTECTED -> SHADOW_MONITORED (网关拒单后)

use crate::core::error::{FailureClass, GatewayError};
use crate::core::gateway::GatewayAdapter;
use crate::core::quantize::{quantize_price, quantize_quantity};
use crate::core::sync::SymbolState;
use crate::core::types::{OrderKind, OrderRequest, Position, PositionSide, Result};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// 持仓保护状态
#[derive(Debug, Clone, PartialEq)]
pub enum CoverageState {
    Unprotected,
    /// 保护单已提交，等待下一轮同步确认
    ApiPending { tp_id: String, sl_id: String },
    Protected { tp_id: String, sl_id: String },
    /// 网关原生保护不可用，本地逐轮比对盈亏
    ShadowMonitored,
}

/// 覆盖引擎配置
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectionConfig {
    /// 止盈比例（%），必须严格大于止损比例
    #[serde(default = "ProtectionConfig::default_tp")]
    pub take_profit_pct: f64,
    /// 止损比例（%）
    #[serde(default = "ProtectionConfig::default_sl")]
    pub stop_loss_pct: f64,
    /// 每隔多少轮再核验一次保护单仍然存在
    #[serde(default = "ProtectionConfig::default_reverify")]
    pub reverify_cycles: u64,
}

impl ProtectionConfig {
    fn default_tp() -> f64 {
        2.0
    }

    fn default_sl() -> f64 {
        1.0
    }

    fn default_reverify() -> u64 {
        10
    }

    /// 启动时校验；止盈不大于止损的配置在数学上必然亏损
    pub fn validate(&self) -> Result<()> {
        if self.take_profit_pct <= self.stop_loss_pct {
            return Err(GatewayError::ConfigError(format!(
                "止盈比例 {:.2}% 必须严格大于止损比例 {:.2}%",
                self.take_profit_pct, self.stop_loss_pct
            )));
        }
        if self.stop_loss_pct <= 0.0 {
            return Err(GatewayError::ConfigError(
                "止损比例必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: Self::default_tp(),
            stop_loss_pct: Self::default_sl(),
            reverify_cycles: Self::default_reverify(),
        }
    }
}

/// 一对保护价
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectivePrices {
    pub take_profit: f64,
    pub stop_loss: f64,
}

/// 基于当前市价计算保护价（未量化）
pub fn protective_prices(
    side: PositionSide,
    mark_price: f64,
    tp_pct: f64,
    sl_pct: f64,
) -> ProtectivePrices {
    match side {
        PositionSide::Long => ProtectivePrices {
            take_profit: mark_price * (1.0 + tp_pct / 100.0),
            stop_loss: mark_price * (1.0 - sl_pct / 100.0),
        },
        PositionSide::Short => ProtectivePrices {
            take_profit: mark_price * (1.0 - tp_pct / 100.0),
            stop_loss: mark_price * (1.0 + sl_pct / 100.0),
        },
    }
}

/// 止盈止损覆盖引擎
pub struct ProtectionEngine {
    config: ProtectionConfig,
    coverage: Mutex<HashMap<String, CoverageState>>,
}

impl ProtectionEngine {
    pub fn new(config: ProtectionConfig) -> Self {
        Self {
            config,
            coverage: Mutex::new(HashMap::new()),
        }
    }

    /// 查询某交易对当前的保护状态
    pub async fn coverage_state(&self, symbol: &str) -> Option<CoverageState> {
        self.coverage.lock().await.get(symbol).cloned()
    }

    /// 每轮对一个交易对执行覆盖检查
    ///
    /// `cycle` 为引擎的轮次计数，用于限制再核验的API调用频率。
    pub async fn ensure_coverage(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        cycle: u64,
    ) -> Result<()> {
        let position = match &state.position {
            Some(p) => p.clone(),
            None => {
                // 持仓消失时，保护单跟踪必须一起清除
                let mut coverage = self.coverage.lock().await;
                if coverage.remove(&state.symbol).is_some() {
                    log::info!("{} 持仓已消失，清除保护跟踪", state.symbol);
                }
                return Ok(());
            }
        };

        let current = {
            let coverage = self.coverage.lock().await;
            coverage
                .get(&state.symbol)
                .cloned()
                .unwrap_or(CoverageState::Unprotected)
        };

        match current {
            CoverageState::Unprotected => {
                // 开仓时网关已原子创建过保护单的持仓直接视为受保护
                if let (Some(tp), Some(sl)) = (
                    position.take_profit_order_id.clone(),
                    position.stop_loss_order_id.clone(),
                ) {
                    self.set_state(
                        &state.symbol,
                        CoverageState::Protected { tp_id: tp, sl_id: sl },
                    )
                    .await;
                    return Ok(());
                }
                self.place_protection(gateway, state, &position).await
            }
            CoverageState::ApiPending { tp_id, sl_id } => {
                // 上一轮提交的保护单经同步确认后转入 PROTECTED
                if state.orders.contains_key(&tp_id) && state.orders.contains_key(&sl_id) {
                    log::info!("✅ {} 保护单已确认 (tp={}, sl={})", state.symbol, tp_id, sl_id);
                    self.set_state(
                        &state.symbol,
                        CoverageState::Protected { tp_id, sl_id },
                    )
                    .await;
                } else {
                    // 提交后未出现在权威订单里，下一轮重新保护
                    self.set_state(&state.symbol, CoverageState::Unprotected).await;
                }
                Ok(())
            }
            CoverageState::Protected { tp_id, sl_id } => {
                if cycle % self.config.reverify_cycles.max(1) != 0 {
                    return Ok(());
                }
                // 周期性核验保护单仍然挂着
                if !state.orders.contains_key(&tp_id) || !state.orders.contains_key(&sl_id) {
                    log::warn!(
                        "⚠️ {} 保护单缺失 (tp={}, sl={})，重新进入未保护状态",
                        state.symbol,
                        tp_id,
                        sl_id
                    );
                    self.set_state(&state.symbol, CoverageState::Unprotected).await;
                }
                Ok(())
            }
            CoverageState::ShadowMonitored => {
                self.shadow_tick(gateway, state, &position).await
            }
        }
    }

    async fn set_state(&self, symbol: &str, next: CoverageState) {
        let mut coverage = self.coverage.lock().await;
        coverage.insert(symbol.to_string(), next);
    }

    /// 提交网关原生TP/SL对
    async fn place_protection(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        position: &Position,
    ) -> Result<()> {
        // 决策与提交之间持仓可能已平，先以权威状态核实
        let live = gateway.get_positions(&state.symbol).await?;
        let live_position = match live.into_iter().next() {
            Some(p) => p,
            None => {
                log::info!("{} 提交保护单前持仓已平，跳过", state.symbol);
                state.position = None;
                return Ok(());
            }
        };

        let info = gateway.get_symbol_info(&state.symbol).await?;
        let prices = protective_prices(
            live_position.side,
            state.mark_price,
            self.config.take_profit_pct,
            self.config.stop_loss_pct,
        );
        let tp_price = quantize_price(prices.take_profit, info.tick_size);
        let sl_price = quantize_price(prices.stop_loss, info.tick_size);
        let qty = quantize_quantity(live_position.quantity, info.lot_size);
        let closing_side = live_position.side.closing_order_side();

        let tp_request = OrderRequest {
            symbol: state.symbol.clone(),
            side: closing_side,
            size: qty,
            price: Some(tp_price),
            kind: OrderKind::TakeProfit,
            reduce_only: true,
            time_in_force: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };

        let tp_id = match gateway.create_order(&tp_request).await {
            Ok(result) => result.order_id,
            Err(err) if err.class() == FailureClass::Validation => {
                log::warn!(
                    "⚠️ {} 原生止盈被拒({})，退化为影子监控",
                    state.symbol,
                    err
                );
                self.set_state(&state.symbol, CoverageState::ShadowMonitored).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let sl_request = OrderRequest {
            price: Some(sl_price),
            kind: OrderKind::StopLoss,
            ..tp_request
        };

        match gateway.create_order(&sl_request).await {
            Ok(result) => {
                log::info!(
                    "{} 已提交保护单: {} TP @ {} / SL @ {} (qty {})",
                    state.symbol,
                    closing_side,
                    tp_price,
                    sl_price,
                    qty
                );
                if let Some(p) = state.position.as_mut() {
                    p.take_profit_order_id = Some(tp_id.clone());
                    p.stop_loss_order_id = Some(result.order_id.clone());
                }
                self.set_state(
                    &state.symbol,
                    CoverageState::ApiPending {
                        tp_id,
                        sl_id: result.order_id,
                    },
                )
                .await;
                Ok(())
            }
            Err(err) if err.class() == FailureClass::Validation => {
                // 半套保护没有意义，撤掉止盈后转影子监控
                let _ = gateway.cancel_order(&tp_id, &state.symbol).await;
                log::warn!(
                    "⚠️ {} 原生止损被拒({})，退化为影子监控",
                    state.symbol,
                    err
                );
                self.set_state(&state.symbol, CoverageState::ShadowMonitored).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// 影子监控：逐轮比对盈亏并在越界时手动只减仓平掉
    async fn shadow_tick(
        &self,
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        position: &Position,
    ) -> Result<()> {
        let pnl_pct = position.raw_pnl_pct();
        let breached_tp = pnl_pct >= self.config.take_profit_pct;
        let breached_sl = pnl_pct <= -self.config.stop_loss_pct;

        if !breached_tp && !breached_sl {
            return Ok(());
        }

        let reason = if breached_tp { "止盈" } else { "止损" };
        let info = gateway.get_symbol_info(&state.symbol).await?;
        let qty = quantize_quantity(position.quantity, info.lot_size);
        let request = OrderRequest::reduce_only_market(
            state.symbol.clone(),
            position.side.closing_order_side(),
            qty,
        );

        match gateway.create_order(&request).await {
            Ok(_) => {
                log::warn!(
                    "🚨 {} 影子{}触发: 盈亏 {:.2}%，已市价平仓 {:.6}",
                    state.symbol,
                    reason,
                    pnl_pct,
                    qty
                );
                Ok(())
            }
            Err(err) if err.class() == FailureClass::Validation => {
                // 多半是持仓已先被平掉，软失败，下一轮同步自然收敛
                log::warn!("{} 影子平仓被拒，等待下一轮: {}", state.symbol, err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
