//! 持仓/订单状态同步模块
//!
//! 维护本实例对单个交易对的本地视图，并以网关返回的权威状态
//! 为准进行对账：权威侧消失的本地条目被清除，本地没有的权威
//! 条目被收养（孤儿持仓），收养会触发保护层的立即检查。

use crate::core::error::GatewayError;
use crate::core::gateway::GatewayAdapter;
use crate::core::types::{Order, Position, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// 单个交易对的本地状态
///
/// 必须在持有该交易对临界区的前提下读写。
#[derive(Debug)]
pub struct SymbolState {
    pub symbol: String,
    pub position: Option<Position>,
    /// order_id -> 订单
    pub orders: HashMap<String, Order>,
    /// 最近一次有效标记价格，坏数据时的回退值
    pub mark_price: f64,
    /// 收养孤儿后置位，引擎在同一轮内完成保护检查后清除
    pub pending_orphan_check: bool,
    /// 持仓连续亏损的起点
    loss_since: Option<DateTime<Utc>>,
}

impl SymbolState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            position: None,
            orders: HashMap::new(),
            mark_price: 0.0,
            pending_orphan_check: false,
            loss_since: None,
        }
    }

    /// 按方向挑选活跃订单
    pub fn orders_by_side(&self, side: crate::core::types::OrderSide) -> Vec<&Order> {
        self.orders.values().filter(|o| o.side == side).collect()
    }
}

/// 一轮同步的结果摘要
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    /// 本轮是否收养了孤儿持仓
    pub adopted_orphan: bool,
    /// 权威侧已平掉的本地持仓（用于触发周期结算）
    pub closed_position: Option<Position>,
    pub adopted_orders: usize,
    pub purged_orders: usize,
}

/// 状态同步器
///
/// 只更新本地缓存，自身从不下单。
pub struct StateSynchronizer;

impl StateSynchronizer {
    /// 对账一个交易对
    pub async fn sync(
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
    ) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        Self::refresh_mark_price(gateway, state).await?;
        Self::sync_position(gateway, state, &mut report).await?;
        Self::sync_orders(gateway, state, &mut report).await?;

        Ok(report)
    }

    /// 刷新标记价格；坏数据时沿用上一个有效价格而不是中断
    async fn refresh_mark_price(
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
    ) -> Result<()> {
        match gateway.get_mark_price(&state.symbol).await {
            Ok(price) => {
                state.mark_price = price;
                Ok(())
            }
            Err(err) if state.mark_price > 0.0 => {
                log::warn!(
                    "⚠️ {} 标记价格获取失败，沿用上次有效价 {}: {}",
                    state.symbol,
                    state.mark_price,
                    err
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn sync_position(
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        report: &mut SyncReport,
    ) -> Result<()> {
        let authoritative = gateway.get_positions(&state.symbol).await?;
        let fresh = authoritative.into_iter().next();

        if let Some(incoming) = &fresh {
            if incoming.quantity <= 0.0 {
                return Err(GatewayError::ParseError(format!(
                    "{} 持仓数量非法: {}",
                    state.symbol, incoming.quantity
                )));
            }
        }

        match (fresh, state.position.take()) {
            (Some(mut incoming), Some(local)) => {
                // 权威载荷缺少保护单ID时保留本地跟踪
                if incoming.take_profit_order_id.is_none() {
                    incoming.take_profit_order_id = local.take_profit_order_id;
                }
                if incoming.stop_loss_order_id.is_none() {
                    incoming.stop_loss_order_id = local.stop_loss_order_id;
                }
                incoming.current_price = state.mark_price;
                Self::track_time_in_loss(state, &mut incoming);
                state.position = Some(incoming);
            }
            (Some(mut incoming), None) => {
                // 孤儿持仓：开仓发生在本实例之外，立即纳入防护
                incoming.current_price = state.mark_price;
                Self::track_time_in_loss(state, &mut incoming);
                log::warn!(
                    "⚠️ {} 收养孤儿持仓: {} {} @ {}",
                    state.symbol,
                    incoming.side,
                    incoming.quantity,
                    incoming.entry_price
                );
                state.position = Some(incoming);
                state.pending_orphan_check = true;
                report.adopted_orphan = true;
            }
            (None, Some(local)) => {
                log::info!("{} 持仓已在交易所平掉，清除本地跟踪", state.symbol);
                state.loss_since = None;
                report.closed_position = Some(local);
            }
            (None, None) => {
                state.loss_since = None;
            }
        }

        Ok(())
    }

    async fn sync_orders(
        gateway: &GatewayAdapter,
        state: &mut SymbolState,
        report: &mut SyncReport,
    ) -> Result<()> {
        let authoritative = gateway.get_open_orders(&state.symbol).await?;

        let mut fresh: HashMap<String, Order> = HashMap::with_capacity(authoritative.len());
        for order in authoritative {
            if !state.orders.contains_key(&order.order_id) {
                report.adopted_orders += 1;
            }
            fresh.insert(order.order_id.clone(), order);
        }

        report.purged_orders = state
            .orders
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .count();

        if report.purged_orders > 0 {
            log::debug!(
                "{} 清除 {} 个已不存在的本地订单",
                state.symbol,
                report.purged_orders
            );
        }

        state.orders = fresh;
        Ok(())
    }

    /// 维护连续亏损时长；回到非负盈亏时清零
    fn track_time_in_loss(state: &mut SymbolState, position: &mut Position) {
        if position.raw_pnl_pct() < 0.0 {
            let since = state.loss_since.get_or_insert_with(Utc::now);
            position.time_in_loss_seconds =
                (Utc::now() - *since).num_seconds().max(0) as u64;
        } else {
            state.loss_since = None;
            position.time_in_loss_seconds = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gateway::{ExchangeTransport, GatewayConfig};
    use crate::core::types::{OrderKind, OrderResult, OrderSide, PositionSide, SymbolInfo};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// 可编程的测试传输层
    struct StubTransport {
        positions: Mutex<Vec<Position>>,
        orders: Mutex<Vec<Order>>,
        mark_price: Mutex<f64>,
    }

    impl StubTransport {
        fn new() -> Self {
            Self {
                positions: Mutex::new(Vec::new()),
                orders: Mutex::new(Vec::new()),
                mark_price: Mutex::new(100.0),
            }
        }
    }

    #[async_trait]
    impl ExchangeTransport for StubTransport {
        async fn fetch_positions(&self) -> Result<Vec<Position>> {
            Ok(self.positions.lock().await.clone())
        }

        async fn fetch_open_orders(&self) -> Result<Vec<Order>> {
            Ok(self.orders.lock().await.clone())
        }

        async fn fetch_account_raw(&self) -> Result<serde_json::Value> {
            Ok(json!({ "data": { "account_equity": 1000.0 } }))
        }

        async fn submit_order(&self, _request: &crate::core::types::OrderRequest) -> Result<OrderResult> {
            Ok(OrderResult {
                order_id: "stub".to_string(),
                take_profit_order_id: None,
                stop_loss_order_id: None,
            })
        }

        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<bool> {
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
            Ok(*self.mark_price.lock().await)
        }
    }

    fn fast_gateway(transport: Arc<StubTransport>) -> GatewayAdapter {
        let config = GatewayConfig {
            min_call_spacing_ms: 0,
            ..GatewayConfig::default()
        };
        GatewayAdapter::new(transport, &config)
    }

    fn position(symbol: &str, side: PositionSide, qty: f64, entry: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side,
            quantity: qty,
            entry_price: entry,
            current_price: entry,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            margin_used: 10.0,
            opened_at: Utc::now(),
            take_profit_order_id: None,
            stop_loss_order_id: None,
            time_in_loss_seconds: 0,
        }
    }

    fn order(id: &str, symbol: &str, side: OrderSide, price: f64) -> Order {
        Order {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            side,
            price,
            size: 1.0,
            kind: OrderKind::Limit,
            created_at: Utc::now(),
            client_order_id: None,
        }
    }

    #[tokio::test]
    async fn test_symbol_isolation() {
        let transport = Arc::new(StubTransport::new());
        {
            let mut positions = transport.positions.lock().await;
            positions.push(position("BTC", PositionSide::Long, 0.5, 100.0));
            positions.push(position("ETH", PositionSide::Short, 2.0, 50.0));
            let mut orders = transport.orders.lock().await;
            orders.push(order("o1", "BTC", OrderSide::Buy, 99.0));
            orders.push(order("o2", "ETH", OrderSide::Sell, 51.0));
            orders.push(order("o3", "SOL", OrderSide::Buy, 10.0));
        }

        let gateway = fast_gateway(transport);
        let mut state = SymbolState::new("BTC");
        StateSynchronizer::sync(&gateway, &mut state).await.unwrap();

        assert_eq!(state.position.as_ref().unwrap().symbol, "BTC");
        assert_eq!(state.orders.len(), 1);
        assert!(state.orders.contains_key("o1"));
    }

    #[tokio::test]
    async fn test_orphan_adoption_flags_check() {
        let transport = Arc::new(StubTransport::new());
        transport
            .positions
            .lock()
            .await
            .push(position("BTC", PositionSide::Long, 0.5, 100.0));

        let gateway = fast_gateway(transport);
        let mut state = SymbolState::new("BTC");
        let report = StateSynchronizer::sync(&gateway, &mut state).await.unwrap();

        assert!(report.adopted_orphan);
        assert!(state.pending_orphan_check);
        assert!(state.position.is_some());
    }

    #[tokio::test]
    async fn test_closed_position_is_purged() {
        let transport = Arc::new(StubTransport::new());
        transport
            .positions
            .lock()
            .await
            .push(position("BTC", PositionSide::Long, 0.5, 100.0));

        let gateway = fast_gateway(transport.clone());
        let mut state = SymbolState::new("BTC");
        StateSynchronizer::sync(&gateway, &mut state).await.unwrap();
        assert!(state.position.is_some());

        transport.positions.lock().await.clear();
        let report = StateSynchronizer::sync(&gateway, &mut state).await.unwrap();

        assert!(state.position.is_none());
        assert!(report.closed_position.is_some());
    }

    #[tokio::test]
    async fn test_stale_orders_purged_and_new_adopted() {
        let transport = Arc::new(StubTransport::new());
        transport
            .orders
            .lock()
            .await
            .push(order("old", "BTC", OrderSide::Buy, 99.0));

        let gateway = fast_gateway(transport.clone());
        let mut state = SymbolState::new("BTC");
        StateSynchronizer::sync(&gateway, &mut state).await.unwrap();
        assert!(state.orders.contains_key("old"));

        {
            let mut orders = transport.orders.lock().await;
            orders.clear();
            orders.push(order("new", "BTC", OrderSide::Sell, 101.0));
        }
        let report = StateSynchronizer::sync(&gateway, &mut state).await.unwrap();

        assert_eq!(report.purged_orders, 1);
        assert_eq!(report.adopted_orders, 1);
        assert!(state.orders.contains_key("new"));
        assert!(!state.orders.contains_key("old"));
    }

    #[tokio::test]
    async fn test_bad_price_falls_back_to_last_good() {
        let transport = Arc::new(StubTransport::new());
        let gateway = fast_gateway(transport.clone());
        let mut state = SymbolState::new("BTC");

        StateSynchronizer::sync(&gateway, &mut state).await.unwrap();
        assert_eq!(state.mark_price, 100.0);

        *transport.mark_price.lock().await = -1.0;
        StateSynchronizer::sync(&gateway, &mut state).await.unwrap();
        // 坏价格不覆盖上一个有效价
        assert_eq!(state.mark_price, 100.0);
    }
}
