//! 纸面交易传输层
//!
//! 进程内模拟的交易所：实现与真实签名客户端相同的
//! `ExchangeTransport` 契约，包括真实网关的各种拒单行为和
//! 账户载荷的形状歧义，让风控链路可以在无凭证环境下完整运行。

use crate::core::error::GatewayError;
use crate::core::gateway::ExchangeTransport;
use crate::core::types::{
    Order, OrderKind, OrderRequest, OrderResult, OrderSide, Position, PositionSide, Result,
    SymbolInfo,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// 纸面交易配置
#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub initial_equity: f64,
    pub leverage: f64,
    /// 每个交易对的精度信息
    pub symbols: HashMap<String, SymbolInfo>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        let mut symbols = HashMap::new();
        symbols.insert(
            "BTC".to_string(),
            SymbolInfo {
                symbol: "BTC".to_string(),
                tick_size: 0.1,
                lot_size: 0.00001,
            },
        );
        Self {
            initial_equity: 10000.0,
            leverage: 10.0,
            symbols,
        }
    }
}

struct PaperBook {
    positions: HashMap<String, Position>,
    orders: HashMap<String, Order>,
    marks: HashMap<String, f64>,
    realized_pnl: f64,
}

/// 进程内模拟交易所
pub struct PaperTransport {
    config: PaperConfig,
    book: Mutex<PaperBook>,
    order_seq: AtomicU64,
    /// 账户接口交替返回对象/数组两种合法形状
    account_shape_flip: AtomicU64,
}

impl PaperTransport {
    pub fn new(config: PaperConfig) -> Self {
        Self {
            config,
            book: Mutex::new(PaperBook {
                positions: HashMap::new(),
                orders: HashMap::new(),
                marks: HashMap::new(),
                realized_pnl: 0.0,
            }),
            order_seq: AtomicU64::new(1),
            account_shape_flip: AtomicU64::new(0),
        }
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// 推送一个新标记价格并重算持仓盈亏
    pub async fn set_mark_price(&self, symbol: &str, price: f64) {
        let mut book = self.book.lock().await;
        book.marks.insert(symbol.to_string(), price);
        if let Some(position) = book.positions.get_mut(symbol) {
            position.current_price = price;
            let diff = match position.side {
                PositionSide::Long => price - position.entry_price,
                PositionSide::Short => position.entry_price - price,
            };
            position.unrealized_pnl = diff * position.quantity;
            position.unrealized_pnl_pct = if position.entry_price > 0.0 {
                diff / position.entry_price * 100.0
            } else {
                0.0
            };
        }
    }

    /// 直接注入一个持仓，模拟在本实例生命周期之外开的仓（孤儿）
    pub async fn inject_position(&self, position: Position) {
        let mut book = self.book.lock().await;
        book.marks
            .insert(position.symbol.clone(), position.current_price);
        book.positions.insert(position.symbol.clone(), position);
    }

    pub async fn realized_pnl(&self) -> f64 {
        self.book.lock().await.realized_pnl
    }

    fn validate_tick_alignment(&self, symbol: &str, price: f64) -> Result<()> {
        if let Some(info) = self.config.symbols.get(symbol) {
            if info.tick_size > 0.0 {
                let multiples = price / info.tick_size;
                if (multiples - multiples.round()).abs() > 1e-6 {
                    return Err(GatewayError::OrderRejected(format!(
                        "price {} is not a multiple of tick size {}",
                        price, info.tick_size
                    )));
                }
            }
        }
        Ok(())
    }

    fn fill_market(
        book: &mut PaperBook,
        request: &OrderRequest,
        mark: f64,
        leverage: f64,
    ) -> Result<()> {
        match book.positions.get(&request.symbol).cloned() {
            Some(mut position) if position.side.closing_order_side() == request.side => {
                // 平仓方向：减少持仓
                let close_qty = request.size.min(position.quantity);
                let diff = match position.side {
                    PositionSide::Long => mark - position.entry_price,
                    PositionSide::Short => position.entry_price - mark,
                };
                book.realized_pnl += diff * close_qty;
                position.quantity -= close_qty;
                if position.quantity <= 1e-12 {
                    book.positions.remove(&request.symbol);
                } else {
                    position.margin_used = position.quantity * mark / leverage;
                    book.positions.insert(request.symbol.clone(), position);
                }
            }
            Some(mut position) => {
                // 同向加仓：加权平均入场价
                let total = position.quantity + request.size;
                position.entry_price = (position.entry_price * position.quantity
                    + mark * request.size)
                    / total;
                position.quantity = total;
                position.margin_used = total * mark / leverage;
                book.positions.insert(request.symbol.clone(), position);
            }
            None => {
                if request.reduce_only {
                    return Err(GatewayError::OrderRejected(
                        "reduce-only order with no open position".to_string(),
                    ));
                }
                let side = match request.side {
                    OrderSide::Buy => PositionSide::Long,
                    OrderSide::Sell => PositionSide::Short,
                };
                book.positions.insert(
                    request.symbol.clone(),
                    Position {
                        symbol: request.symbol.clone(),
                        side,
                        quantity: request.size,
                        entry_price: mark,
                        current_price: mark,
                        unrealized_pnl: 0.0,
                        unrealized_pnl_pct: 0.0,
                        margin_used: request.size * mark / leverage,
                        opened_at: Utc::now(),
                        take_profit_order_id: None,
                        stop_loss_order_id: None,
                        time_in_loss_seconds: 0,
                    },
                );
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ExchangeTransport for PaperTransport {
    async fn fetch_positions(&self) -> Result<Vec<Position>> {
        let book = self.book.lock().await;
        Ok(book.positions.values().cloned().collect())
    }

    async fn fetch_open_orders(&self) -> Result<Vec<Order>> {
        let book = self.book.lock().await;
        Ok(book.orders.values().cloned().collect())
    }

    async fn fetch_account_raw(&self) -> Result<serde_json::Value> {
        let book = self.book.lock().await;
        let margin_used: f64 = book.positions.values().map(|p| p.margin_used).sum();
        let unrealized: f64 = book.positions.values().map(|p| p.unrealized_pnl).sum();
        let equity = self.config.initial_equity + book.realized_pnl + unrealized;

        let payload = json!({
            "account_equity": format!("{:.8}", equity),
            "available_to_spend": format!("{:.8}", (equity - margin_used).max(0.0)),
            "total_margin_used": format!("{:.8}", margin_used),
        });

        // 与真实网关一致：同一接口对单账户可能返回两种形状
        let flip = self.account_shape_flip.fetch_add(1, Ordering::Relaxed);
        if flip % 2 == 0 {
            Ok(json!({ "data": payload }))
        } else {
            Ok(json!({ "data": [payload] }))
        }
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        if request.size <= 0.0 {
            return Err(GatewayError::OrderRejected(
                "order size must be positive".to_string(),
            ));
        }

        let mut book = self.book.lock().await;
        let mark = *book.marks.get(&request.symbol).ok_or_else(|| {
            GatewayError::SymbolNotFound(request.symbol.clone())
        })?;

        if request.reduce_only && !book.positions.contains_key(&request.symbol) {
            return Err(GatewayError::OrderRejected(
                "reduce-only order with no open position".to_string(),
            ));
        }

        // 止盈止损子单必须是平仓方向且价格对齐tick
        if request.take_profit.is_some() || request.stop_loss.is_some() {
            if let Some(position) = book.positions.get(&request.symbol) {
                if request.side != position.side.closing_order_side() {
                    return Err(GatewayError::OrderRejected(
                        "stop order side must close the position".to_string(),
                    ));
                }
            }
            for price in [request.take_profit, request.stop_loss].into_iter().flatten() {
                self.validate_tick_alignment(&request.symbol, price)?;
            }
        }

        match request.kind {
            OrderKind::Market => {
                Self::fill_market(&mut book, request, mark, self.config.leverage)?;
                Ok(OrderResult {
                    order_id: self.next_order_id(),
                    take_profit_order_id: None,
                    stop_loss_order_id: None,
                })
            }
            OrderKind::TakeProfit | OrderKind::StopLoss => {
                let price = request.price.ok_or_else(|| {
                    GatewayError::OrderRejected("stop order requires a price".to_string())
                })?;
                self.validate_tick_alignment(&request.symbol, price)?;
                let position = book.positions.get(&request.symbol).ok_or_else(|| {
                    GatewayError::OrderRejected(
                        "stop order with no open position".to_string(),
                    )
                })?;
                if request.side != position.side.closing_order_side() {
                    return Err(GatewayError::OrderRejected(
                        "stop order side must close the position".to_string(),
                    ));
                }

                let order_id = self.next_order_id();
                book.orders.insert(
                    order_id.clone(),
                    Order {
                        order_id: order_id.clone(),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        price,
                        size: request.size,
                        kind: request.kind,
                        created_at: Utc::now(),
                        client_order_id: request.client_order_id.clone(),
                    },
                );
                Ok(OrderResult {
                    order_id,
                    take_profit_order_id: None,
                    stop_loss_order_id: None,
                })
            }
            _ => {
                let price = request.price.ok_or_else(|| {
                    GatewayError::OrderRejected("limit order requires a price".to_string())
                })?;
                self.validate_tick_alignment(&request.symbol, price)?;

                let order_id = self.next_order_id();
                book.orders.insert(
                    order_id.clone(),
                    Order {
                        order_id: order_id.clone(),
                        symbol: request.symbol.clone(),
                        side: request.side,
                        price,
                        size: request.size,
                        kind: request.kind,
                        created_at: Utc::now(),
                        client_order_id: request.client_order_id.clone(),
                    },
                );
                Ok(OrderResult {
                    order_id,
                    take_profit_order_id: None,
                    stop_loss_order_id: None,
                })
            }
        }
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<bool> {
        let mut book = self.book.lock().await;
        Ok(book.orders.remove(order_id).is_some())
    }

    async fn fetch_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        self.config
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::SymbolNotFound(symbol.to_string()))
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64> {
        let book = self.book.lock().await;
        book.marks
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::SymbolNotFound(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper() -> PaperTransport {
        PaperTransport::new(PaperConfig::default())
    }

    #[tokio::test]
    async fn test_market_order_opens_position() {
        let transport = paper();
        transport.set_mark_price("BTC", 50000.0).await;

        let request = OrderRequest {
            symbol: "BTC".to_string(),
            side: OrderSide::Buy,
            size: 0.01,
            price: None,
            kind: OrderKind::Market,
            reduce_only: false,
            time_in_force: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };
        transport.submit_order(&request).await.unwrap();

        let positions = transport.fetch_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].side, PositionSide::Long);
        assert!((positions[0].quantity - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_reduce_only_without_position_rejected() {
        let transport = paper();
        transport.set_mark_price("BTC", 50000.0).await;

        let request = OrderRequest::reduce_only_market("BTC", OrderSide::Sell, 0.01);
        let err = transport.submit_order(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn test_off_tick_stop_price_rejected() {
        let transport = paper();
        transport.set_mark_price("BTC", 50000.0).await;
        transport
            .submit_order(&OrderRequest {
                symbol: "BTC".to_string(),
                side: OrderSide::Buy,
                size: 0.01,
                price: None,
                kind: OrderKind::Market,
                reduce_only: false,
                time_in_force: None,
                take_profit: None,
                stop_loss: None,
                client_order_id: None,
            })
            .await
            .unwrap();

        // tick_size = 0.1，51000.05 未对齐
        let stop = OrderRequest {
            symbol: "BTC".to_string(),
            side: OrderSide::Sell,
            size: 0.01,
            price: Some(51000.05),
            kind: OrderKind::TakeProfit,
            reduce_only: true,
            time_in_force: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };
        let err = transport.submit_order(&stop).await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn test_stop_order_wrong_side_rejected() {
        let transport = paper();
        transport.set_mark_price("BTC", 50000.0).await;
        transport
            .submit_order(&OrderRequest {
                symbol: "BTC".to_string(),
                side: OrderSide::Buy,
                size: 0.01,
                price: None,
                kind: OrderKind::Market,
                reduce_only: false,
                time_in_force: None,
                take_profit: None,
                stop_loss: None,
                client_order_id: None,
            })
            .await
            .unwrap();

        // 多头持仓的止损单必须是卖方向
        let stop = OrderRequest {
            symbol: "BTC".to_string(),
            side: OrderSide::Buy,
            size: 0.01,
            price: Some(49000.0),
            kind: OrderKind::StopLoss,
            reduce_only: true,
            time_in_force: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };
        let err = transport.submit_order(&stop).await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderRejected(_)));
    }

    #[tokio::test]
    async fn test_reduce_realizes_pnl() {
        let transport = paper();
        transport.set_mark_price("BTC", 50000.0).await;
        transport
            .submit_order(&OrderRequest {
                symbol: "BTC".to_string(),
                side: OrderSide::Buy,
                size: 0.02,
                price: None,
                kind: OrderKind::Market,
                reduce_only: false,
                time_in_force: None,
                take_profit: None,
                stop_loss: None,
                client_order_id: None,
            })
            .await
            .unwrap();

        transport.set_mark_price("BTC", 51000.0).await;
        transport
            .submit_order(&OrderRequest::reduce_only_market(
                "BTC",
                OrderSide::Sell,
                0.01,
            ))
            .await
            .unwrap();

        let pnl = transport.realized_pnl().await;
        assert!((pnl - 10.0).abs() < 1e-6);

        let positions = transport.fetch_positions().await.unwrap();
        assert!((positions[0].quantity - 0.01).abs() < 1e-12);
    }
}
