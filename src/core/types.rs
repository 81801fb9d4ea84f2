use chrono::{DateTime, Utc};
/// 统一的类型定义模块
use serde::{Deserialize, Serialize};

/// 结果类型别名
pub type Result<T> = std::result::Result<T, crate::core::error::GatewayError>;

// ============= 订单相关 =============

/// 订单方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 持仓方向
///
/// 由交易所的开仓方向编码("bid"=做多建仓, "ask"=做空建仓)解析，
/// 绝不从数量符号推断。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// 从交易所方向编码解析
    pub fn from_exchange_side(raw: &str) -> Result<Self> {
        match raw {
            "bid" => Ok(PositionSide::Long),
            "ask" => Ok(PositionSide::Short),
            other => Err(crate::core::error::GatewayError::ParseError(format!(
                "未知的持仓方向编码: {}",
                other
            ))),
        }
    }

    /// 平仓方向：多头用卖单平，空头用买单平
    ///
    /// 止盈止损单必须使用平仓方向，与持仓同向会被网关拒绝。
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "多"),
            PositionSide::Short => write!(f, "空"),
        }
    }
}

/// 订单种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Limit,
    Market,
    ReduceOnly,
    TakeProfit,
    StopLoss,
}

/// 时间有效性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    GTC, // Good Till Cancel
    IOC, // Immediate Or Cancel
    FOK, // Fill Or Kill
}

/// 订单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub kind: OrderKind,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

impl Order {
    /// 订单名义价值
    pub fn notional(&self) -> f64 {
        self.price * self.size
    }

    /// 距离给定市价的相对偏移（比例）
    pub fn distance_from(&self, mark_price: f64) -> f64 {
        if mark_price <= 0.0 {
            return 0.0;
        }
        (self.price - mark_price).abs() / mark_price
    }
}

/// 订单请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub size: f64,
    pub price: Option<f64>,
    pub kind: OrderKind,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    /// 下单时附带的止盈价（网关原子创建止盈单）
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// 下单时附带的止损价
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// 创建一个简单的限价单请求
    pub fn limit(symbol: impl Into<String>, side: OrderSide, size: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size,
            price: Some(price),
            kind: OrderKind::Limit,
            reduce_only: false,
            time_in_force: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        }
    }

    /// 只减仓市价单，用于防护层平仓
    pub fn reduce_only_market(symbol: impl Into<String>, side: OrderSide, size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size,
            price: None,
            kind: OrderKind::Market,
            reduce_only: true,
            time_in_force: None,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        }
    }
}

/// 下单结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    /// 网关原子创建的止盈单ID
    #[serde(default)]
    pub take_profit_order_id: Option<String>,
    /// 网关原子创建的止损单ID
    #[serde(default)]
    pub stop_loss_order_id: Option<String>,
}

// ============= 持仓相关 =============

/// 持仓信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// 数量恒为正，方向由side表达
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub margin_used: f64,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub take_profit_order_id: Option<String>,
    #[serde(default)]
    pub stop_loss_order_id: Option<String>,
    /// 连续处于亏损状态的秒数
    #[serde(default)]
    pub time_in_loss_seconds: u64,
}

impl Position {
    /// 名义敞口 = |数量| × 当前市价
    pub fn notional(&self) -> f64 {
        self.quantity.abs() * self.current_price
    }

    /// 用原始入场价/现价/数量独立计算盈亏比例，不依赖网关返回的字段
    pub fn raw_pnl_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let diff = match self.side {
            PositionSide::Long => self.current_price - self.entry_price,
            PositionSide::Short => self.entry_price - self.current_price,
        };
        diff / self.entry_price * 100.0
    }

    /// 是否已同时挂有止盈和止损
    pub fn fully_protected(&self) -> bool {
        self.take_profit_order_id.is_some() && self.stop_loss_order_id.is_some()
    }
}

// ============= 账户相关 =============

/// 账户状态（已归一化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub equity: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    pub timestamp: DateTime<Utc>,
}

impl AccountState {
    /// 空闲保证金比例（0~100）
    pub fn margin_free_percent(&self) -> f64 {
        if self.equity <= 0.0 {
            return 0.0;
        }
        (self.equity - self.margin_used) / self.equity * 100.0
    }
}

// ============= 交易对元数据 =============

/// 交易对精度信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// 最小价格增量
    pub tick_size: f64,
    /// 最小数量增量
    pub lot_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_side_from_exchange_encoding() {
        assert_eq!(
            PositionSide::from_exchange_side("bid").unwrap(),
            PositionSide::Long
        );
        assert_eq!(
            PositionSide::from_exchange_side("ask").unwrap(),
            PositionSide::Short
        );
        assert!(PositionSide::from_exchange_side("long").is_err());
    }

    #[test]
    fn test_closing_side_is_opposite() {
        assert_eq!(PositionSide::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_order_side(), OrderSide::Buy);
    }

    #[test]
    fn test_raw_pnl_pct() {
        let mut pos = Position {
            symbol: "BTC".to_string(),
            side: PositionSide::Long,
            quantity: 0.5,
            entry_price: 100.0,
            current_price: 110.0,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            margin_used: 10.0,
            opened_at: Utc::now(),
            take_profit_order_id: None,
            stop_loss_order_id: None,
            time_in_loss_seconds: 0,
        };
        assert!((pos.raw_pnl_pct() - 10.0).abs() < 1e-9);

        pos.side = PositionSide::Short;
        assert!((pos.raw_pnl_pct() + 10.0).abs() < 1e-9);
        assert!((pos.notional() - 55.0).abs() < 1e-9);
    }

    #[test]
    fn test_margin_free_percent() {
        let account = AccountState {
            equity: 1000.0,
            available_balance: 850.0,
            margin_used: 150.0,
            timestamp: Utc::now(),
        };
        assert!((account.margin_free_percent() - 85.0).abs() < 1e-9);
    }
}
