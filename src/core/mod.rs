// 核心模块 - 网关适配与状态同步
pub mod circuit;
pub mod config;
pub mod error;
pub mod gateway;
pub mod paper;
pub mod quantize;
pub mod retry;
pub mod symbol_cache;
pub mod sync;
pub mod types;

pub use error::{ErrorSeverity, FailureClass, GatewayError};
pub use gateway::{ExchangeTransport, GatewayAdapter, GatewayConfig};
pub use sync::{StateSynchronizer, SymbolState, SyncReport};
pub use types::{
    AccountState, Order, OrderKind, OrderRequest, OrderResult, OrderSide, Position,
    PositionSide, Result, SymbolInfo, TimeInForce,
};
