pub mod core;
pub mod engine;
pub mod risk;
pub mod utils;

// 选择性导出，避免命名冲突
pub use crate::core::config::{BotConfig, RiskSettings};
pub use crate::core::{
    ExchangeTransport, GatewayAdapter, GatewayConfig, GatewayError, Result, StateSynchronizer,
    SymbolState,
};
pub use engine::{EngineConfig, EngineSnapshot, IdlePlanner, OrderPlanner, TradingEngine};
pub use risk::{
    AutoCloseLimiter, EmergencyStopLoss, MarginGuard, ProtectionEngine, SessionRiskManager,
};
pub use utils::{Notifier, OrderIdGenerator};
