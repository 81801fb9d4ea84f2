//! 紧急止损模块（最后防线）
//!
//! 独立于其他所有防护层的看门狗：自己拉取权威持仓、自己用原始
//! 入场价/现价算盈亏、按自己的短周期轮询。即使覆盖引擎失效、
//! 网关拒绝原生保护单、主循环卡死，这一层也必须仍然工作。

use crate::core::error::FailureClass;
use crate::core::gateway::GatewayAdapter;
use crate::core::quantize::quantize_quantity;
use crate::core::types::{OrderKind, OrderRequest, Position, Result, TimeInForce};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// 亏损计时的清零策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LossResetPolicy {
    /// 任何一次向好的价格跳动都重置计时
    AnyFavorableTick,
    /// 只有盈亏回到非负才重置计时
    Breakeven,
}

impl LossResetPolicy {
    pub fn resolve(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "any_favorable_tick" | "favorable_tick" | "tick" => {
                Some(LossResetPolicy::AnyFavorableTick)
            }
            "breakeven" | "break_even" | "nonnegative" => Some(LossResetPolicy::Breakeven),
            _ => None,
        }
    }
}

impl TryFrom<String> for LossResetPolicy {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        LossResetPolicy::resolve(&value)
            .ok_or_else(|| format!("未知的亏损计时策略: {}", value))
    }
}

/// 紧急止损配置
#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 紧急止损比例（%），应严格比主止损更宽（通常2倍）
    #[serde(default = "EmergencyConfig::default_sl")]
    pub stop_loss_pct: f64,
    /// 极端盈利保护比例（%），防止巨幅浮盈回吐
    #[serde(default = "EmergencyConfig::default_tp")]
    pub take_profit_pct: f64,
    /// 连续亏损超过该分钟数即强平
    #[serde(default = "EmergencyConfig::default_minutes")]
    pub max_time_in_loss_minutes: u64,
    /// 看门狗轮询间隔（秒）
    #[serde(default = "EmergencyConfig::default_poll")]
    pub poll_interval_secs: u64,
    #[serde(default = "EmergencyConfig::default_reset")]
    pub loss_reset: LossResetPolicy,
}

fn default_true() -> bool {
    true
}

impl EmergencyConfig {
    fn default_sl() -> f64 {
        2.0
    }

    fn default_tp() -> f64 {
        10.0
    }

    fn default_minutes() -> u64 {
        90
    }

    fn default_poll() -> u64 {
        5
    }

    fn default_reset() -> LossResetPolicy {
        LossResetPolicy::Breakeven
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stop_loss_pct: Self::default_sl(),
            take_profit_pct: Self::default_tp(),
            max_time_in_loss_minutes: Self::default_minutes(),
            poll_interval_secs: Self::default_poll(),
            loss_reset: Self::default_reset(),
        }
    }
}

/// 触发原因
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyTrigger {
    StopLoss { pnl_pct: f64 },
    TimeInLoss { minutes: i64 },
    ExtremeProfit { pnl_pct: f64 },
}

#[derive(Debug)]
struct LossTrack {
    loss_since: Option<DateTime<Utc>>,
    last_pnl_pct: f64,
}

/// 紧急止损看门狗
pub struct EmergencyStopLoss {
    config: EmergencyConfig,
    gateway: Arc<GatewayAdapter>,
    symbols: Vec<String>,
    tracks: Mutex<HashMap<String, LossTrack>>,
}

impl EmergencyStopLoss {
    pub fn new(
        config: EmergencyConfig,
        gateway: Arc<GatewayAdapter>,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            config,
            gateway,
            symbols,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    /// 看门狗主循环，作为独立任务运行
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            log::info!("紧急止损已禁用");
            return;
        }

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.config.poll_interval_secs));
        log::info!(
            "紧急止损看门狗启动: SL {:.1}% / TP {:.1}% / 亏损限时 {} 分钟",
            self.config.stop_loss_pct,
            self.config.take_profit_pct,
            self.config.max_time_in_loss_minutes
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for symbol in &self.symbols {
                        if let Err(err) = self.check_symbol(symbol).await {
                            // 看门狗自身绝不因单次失败退出
                            log::warn!("紧急止损检查 {} 失败: {}", symbol, err);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("紧急止损看门狗退出");
                        return;
                    }
                }
            }
        }
    }

    /// 检查一个交易对，必要时强平；返回触发原因
    pub async fn check_symbol(&self, symbol: &str) -> Result<Option<EmergencyTrigger>> {
        let positions = self.gateway.get_positions(symbol).await?;
        let position = match positions.into_iter().next() {
            Some(p) => p,
            None => {
                self.tracks.lock().await.remove(symbol);
                return Ok(None);
            }
        };

        // 独立计算盈亏，不信任其他层缓存的字段
        let mark = self.gateway.get_mark_price(symbol).await?;
        let pnl_pct = raw_pnl_pct(&position, mark);
        let loss_minutes = self.update_loss_clock(symbol, pnl_pct).await;

        let trigger = if pnl_pct <= -self.config.stop_loss_pct {
            Some(EmergencyTrigger::StopLoss { pnl_pct })
        } else if pnl_pct >= self.config.take_profit_pct {
            Some(EmergencyTrigger::ExtremeProfit { pnl_pct })
        } else if loss_minutes >= self.config.max_time_in_loss_minutes as i64 {
            Some(EmergencyTrigger::TimeInLoss {
                minutes: loss_minutes,
            })
        } else {
            None
        };

        let trigger = match trigger {
            Some(t) => t,
            None => return Ok(None),
        };

        log::error!(
            "🚨 紧急止损触发 {}: {:?} (持仓 {} {:.6} @ {:.4}, 现价 {:.4})",
            symbol,
            trigger,
            position.side,
            position.quantity,
            position.entry_price,
            mark
        );

        self.force_close(symbol, &position).await?;
        self.tracks.lock().await.remove(symbol);
        Ok(Some(trigger))
    }

    /// 更新亏损计时，返回已持续的分钟数
    async fn update_loss_clock(&self, symbol: &str, pnl_pct: f64) -> i64 {
        let mut tracks = self.tracks.lock().await;
        let track = tracks.entry(symbol.to_string()).or_insert(LossTrack {
            loss_since: None,
            last_pnl_pct: 0.0,
        });

        if pnl_pct >= 0.0 {
            track.loss_since = None;
        } else {
            let improved = pnl_pct > track.last_pnl_pct;
            match self.config.loss_reset {
                LossResetPolicy::AnyFavorableTick if improved => {
                    track.loss_since = Some(Utc::now());
                }
                _ => {
                    track.loss_since.get_or_insert_with(Utc::now);
                }
            }
        }
        track.last_pnl_pct = pnl_pct;

        track
            .loss_since
            .map(|since| (Utc::now() - since).num_minutes())
            .unwrap_or(0)
    }

    /// 强平：先试 IOC 立即单，被拒则退回普通常驻单
    async fn force_close(&self, symbol: &str, position: &Position) -> Result<()> {
        let info = self.gateway.get_symbol_info(symbol).await?;
        let qty = quantize_quantity(position.quantity, info.lot_size);
        let side = position.side.closing_order_side();

        let ioc = OrderRequest {
            symbol: symbol.to_string(),
            side,
            size: qty,
            price: None,
            kind: OrderKind::Market,
            reduce_only: true,
            time_in_force: Some(TimeInForce::IOC),
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };

        match self.gateway.create_order(&ioc).await {
            Ok(_) => {
                log::warn!("紧急平仓 {} 已提交 (IOC, qty {:.6})", symbol, qty);
                return Ok(());
            }
            Err(err) if err.class() == FailureClass::Validation => {
                log::warn!("{} IOC 平仓被拒({})，退回常驻单", symbol, err);
            }
            Err(err) => return Err(err),
        }

        let mark = self.gateway.get_mark_price(symbol).await?;
        let resting = OrderRequest {
            symbol: symbol.to_string(),
            side,
            size: qty,
            price: Some(crate::core::quantize::quantize_price(mark, info.tick_size)),
            kind: OrderKind::Limit,
            reduce_only: true,
            time_in_force: Some(TimeInForce::GTC),
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        };
        self.gateway.create_order(&resting).await?;
        log::warn!("紧急平仓 {} 已提交 (常驻限价, qty {:.6})", symbol, qty);
        Ok(())
    }
}

fn raw_pnl_pct(position: &Position, mark: f64) -> f64 {
    if position.entry_price <= 0.0 {
        return 0.0;
    }
    let diff = match position.side {
        crate::core::types::PositionSide::Long => mark - position.entry_price,
        crate::core::types::PositionSide::Short => position.entry_price - mark,
    };
    diff / position.entry_price * 100.0
}
