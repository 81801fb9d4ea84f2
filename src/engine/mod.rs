//! 交易引擎模块
//!
//! 单一主循环驱动所有周期性检查；每个交易对有自己的临界区，
//! "读权威状态 -> 决策 -> 变更"在临界区内对该交易对原子，
//! 不同交易对互不阻塞。仪表盘等并发操作方通过同一把锁进出。

use crate::core::error::FailureClass;
use crate::core::gateway::GatewayAdapter;
use crate::core::sync::{StateSynchronizer, SymbolState};
use crate::core::types::{
    AccountState, Order, OrderRequest, Position, Result,
};
use crate::risk::auto_close::AutoCloseLimiter;
use crate::risk::emergency::EmergencyStopLoss;
use crate::risk::margin_guard::{GuardAction, MarginGuard};
use crate::risk::protection::{CoverageState, ProtectionEngine};
use crate::risk::session::{SessionLimits, SessionRiskManager, SessionStatus};
use crate::utils::notify::{MessageLevel, Notifier};
use crate::utils::order_id::OrderIdGenerator;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// 下单计划接口
///
/// 网格间距、动量打分等进场信号逻辑在此接口之外实现；
/// 引擎只负责把计划出的订单安全地送进交易所。
#[async_trait]
pub trait OrderPlanner: Send + Sync {
    async fn plan(
        &self,
        symbol: &str,
        mark_price: f64,
        state: &SymbolState,
    ) -> Result<Vec<OrderRequest>>;
}

/// 不产生任何订单的计划器，用于纯防护模式
pub struct IdlePlanner;

#[async_trait]
impl OrderPlanner for IdlePlanner {
    async fn plan(
        &self,
        _symbol: &str,
        _mark_price: f64,
        _state: &SymbolState,
    ) -> Result<Vec<OrderRequest>> {
        Ok(Vec::new())
    }
}

/// 引擎配置
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    #[serde(default = "EngineConfig::default_interval")]
    pub loop_interval_secs: u64,
}

impl EngineConfig {
    fn default_interval() -> u64 {
        3
    }
}

/// 对仪表盘暴露的状态快照
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub symbol: String,
    pub position: Option<Position>,
    pub orders: Vec<Order>,
    pub mark_price: f64,
    pub account: Option<AccountState>,
    pub coverage: Option<CoverageState>,
    pub session_status: SessionStatus,
    pub accumulated_pnl: f64,
}

/// 交易引擎
pub struct TradingEngine {
    config: EngineConfig,
    gateway: Arc<GatewayAdapter>,
    planner: Arc<dyn OrderPlanner>,
    guard: MarginGuard,
    limiter: AutoCloseLimiter,
    protection: ProtectionEngine,
    session: Mutex<SessionRiskManager>,
    emergency: Arc<EmergencyStopLoss>,
    notifier: Arc<Notifier>,
    /// 交易对 -> 临界区保护的本地状态
    states: HashMap<String, Arc<Mutex<SymbolState>>>,
    order_ids: OrderIdGenerator,
    cycle: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        gateway: Arc<GatewayAdapter>,
        planner: Arc<dyn OrderPlanner>,
        guard: MarginGuard,
        limiter: AutoCloseLimiter,
        protection: ProtectionEngine,
        session: SessionRiskManager,
        emergency: Arc<EmergencyStopLoss>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let states = config
            .symbols
            .iter()
            .map(|s| (s.clone(), Arc::new(Mutex::new(SymbolState::new(s.clone())))))
            .collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            gateway,
            planner,
            guard,
            limiter,
            protection,
            session: Mutex::new(session),
            emergency,
            notifier,
            states,
            order_ids: OrderIdGenerator::new("pacgrid"),
            cycle: AtomicU64::new(0),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// 紧急看门狗的关闭信号接收端
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// 请求引擎退出
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// 主循环
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.loop_interval_secs,
        ));
        let mut shutdown = self.shutdown_rx.clone();
        log::info!(
            "交易引擎启动: {:?}, 轮询间隔 {}s",
            self.config.symbols,
            self.config.loop_interval_secs
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.run_cycle().await == CycleVerdict::Stopped {
                        log::info!("会话已终止，交易引擎退出");
                        self.request_shutdown();
                        return Ok(());
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("收到停止信号，交易引擎退出");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 跑完一轮所有交易对
    pub async fn run_cycle(&self) -> CycleVerdict {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut session = self.session.lock().await;
            session.tick();
            if *session.status() == SessionStatus::Stopped {
                return CycleVerdict::Stopped;
            }
        }

        for symbol in &self.config.symbols {
            if let Err(err) = self.process_symbol(symbol, cycle).await {
                // 瞬时失败只跳过本轮，状态留待下一轮重新评估
                log::warn!("{} 本轮处理失败: {}", symbol, err);
            }
        }

        CycleVerdict::Continue
    }

    /// 单个交易对的一轮处理，整体处于该交易对的临界区内
    async fn process_symbol(&self, symbol: &str, cycle: u64) -> Result<()> {
        let state_lock = match self.states.get(symbol) {
            Some(lock) => lock.clone(),
            None => return Ok(()),
        };
        let mut state = state_lock.lock().await;

        let report = StateSynchronizer::sync(&self.gateway, &mut state).await?;

        // 平仓结算：周期级与会话级熔断都在这里被评估
        if let Some(closed) = &report.closed_position {
            let mut session = self.session.lock().await;
            let decision = session.on_cycle_closed(
                symbol,
                closed.unrealized_pnl,
                closed.raw_pnl_pct(),
            );
            if decision.rebuild_grid {
                self.notifier.notify_detached(
                    format!("cycle::{}", symbol),
                    format!("{} 周期熔断", symbol),
                    format!("周期盈亏 {:.2}，网格将在当前价位重建", closed.unrealized_pnl),
                    MessageLevel::Warning,
                );
            }
        }

        // 孤儿持仓在同一轮内就要获得保护评估
        if state.pending_orphan_check {
            state.pending_orphan_check = false;
            self.protection
                .ensure_coverage(&self.gateway, &mut state, cycle)
                .await?;
            match self.emergency.check_symbol(symbol).await {
                Ok(Some(trigger)) => {
                    self.notifier.notify_detached(
                        format!("orphan::{}", symbol),
                        format!("{} 孤儿持仓触发紧急处置", symbol),
                        format!("{:?}", trigger),
                        MessageLevel::Critical,
                    );
                    return Ok(());
                }
                Ok(None) => {}
                Err(err) => log::warn!("{} 孤儿紧急检查失败: {}", symbol, err),
            }
        } else {
            self.protection
                .ensure_coverage(&self.gateway, &mut state, cycle)
                .await?;
        }

        // 仓位上限处置
        match self
            .limiter
            .check_position_size(&self.gateway, &mut state, &self.guard)
            .await
        {
            Ok(true) => {
                self.notifier.notify_detached(
                    format!("auto_close::{}", symbol),
                    format!("{} 仓位超限已处置", symbol),
                    format!("策略 {:?}", self.limiter.policy()),
                    MessageLevel::Warning,
                );
            }
            Ok(false) => {}
            Err(err) => log::warn!("{} 仓位上限检查失败: {}", symbol, err),
        }

        // 暂停/停止状态下跳过全部下单逻辑，但上面的防护已经执行
        if !self.session.lock().await.can_place_orders() {
            log::debug!("{} 会话非活跃，跳过下单", symbol);
            return Ok(());
        }

        self.place_planned_orders(symbol, &mut state).await
    }

    /// 下单前保证金预检 + 批量下单（首个保证金拒单即中止整批）
    async fn place_planned_orders(
        &self,
        symbol: &str,
        state: &mut SymbolState,
    ) -> Result<()> {
        // 预检在每次下单尝试之前执行，而不是只靠定时器
        let action = self.guard.check_margin_safety(&self.gateway, state).await?;
        match &action {
            GuardAction::None => {}
            GuardAction::CanceledDistantOrders { count, freed_notional } => {
                self.notifier.notify_detached(
                    format!("margin::{}", symbol),
                    format!("{} 一级保证金防护", symbol),
                    format!("撤单 {} 笔，释放名义 {:.2}", count, freed_notional),
                    MessageLevel::Warning,
                );
            }
            GuardAction::ReducedPosition { quantity } => {
                self.notifier.notify_detached(
                    format!("margin::{}", symbol),
                    format!("{} 二级保证金防护", symbol),
                    format!("强制减仓 {:.6}", quantity),
                    MessageLevel::Critical,
                );
                // 刚被迫减仓，本轮不再加新单
                return Ok(());
            }
        }

        let planned = self
            .planner
            .plan(symbol, state.mark_price, state)
            .await?;

        for mut request in planned {
            if request.client_order_id.is_none() {
                request.client_order_id = Some(self.order_ids.generate("G"));
            }
            match self.gateway.create_order(&request).await {
                Ok(result) => {
                    log::debug!("{} 计划单已提交: {}", symbol, result.order_id);
                }
                Err(err) if err.class() == FailureClass::Validation => {
                    // 保证金不足等拒单：立即中止剩余批次，等下一轮重新评估
                    log::warn!("{} 计划单被拒，中止本批剩余下单: {}", symbol, err);
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    // ============= 仪表盘接口 =============

    /// 状态快照；与主循环走同一把交易对锁
    pub async fn snapshot(&self, symbol: &str) -> Option<EngineSnapshot> {
        let state_lock = self.states.get(symbol)?.clone();
        let state = state_lock.lock().await;

        let account = self.gateway.get_account_info().await.ok();
        let coverage = self.protection.coverage_state(symbol).await;
        let session = self.session.lock().await;

        Some(EngineSnapshot {
            symbol: symbol.to_string(),
            position: state.position.clone(),
            orders: state.orders.values().cloned().collect(),
            mark_price: state.mark_price,
            account,
            coverage,
            session_status: session.status().clone(),
            accumulated_pnl: session.state().accumulated_pnl,
        })
    }

    /// 控制面：暂停新下单
    pub async fn pause(&self, minutes: u64) {
        self.session.lock().await.pause_for(minutes);
        log::info!("控制面: 已暂停 {} 分钟", minutes);
    }

    /// 控制面：恢复
    pub async fn resume(&self) {
        self.session.lock().await.resume();
        log::info!("控制面: 已恢复");
    }

    /// 控制面：强制平掉一个交易对的持仓
    ///
    /// 与主循环互斥，不会和同一交易对的自动下单交错。
    pub async fn force_close(&self, symbol: &str) -> Result<bool> {
        let state_lock = match self.states.get(symbol) {
            Some(lock) => lock.clone(),
            None => return Ok(false),
        };
        let mut state = state_lock.lock().await;

        // 以权威持仓为准
        let positions = self.gateway.get_positions(symbol).await?;
        let position = match positions.into_iter().next() {
            Some(p) => p,
            None => {
                state.position = None;
                return Ok(false);
            }
        };

        let info = self.gateway.get_symbol_info(symbol).await?;
        let qty =
            crate::core::quantize::quantize_quantity(position.quantity, info.lot_size);
        let request = OrderRequest::reduce_only_market(
            symbol.to_string(),
            position.side.closing_order_side(),
            qty,
        );
        self.gateway.create_order(&request).await?;

        self.notifier.notify_detached(
            format!("force_close::{}", symbol),
            format!("{} 手动强制平仓", symbol),
            format!("{} {:.6} @ 市价", position.side, qty),
            MessageLevel::Critical,
        );
        Ok(true)
    }

    /// 控制面：替换会话级限额
    pub async fn update_session_limits(&self, limits: SessionLimits) {
        let mut session = self.session.lock().await;
        *session = SessionRiskManager::new(limits);
        log::info!("控制面: 会话限额已更新（统计清零重新起算）");
    }
}

/// 一轮循环后的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleVerdict {
    Continue,
    Stopped,
}
