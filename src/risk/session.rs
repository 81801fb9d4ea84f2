//! 周期/会话两级盈亏熔断模块
//!
//! 周期级：每次平仓结算时评估单周期盈亏，越界则把该交易对的
//! 网格推倒重建。会话级：对开始以来的累计盈亏持续评估，越界
//! 执行 pause（暂停新下单，防护层继续运行）或 shutdown（终止）。
//!
//! 状态转移: ACTIVE -> PAUSED -> ACTIVE | ACTIVE/PAUSED -> STOPPED

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

/// 会话越界时执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum SessionAction {
    Pause,
    Shutdown,
}

impl SessionAction {
    pub fn resolve(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "pause" | "wait" | "cooldown" => Some(SessionAction::Pause),
            "shutdown" | "stop" | "halt" => Some(SessionAction::Shutdown),
            _ => None,
        }
    }
}

impl TryFrom<String> for SessionAction {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        SessionAction::resolve(&value).ok_or_else(|| format!("未知的会话动作: {}", value))
    }
}

/// 会话风控配置
#[derive(Debug, Clone, Deserialize)]
pub struct SessionLimits {
    /// 单周期止损比例（%）
    #[serde(default = "SessionLimits::default_cycle_sl")]
    pub cycle_stop_loss_pct: f64,
    /// 单周期止盈比例（%）
    #[serde(default = "SessionLimits::default_cycle_tp")]
    pub cycle_take_profit_pct: f64,
    /// 会话累计最大亏损（USD）
    #[serde(default)]
    pub max_session_loss_usd: Option<f64>,
    /// 会话累计最大亏损（初始净值的%）
    #[serde(default)]
    pub max_session_loss_pct: Option<f64>,
    /// 会话盈利目标（USD）
    #[serde(default)]
    pub profit_target_usd: Option<f64>,
    /// 会话盈利目标（初始净值的%）
    #[serde(default)]
    pub profit_target_pct: Option<f64>,
    #[serde(default = "SessionLimits::default_action")]
    pub action: SessionAction,
    /// pause 动作的暂停时长（分钟）
    #[serde(default = "SessionLimits::default_pause_minutes")]
    pub pause_minutes: u64,
    /// 百分比限额的基准净值
    #[serde(default = "SessionLimits::default_equity")]
    pub initial_equity: f64,
    /// 会话事件审计文件（JSON lines）
    #[serde(default)]
    pub history_file: Option<String>,
}

impl SessionLimits {
    fn default_cycle_sl() -> f64 {
        1.0
    }

    fn default_cycle_tp() -> f64 {
        2.0
    }

    fn default_action() -> SessionAction {
        SessionAction::Pause
    }

    fn default_pause_minutes() -> u64 {
        30
    }

    fn default_equity() -> f64 {
        10000.0
    }

    /// 亏损上限（USD），两种表达取更严格的一个
    fn loss_limit_usd(&self) -> Option<f64> {
        let from_pct = self
            .max_session_loss_pct
            .map(|pct| self.initial_equity * pct / 100.0);
        match (self.max_session_loss_usd, from_pct) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn profit_limit_usd(&self) -> Option<f64> {
        let from_pct = self
            .profit_target_pct
            .map(|pct| self.initial_equity * pct / 100.0);
        match (self.profit_target_usd, from_pct) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            cycle_stop_loss_pct: Self::default_cycle_sl(),
            cycle_take_profit_pct: Self::default_cycle_tp(),
            max_session_loss_usd: Some(500.0),
            max_session_loss_pct: None,
            profit_target_usd: None,
            profit_target_pct: None,
            action: Self::default_action(),
            pause_minutes: Self::default_pause_minutes(),
            initial_equity: Self::default_equity(),
            history_file: None,
        }
    }
}

/// 会话运行状态
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Active,
    Paused { until: DateTime<Utc> },
    /// 终态
    Stopped,
}

/// 会话统计
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub cycles_closed: u64,
    pub cycles_profit: u64,
    pub cycles_loss: u64,
    pub accumulated_pnl: f64,
    pub session_start_time: DateTime<Utc>,
}

/// 周期结算结果
#[derive(Debug, Clone, PartialEq)]
pub struct CycleDecision {
    /// 单周期越界，网格需要在当前价位重建
    pub rebuild_grid: bool,
    pub profitable: bool,
}

/// 周期/会话风控管理器
///
/// SessionState 只允许本管理器修改。
pub struct SessionRiskManager {
    limits: SessionLimits,
    state: SessionState,
    status: SessionStatus,
    history_path: Option<PathBuf>,
}

impl SessionRiskManager {
    pub fn new(limits: SessionLimits) -> Self {
        let history_path = limits.history_file.as_ref().map(PathBuf::from);
        Self {
            limits,
            state: SessionState {
                cycles_closed: 0,
                cycles_profit: 0,
                cycles_loss: 0,
                accumulated_pnl: 0.0,
                session_start_time: Utc::now(),
            },
            status: SessionStatus::Active,
            history_path,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// 只有 ACTIVE 状态允许新下单；暂停/停止期间防护层照常运行
    pub fn can_place_orders(&self) -> bool {
        matches!(self.status, SessionStatus::Active)
    }

    /// 每轮调用：暂停到期自动恢复
    pub fn tick(&mut self) -> &SessionStatus {
        if let SessionStatus::Paused { until } = self.status {
            if Utc::now() >= until {
                log::info!("✅ 会话暂停期结束，恢复交易");
                self.append_history("resume", None, 0.0);
                self.status = SessionStatus::Active;
            }
        }
        &self.status
    }

    /// 平仓结算入口：评估周期级熔断并累计到会话
    pub fn on_cycle_closed(
        &mut self,
        symbol: &str,
        realized_pnl: f64,
        pnl_pct: f64,
    ) -> CycleDecision {
        self.state.cycles_closed += 1;
        let profitable = realized_pnl >= 0.0;
        if profitable {
            self.state.cycles_profit += 1;
        } else {
            self.state.cycles_loss += 1;
        }
        self.state.accumulated_pnl += realized_pnl;

        let rebuild_grid = pnl_pct <= -self.limits.cycle_stop_loss_pct
            || pnl_pct >= self.limits.cycle_take_profit_pct;

        log::info!(
            "{} 周期结算: pnl {:.2} ({:.2}%) 累计 {:.2} [{}盈/{}亏]{}",
            symbol,
            realized_pnl,
            pnl_pct,
            self.state.accumulated_pnl,
            self.state.cycles_profit,
            self.state.cycles_loss,
            if rebuild_grid { "，网格将重建" } else { "" }
        );
        self.append_history(
            if profitable { "cycle_profit" } else { "cycle_loss" },
            Some(symbol),
            realized_pnl,
        );

        self.evaluate_session();

        CycleDecision {
            rebuild_grid,
            profitable,
        }
    }

    /// 会话级熔断评估
    fn evaluate_session(&mut self) {
        if self.status == SessionStatus::Stopped {
            return;
        }

        let pnl = self.state.accumulated_pnl;

        let breached = if let Some(limit) = self.limits.loss_limit_usd() {
            if pnl <= -limit {
                log::error!("❌ 会话累计亏损 {:.2} 触达上限 {:.2}", pnl, limit);
                true
            } else {
                false
            }
        } else {
            false
        };

        let target_hit = if let Some(target) = self.limits.profit_limit_usd() {
            if pnl >= target {
                log::info!("🎯 会话累计盈利 {:.2} 达到目标 {:.2}", pnl, target);
                true
            } else {
                false
            }
        } else {
            false
        };

        if !breached && !target_hit {
            return;
        }

        match self.limits.action {
            SessionAction::Pause => {
                let until = Utc::now() + Duration::minutes(self.limits.pause_minutes as i64);
                log::warn!(
                    "⚠️ 会话熔断: 暂停新下单 {} 分钟（既有持仓保护不受影响）",
                    self.limits.pause_minutes
                );
                self.append_history("pause", None, pnl);
                self.status = SessionStatus::Paused { until };
            }
            SessionAction::Shutdown => {
                log::error!("⛔ 会话熔断: 停止交易循环");
                self.append_history("shutdown", None, pnl);
                self.status = SessionStatus::Stopped;
            }
        }
    }

    /// 控制面：手动暂停
    pub fn pause_for(&mut self, minutes: u64) {
        if self.status == SessionStatus::Stopped {
            return;
        }
        let until = Utc::now() + Duration::minutes(minutes as i64);
        self.append_history("manual_pause", None, self.state.accumulated_pnl);
        self.status = SessionStatus::Paused { until };
    }

    /// 控制面：手动恢复
    pub fn resume(&mut self) {
        if matches!(self.status, SessionStatus::Paused { .. }) {
            self.append_history("manual_resume", None, self.state.accumulated_pnl);
            self.status = SessionStatus::Active;
        }
    }

    /// 控制面：手动停止（终态）
    pub fn stop(&mut self) {
        self.append_history("manual_stop", None, self.state.accumulated_pnl);
        self.status = SessionStatus::Stopped;
    }

    /// 追加一条审计记录；文件写失败不影响风控本身
    fn append_history(&self, event: &str, symbol: Option<&str>, pnl: f64) {
        let path = match &self.history_path {
            Some(p) => p.clone(),
            None => return,
        };

        let line = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "symbol": symbol,
            "pnl": pnl,
            "accumulated_pnl": self.state.accumulated_pnl,
            "cycles_closed": self.state.cycles_closed,
        });

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{}", line));

        if let Err(err) = result {
            log::warn!("会话审计写入失败 {}: {}", path.display(), err);
        }
    }
}
