//! 配置模块
//!
//! 所有阈值（保证金分级、偏离撤单比例、限流窗口等）都是运营
//! 调优值而非协议常量，一律走配置并给出缺省；经济上反向的
//! 配置（止盈不大于止损）在启动时直接拒绝，绝不静默兜底。

use crate::core::error::GatewayError;
use crate::core::gateway::GatewayConfig;
use crate::core::types::Result;
use crate::engine::EngineConfig;
use crate::risk::auto_close::AutoCloseConfig;
use crate::risk::emergency::EmergencyConfig;
use crate::risk::margin_guard::MarginGuardConfig;
use crate::risk::protection::ProtectionConfig;
use crate::risk::session::SessionLimits;
use crate::utils::notify::NotifyConfig;
use serde::Deserialize;
use std::fs;

/// 风控各层配置
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskSettings {
    #[serde(default)]
    pub margin_guard: MarginGuardConfig,
    #[serde(default)]
    pub auto_close: AutoCloseConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub session: SessionLimits,
}

/// 完整的机器人配置
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub notify: NotifyConfig,
    /// 日志级别（INFO/DEBUG/...）
    #[serde(default = "BotConfig::default_log_level")]
    pub log_level: String,
}

impl BotConfig {
    fn default_log_level() -> String {
        "INFO".to_string()
    }

    /// 从YAML文件加载配置
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| GatewayError::ConfigError(format!("读取配置文件失败: {}", e)))?;
        let config: BotConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// 启动时校验；任何一条不通过都阻止启动
    pub fn validate(&self) -> Result<()> {
        if self.engine.symbols.is_empty() {
            return Err(GatewayError::ConfigError(
                "至少需要配置一个交易对".to_string(),
            ));
        }

        // 止盈必须严格大于止损
        self.risk.protection.validate()?;

        // 紧急线必须比主止损更宽，否则最后防线会抢在主防线前触发
        if self.risk.emergency.enabled
            && self.risk.emergency.stop_loss_pct <= self.risk.protection.stop_loss_pct
        {
            return Err(GatewayError::ConfigError(format!(
                "紧急止损 {:.2}% 必须大于主止损 {:.2}%",
                self.risk.emergency.stop_loss_pct, self.risk.protection.stop_loss_pct
            )));
        }

        if self.risk.auto_close.max_position_value <= 0.0 {
            return Err(GatewayError::ConfigError(
                "持仓价值上限必须大于0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.risk.auto_close.close_percentage) {
            return Err(GatewayError::ConfigError(
                "强卖比例必须在 0~1 之间".to_string(),
            ));
        }

        // 声明了凭证环境变量就必须真的存在
        if let Some(env_name) = &self.gateway.api_key_env {
            if std::env::var(env_name).is_err() {
                return Err(GatewayError::ConfigError(format!(
                    "缺少凭证环境变量 {}",
                    env_name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
engine:
  symbols: ["BTC"]
"#
    }

    #[test]
    fn test_minimal_config_with_defaults() {
        let config: BotConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.loop_interval_secs, 3);
        assert_eq!(config.gateway.min_call_spacing_ms, 1200);
        assert_eq!(config.risk.margin_guard.cancel_threshold_pct, 20.0);
        assert_eq!(config.risk.margin_guard.reduce_threshold_pct, 10.0);
    }

    #[test]
    fn test_rejects_tp_not_above_sl() {
        let yaml = r#"
engine:
  symbols: ["BTC"]
risk:
  protection:
    take_profit_pct: 1.0
    stop_loss_pct: 1.5
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, GatewayError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_emergency_tighter_than_primary() {
        let yaml = r#"
engine:
  symbols: ["BTC"]
risk:
  protection:
    take_profit_pct: 3.0
    stop_loss_pct: 1.5
  emergency:
    stop_loss_pct: 1.0
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_symbols() {
        let yaml = r#"
engine:
  symbols: []
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_missing_credentials_env() {
        let yaml = r#"
engine:
  symbols: ["BTC"]
gateway:
  api_key_env: "DEFINITELY_MISSING_ENV_VAR_12345"
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_alias_parses_in_yaml() {
        let yaml = r#"
engine:
  symbols: ["BTC"]
risk:
  auto_close:
    policy: "conservative"
  session:
    action: "cooldown"
"#;
        let config: BotConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.risk.auto_close.policy,
            crate::risk::auto_close::AutoClosePolicy::CancelOrders
        );
        assert_eq!(
            config.risk.session.action,
            crate::risk::session::SessionAction::Pause
        );
    }
}
