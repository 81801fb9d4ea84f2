//! 通知推送模块
//! 防护动作的尽力而为通知：推送失败绝不阻塞或延迟交易逻辑本身

use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 通知配置
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// webhook 地址，留空则只落盘
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    /// 最小推送级别
    #[serde(default = "NotifyConfig::default_min_level")]
    pub min_level: String,
    /// 同一事件键的推送间隔限制（秒）
    #[serde(default = "NotifyConfig::default_rate_limit")]
    pub rate_limit_seconds: u64,
    /// 推送失败时的本地落盘文件
    #[serde(default = "NotifyConfig::default_fallback")]
    pub fallback_log: String,
}

impl NotifyConfig {
    fn default_min_level() -> String {
        "warning".to_string()
    }

    fn default_rate_limit() -> u64 {
        60
    }

    fn default_fallback() -> String {
        "logs/notify_fallback.log".to_string()
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            enabled: false,
            min_level: Self::default_min_level(),
            rate_limit_seconds: Self::default_rate_limit(),
            fallback_log: Self::default_fallback(),
        }
    }
}

/// 消息级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageLevel {
    Info = 0,
    Warning = 1,
    Error = 2,
    Critical = 3,
}

impl MessageLevel {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "info" => Self::Info,
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            _ => Self::Warning,
        }
    }

    pub fn emoji(&self) -> &str {
        match self {
            Self::Info => "ℹ️",
            Self::Warning => "⚠️",
            Self::Error => "❌",
            Self::Critical => "🚨",
        }
    }
}

/// 通知器
pub struct Notifier {
    config: NotifyConfig,
    client: Client,
    /// 事件键 -> 上次推送时间，用于限流
    last_send_times: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl Notifier {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            last_send_times: RwLock::new(HashMap::new()),
        }
    }

    /// 发送事件通知（同步等待，主要供内部与测试使用）
    pub async fn send_event(&self, key: &str, title: &str, body: &str, level: MessageLevel) {
        let min_level = MessageLevel::from_str(&self.config.min_level);
        if level < min_level {
            return;
        }

        if !self.check_rate_limit(key).await {
            debug!("跳过推送，限流中: {}", key);
            return;
        }

        let content = format!(
            "{} **{}**\n{}\n> {}",
            level.emoji(),
            title,
            body,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );

        let url = match (self.config.enabled, self.config.webhook_url.as_deref()) {
            (true, Some(url)) => url,
            _ => {
                self.write_fallback(&content);
                return;
            }
        };
        let payload = serde_json::json!({
            "msgtype": "markdown",
            "markdown": { "content": content },
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("通知已推送: {}", title);
            }
            Ok(response) => {
                warn!("通知推送被拒 ({}): {}", response.status(), title);
                self.write_fallback(&content);
            }
            Err(err) => {
                warn!("通知推送失败: {}", err);
                self.write_fallback(&content);
            }
        }
    }

    /// 发射后不管：防护动作调用这个入口，永不等待推送结果
    pub fn notify_detached(
        self: &Arc<Self>,
        key: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        level: MessageLevel,
    ) {
        let notifier = self.clone();
        let key = key.into();
        let title = title.into();
        let body = body.into();
        tokio::spawn(async move {
            notifier.send_event(&key, &title, &body, level).await;
        });
    }

    async fn check_rate_limit(&self, key: &str) -> bool {
        let now = Utc::now();
        let mut times = self.last_send_times.write().await;
        if let Some(last) = times.get(key) {
            let elapsed = (now - *last).num_seconds();
            if elapsed < self.config.rate_limit_seconds as i64 {
                return false;
            }
        }
        times.insert(key.to_string(), now);
        true
    }

    /// 本地落盘兜底
    fn write_fallback(&self, content: &str) {
        let path = PathBuf::from(&self.config.fallback_log);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{}", content.replace('\n', " | ")));
        if let Err(err) = result {
            warn!("通知落盘失败 {}: {}", path.display(), err);
        }
    }
}
