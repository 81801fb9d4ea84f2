use thiserror::Error;

/// 失败类别，决定上层的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 瞬时错误：5xx、网络抖动，有界重试后跳过本轮
    Transient,
    /// 限流：长退避并全局降速
    RateLimit,
    /// 校验/逻辑错误：不盲目重试，修正输入后最多重试一次
    Validation,
    /// 状态分歧：本地缓存与交易所不一致，立即重新同步
    StateDivergence,
    /// 致命配置错误：阻止启动
    Fatal,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("网络请求错误: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("YAML配置错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("网关限流: {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("网关服务错误: {code} - {message}")]
    ServerError { code: i32, message: String },

    #[error("参数校验错误: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("订单被拒绝: {0}")]
    OrderRejected(String),

    #[error("状态分歧: {0}")]
    StateDivergence(String),

    #[error("熔断器打开: {family} 冷却 {cooldown_secs} 秒")]
    CircuitOpen { family: String, cooldown_secs: u64 },

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("交易对未找到: {0}")]
    SymbolNotFound(String),

    #[error("无效价格: {symbol} 返回 {price}")]
    InvalidPrice { symbol: String, price: f64 },

    #[error("响应解析错误: {0}")]
    ParseError(String),

    #[error("超时: 操作 '{operation}' 超过 {timeout_secs} 秒")]
    TimeoutError {
        operation: String,
        timeout_secs: u64,
    },

    #[error("其他错误: {0}")]
    Other(String),
}

impl GatewayError {
    /// 归类错误，供重试执行器和各防护层分支判断
    pub fn class(&self) -> FailureClass {
        match self {
            GatewayError::RateLimited { .. } => FailureClass::RateLimit,
            GatewayError::NetworkError(_)
            | GatewayError::TimeoutError { .. }
            | GatewayError::CircuitOpen { .. }
            | GatewayError::ParseError(_) => FailureClass::Transient,
            GatewayError::ServerError { code, .. } => {
                if *code >= 500 && *code < 600 {
                    FailureClass::Transient
                } else {
                    FailureClass::Validation
                }
            }
            GatewayError::ValidationError { .. }
            | GatewayError::OrderRejected(_)
            | GatewayError::InvalidPrice { .. } => FailureClass::Validation,
            GatewayError::StateDivergence(_) => FailureClass::StateDivergence,
            GatewayError::ConfigError(_) => FailureClass::Fatal,
            _ => FailureClass::Validation,
        }
    }

    /// 判断错误是否可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::Transient | FailureClass::RateLimit
        )
    }

    /// 获取建议的重试等待时间(秒)
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited {
                retry_after_secs, ..
            } => (*retry_after_secs).or(Some(2)),
            GatewayError::NetworkError(_) => Some(1),
            GatewayError::TimeoutError { .. } => Some(2),
            GatewayError::ServerError { code, .. } if *code >= 500 => Some(3),
            _ => None,
        }
    }

    /// 错误严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            GatewayError::NetworkError(_)
            | GatewayError::TimeoutError { .. }
            | GatewayError::RateLimited { .. }
            | GatewayError::CircuitOpen { .. } => ErrorSeverity::Warning,
            GatewayError::ConfigError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = GatewayError::RateLimited {
            message: "too many requests".to_string(),
            retry_after_secs: Some(5),
        };
        assert!(err.is_retryable());
        assert_eq!(err.class(), FailureClass::RateLimit);
        assert_eq!(err.retry_after(), Some(5));
    }

    #[test]
    fn test_validation_never_retries() {
        let err = GatewayError::ValidationError {
            field: "size".to_string(),
            reason: "必须大于0".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.class(), FailureClass::Validation);
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn test_server_error_class_by_status() {
        let e503 = GatewayError::ServerError {
            code: 503,
            message: "unavailable".to_string(),
        };
        let e400 = GatewayError::ServerError {
            code: 400,
            message: "bad request".to_string(),
        };
        assert_eq!(e503.class(), FailureClass::Transient);
        assert_eq!(e400.class(), FailureClass::Validation);
    }

    #[test]
    fn test_config_error_is_fatal() {
        let err = GatewayError::ConfigError("止盈必须大于止损".to_string());
        assert_eq!(err.class(), FailureClass::Fatal);
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }
}
