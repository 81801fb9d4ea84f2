//! 交易所网关适配层
//!
//! `ExchangeTransport` 是签名HTTP客户端的黑盒接口；`GatewayAdapter`
//! 在其上叠加有界重试、全局节流、熔断和响应归一化，并把所有
//! 形状歧义挡在业务逻辑之外。

use crate::core::circuit::{CallPacer, CircuitBreaker, CircuitConfig, EndpointFamily};
use crate::core::error::GatewayError;
use crate::core::retry::RetryPolicies;
use crate::core::symbol_cache::SymbolInfoCache;
use crate::core::types::{
    AccountState, Order, OrderRequest, OrderResult, Position, Result, SymbolInfo,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// 签名HTTP传输层黑盒接口
///
/// 返回的数据未经过滤：positions/orders 可能包含账户下其他
/// 交易对的条目，account 载荷形状也可能是对象或单元素数组，
/// 归一化都由 `GatewayAdapter` 完成。
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn fetch_positions(&self) -> Result<Vec<Position>>;

    async fn fetch_open_orders(&self) -> Result<Vec<Order>>;

    /// 账户信息原始载荷，data 字段可能是对象也可能是单元素数组
    async fn fetch_account_raw(&self) -> Result<Value>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<OrderResult>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool>;

    async fn fetch_symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn fetch_mark_price(&self, symbol: &str) -> Result<f64>;
}

/// 网关配置
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// 实盘凭证所在的环境变量名；留空表示纸面模式
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// 跨交易对共享的最小调用间隔（毫秒）
    #[serde(default = "GatewayConfig::default_spacing_ms")]
    pub min_call_spacing_ms: u64,
    /// 精度缓存TTL（秒）
    #[serde(default = "GatewayConfig::default_cache_ttl")]
    pub symbol_cache_ttl_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicies,
    #[serde(default)]
    pub circuit: CircuitConfig,
}

impl GatewayConfig {
    fn default_spacing_ms() -> u64 {
        1200
    }

    fn default_cache_ttl() -> u64 {
        90
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_key_env: None,
            min_call_spacing_ms: Self::default_spacing_ms(),
            symbol_cache_ttl_secs: Self::default_cache_ttl(),
            retry: RetryPolicies::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// 网关适配器
pub struct GatewayAdapter {
    transport: Arc<dyn ExchangeTransport>,
    retry: RetryPolicies,
    pacer: CallPacer,
    breaker: CircuitBreaker,
    symbol_cache: SymbolInfoCache,
}

impl GatewayAdapter {
    pub fn new(transport: Arc<dyn ExchangeTransport>, config: &GatewayConfig) -> Self {
        Self {
            transport,
            retry: config.retry.clone(),
            pacer: CallPacer::new(config.min_call_spacing_ms),
            breaker: CircuitBreaker::new(config.circuit.clone()),
            symbol_cache: SymbolInfoCache::new(config.symbol_cache_ttl_secs),
        }
    }

    /// 带熔断/节流/重试的统一调用入口
    async fn call<T, F, Fut>(
        &self,
        family: EndpointFamily,
        label: &str,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.breaker.check(family).await?;

        let outcome = self
            .retry
            .execute(label, || async {
                self.pacer.acquire().await;
                let result = op().await;
                if let Err(GatewayError::RateLimited { .. }) = &result {
                    self.pacer.report_rate_limited().await;
                }
                result
            })
            .await;

        match outcome.into_result() {
            Ok(value) => {
                self.breaker.record_success(family).await;
                Ok(value)
            }
            Err(error) => {
                // 校验类错误说明请求本身有问题，不计入远端健康度
                if error.is_retryable() {
                    self.breaker.record_failure(family).await;
                }
                Err(error)
            }
        }
    }

    /// 获取指定交易对的持仓（已过滤）
    ///
    /// 同一账户可能被多个程序共用，其他交易对的持仓绝不能
    /// 计入本实例的限额。
    pub async fn get_positions(&self, symbol: &str) -> Result<Vec<Position>> {
        let all = self
            .call(EndpointFamily::Account, "get_positions", || {
                self.transport.fetch_positions()
            })
            .await?;

        Ok(all.into_iter().filter(|p| p.symbol == symbol).collect())
    }

    /// 获取指定交易对的活跃订单（已过滤）
    pub async fn get_open_orders(&self, symbol: &str) -> Result<Vec<Order>> {
        let all = self
            .call(EndpointFamily::Orders, "get_open_orders", || {
                self.transport.fetch_open_orders()
            })
            .await?;

        Ok(all.into_iter().filter(|o| o.symbol == symbol).collect())
    }

    /// 获取归一化后的账户状态
    pub async fn get_account_info(&self) -> Result<AccountState> {
        let raw = self
            .call(EndpointFamily::Account, "get_account_info", || {
                self.transport.fetch_account_raw()
            })
            .await?;

        normalize_account_payload(&raw)
    }

    /// 下单
    pub async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult> {
        if request.size <= 0.0 {
            return Err(GatewayError::ValidationError {
                field: "size".to_string(),
                reason: format!("数量必须大于0，实际 {}", request.size),
            });
        }
        if let Some(price) = request.price {
            if price <= 0.0 {
                return Err(GatewayError::ValidationError {
                    field: "price".to_string(),
                    reason: format!("价格必须大于0，实际 {}", price),
                });
            }
        }

        self.call(EndpointFamily::Orders, "create_order", || {
            self.transport.submit_order(request)
        })
        .await
    }

    /// 撤单
    pub async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool> {
        self.call(EndpointFamily::Orders, "cancel_order", || {
            self.transport.cancel_order(order_id, symbol)
        })
        .await
    }

    /// 获取交易对精度信息（带TTL缓存）
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<Arc<SymbolInfo>> {
        if let Some(cached) = self.symbol_cache.get(symbol).await {
            return Ok(cached);
        }

        let info = self
            .call(EndpointFamily::MarketData, "get_symbol_info", || {
                self.transport.fetch_symbol_info(symbol)
            })
            .await?;

        if info.lot_size < 0.0 {
            return Err(GatewayError::ParseError(format!(
                "{} 返回非法 lot_size {}",
                symbol, info.lot_size
            )));
        }

        self.symbol_cache.put(info).await;
        self.symbol_cache
            .get(symbol)
            .await
            .ok_or_else(|| GatewayError::SymbolNotFound(symbol.to_string()))
    }

    /// 获取标记价格；非正价格视为坏数据
    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64> {
        let price = self
            .call(EndpointFamily::MarketData, "get_mark_price", || {
                self.transport.fetch_mark_price(symbol)
            })
            .await?;

        if price <= 0.0 {
            return Err(GatewayError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        Ok(price)
    }
}

/// 把对象/单元素数组两种合法形状归一化为 AccountState
///
/// 载荷中的数字字段可能是 JSON number 也可能是字符串。
pub fn normalize_account_payload(raw: &Value) -> Result<AccountState> {
    let data = raw.get("data").unwrap_or(raw);

    let obj = match data {
        Value::Object(_) => data,
        Value::Array(items) => items.first().ok_or_else(|| {
            GatewayError::ParseError("账户载荷为空数组".to_string())
        })?,
        other => {
            return Err(GatewayError::ParseError(format!(
                "账户载荷形状无法识别: {}",
                other
            )))
        }
    };

    let equity = flexible_f64(obj, &["account_equity", "equity", "balance"])
        .ok_or_else(|| GatewayError::ParseError("账户载荷缺少净值字段".to_string()))?;
    let available = flexible_f64(obj, &["available_to_spend", "available_balance", "available"])
        .unwrap_or(equity);
    let margin_used =
        flexible_f64(obj, &["total_margin_used", "margin_used"]).unwrap_or(0.0);

    Ok(AccountState {
        equity,
        available_balance: available,
        margin_used,
        timestamp: Utc::now(),
    })
}

fn flexible_f64(obj: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match obj.get(key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => {
                if let Ok(v) = s.parse::<f64>() {
                    return Some(v);
                }
            }
            _ => continue,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_object_shape() {
        let raw = json!({
            "data": {
                "account_equity": "1000.5",
                "available_to_spend": 800.0,
                "total_margin_used": "200.5"
            }
        });
        let account = normalize_account_payload(&raw).unwrap();
        assert!((account.equity - 1000.5).abs() < 1e-9);
        assert!((account.available_balance - 800.0).abs() < 1e-9);
        assert!((account.margin_used - 200.5).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_array_shape() {
        // 同一接口对单账户也可能返回单元素数组
        let raw = json!({
            "data": [{
                "account_equity": 500.0,
                "available_balance": "400",
                "margin_used": 100.0
            }]
        });
        let account = normalize_account_payload(&raw).unwrap();
        assert!((account.equity - 500.0).abs() < 1e-9);
        assert!((account.margin_used - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_rejects_empty_array() {
        let raw = json!({ "data": [] });
        assert!(normalize_account_payload(&raw).is_err());
    }

    #[test]
    fn test_normalize_without_data_wrapper() {
        let raw = json!({ "equity": 250.0 });
        let account = normalize_account_payload(&raw).unwrap();
        assert!((account.equity - 250.0).abs() < 1e-9);
        // 缺少可用余额时退回净值
        assert!((account.available_balance - 250.0).abs() < 1e-9);
    }
}
