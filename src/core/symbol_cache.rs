//! 交易对元数据缓存模块
//! 用于减少对网关 symbol_info 接口的查询请求

use crate::core::types::SymbolInfo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct CacheItem {
    info: Arc<SymbolInfo>,
    fetched_at: Instant,
}

impl CacheItem {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

/// tick/lot 精度缓存
///
/// 读多写少：读取方拿到的是 Arc 快照，刷新采用先构建新条目再整体
/// 替换的方式，读取方不会观察到半更新状态。
pub struct SymbolInfoCache {
    entries: RwLock<HashMap<String, CacheItem>>,
    ttl: Duration,
}

impl SymbolInfoCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// 读取未过期的缓存条目
    pub async fn get(&self, symbol: &str) -> Option<Arc<SymbolInfo>> {
        let entries = self.entries.read().await;
        entries.get(symbol).and_then(|item| {
            if item.is_expired(self.ttl) {
                None
            } else {
                Some(item.info.clone())
            }
        })
    }

    /// 写入/替换条目
    pub async fn put(&self, info: SymbolInfo) {
        let item = CacheItem {
            info: Arc::new(info),
            fetched_at: Instant::now(),
        };
        let mut entries = self.entries.write().await;
        let symbol = item.info.symbol.clone();
        entries.insert(symbol, item);
    }

    /// 清理过期条目
    pub async fn evict_expired(&self) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, item| !item.is_expired(ttl));
        let removed = before - entries.len();
        if removed > 0 {
            log::debug!("清理过期精度缓存 {} 条", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_info() -> SymbolInfo {
        SymbolInfo {
            symbol: "BTC".to_string(),
            tick_size: 0.1,
            lot_size: 0.00001,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let cache = SymbolInfoCache::new(60);
        cache.put(btc_info()).await;

        let hit = cache.get("BTC").await.unwrap();
        assert_eq!(hit.tick_size, 0.1);
        assert!(cache.get("ETH").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let cache = SymbolInfoCache::new(0);
        cache.put(btc_info()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("BTC").await.is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_whole_entry() {
        let cache = SymbolInfoCache::new(60);
        cache.put(btc_info()).await;

        let mut updated = btc_info();
        updated.lot_size = 0.0001;
        cache.put(updated).await;

        let hit = cache.get("BTC").await.unwrap();
        assert_eq!(hit.lot_size, 0.0001);
    }
}
