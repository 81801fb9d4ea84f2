/// 客户端订单ID生成器
///
/// 为每笔下单生成唯一且可回溯的ID，便于在审计日志里关联
/// 防护层动作与交易所回报。
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};

/// 订单ID生成器
pub struct OrderIdGenerator {
    prefix: String,
    sequence: AtomicU32,
}

impl OrderIdGenerator {
    /// `strategy` 取前三个字母大写作为前缀
    pub fn new(strategy: &str) -> Self {
        let prefix: String = strategy
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(3)
            .collect::<String>()
            .to_uppercase();
        Self {
            prefix: if prefix.is_empty() {
                "BOT".to_string()
            } else {
                prefix
            },
            sequence: AtomicU32::new(0),
        }
    }

    /// 生成ID：前缀 + 毫秒时间戳 + 序号 + 动作标签
    pub fn generate(&self, tag: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) % 10000;
        format!(
            "{}{}{}{:04}",
            self.prefix,
            tag,
            Utc::now().timestamp_millis(),
            seq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let gen = OrderIdGenerator::new("pacgrid");
        let a = gen.generate("B");
        let b = gen.generate("B");
        assert_ne!(a, b);
        assert!(a.starts_with("PAC"));
    }

    #[test]
    fn test_empty_strategy_falls_back() {
        let gen = OrderIdGenerator::new("___");
        let id = gen.generate("S");
        assert!(id.starts_with("BOTS"));
    }
}
