// 工具模块
pub mod notify;
pub mod order_id;

pub use notify::{MessageLevel, Notifier, NotifyConfig};
pub use order_id::OrderIdGenerator;
