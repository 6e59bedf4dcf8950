//! 多渠道用户通知服务
//!
//! 消费上游业务事件（交易、安全、风控、用户生命周期），决定是否、
//! 如何以及通过哪些渠道（实时 socket 推送、短信、邮件、设备推送）
//! 通知受影响的用户，并遵守用户偏好、免打扰时段、速率预算、
//! 去重与重试策略。
//!
//! ## 管道
//!
//! 事件摄取 → 路由决策 → 渠道扇出 → 投递记录持久化 → 重试调度
//! → 摘要批处理 → 死信处理
//!
//! 所有存储与渠道适配器通过构造函数注入 [`router::Router`] 和各引擎，
//! 测试可以用内存假件替换全部外部依赖。

pub mod adapters;
pub mod audit;
pub mod catalog;
pub mod engines;
pub mod error;
pub mod ingest;
pub mod preferences;
pub mod router;
pub mod stores;
pub mod types;
