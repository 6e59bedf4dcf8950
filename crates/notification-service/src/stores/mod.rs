//! 存储层
//!
//! 管道依赖的六类外部状态，每类一个 trait 加一个生产实现：
//!
//! - [`rate_limit`] — 速率预算计数器（Redis，Lua 原子脚本）
//! - [`dedup`] — 事件指纹去重（Redis，首见即胜）
//! - [`digest_queue`] — 摘要队列（Redis 列表，带 TTL）
//! - [`history`] — 投递记录（PostgreSQL，只增不删）
//! - [`dlq`] — 死信记录（PostgreSQL，人工复核生命周期）
//! - [`preferences`] — 用户偏好文档（PostgreSQL + 进程内 TTL 缓存）
//!
//! 所有 trait 都通过构造函数注入路由器和各引擎，测试用内存假件替换。

pub mod dedup;
pub mod digest_queue;
pub mod dlq;
pub mod history;
pub mod preferences;
pub mod rate_limit;

pub use dedup::{DedupStore, RedisDedupStore};
pub use digest_queue::{DigestQueue, RedisDigestQueue};
pub use dlq::{DlqRecord, DlqStore, PgDlqStore, ReviewStatus};
pub use history::{HistoryStore, PgHistoryStore};
pub use preferences::{PgPreferencesStore, PreferencesStore};
pub use rate_limit::{RateBudgetStore, RedisRateBudgetStore};
