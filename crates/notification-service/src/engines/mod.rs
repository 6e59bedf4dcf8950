//! 周期引擎
//!
//! - [`retry_engine`] — 扫描到期的 retrying 记录并重新驱动投递
//! - [`digest_engine`] — 在用户配置的时间组装并发送摘要邮件

pub mod digest_engine;
pub mod retry_engine;

pub use digest_engine::DigestEngine;
pub use retry_engine::RetryEngine;
