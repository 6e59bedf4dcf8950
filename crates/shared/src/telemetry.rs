//! 日志初始化模块
//!
//! 基于 tracing / tracing-subscriber，按配置选择 pretty 或 JSON 输出。

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ObservabilityConfig;

/// 初始化 tracing 日志
///
/// 环境变量 `RUST_LOG` 优先于配置中的 log_level；
/// 重复初始化（如测试中多次调用）静默忽略。
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.log_format == "json" {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    // 已有全局 subscriber（常见于测试）时 try_init 返回错误，忽略
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = ObservabilityConfig::default();
        init(&config);
        // 第二次调用不应 panic
        init(&config);
    }
}
