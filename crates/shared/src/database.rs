//! PostgreSQL 连接管理
//!
//! 投递记录、死信和用户偏好三个存储共用这里建立的连接池。
//! 池在组合根启动时建立并立即探活一次——配置错误要在进程起步时
//! 暴露，而不是等第一条事件到达才发现数据库不可达。
//! 关闭发生在优雅关闭宽限期内、各工作任务停止之后：此时不再有
//! 新的记录写入，在途写入随连接归还自然完成。

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{NotifyError, Result};

/// 数据库句柄
///
/// Clone 共享同一个池；各仓储通过 [`pool`](Self::pool) 取引用构造，
/// 不单独持有句柄。
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 建立连接池并验证可达性
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        // 启动即探活，失败直接让组合根退出
        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "PostgreSQL 连接池就绪"
        );
        Ok(Self { pool })
    }

    /// 连接池引用，供仓储构造使用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 就绪探针（/ready）使用的健康检查
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(NotifyError::from)
    }

    /// 关闭连接池
    ///
    /// 只在关闭序列的最后一步调用：摄取器、重试引擎和摘要引擎
    /// 都已退出，等待池内连接全部归还后断开。
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL 连接池已关闭");
    }
}
