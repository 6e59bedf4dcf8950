//! Redis 缓存管理模块
//!
//! 提供 Redis 连接管理和常用缓存操作封装。速率预算、去重、摘要队列
//! 等多键原子操作通过 `eval_script` 以 Lua 脚本单次往返完成——
//! 先读后写的两段式调用在并发下会产生竞态，这里不提供这类接口。

use crate::config::RedisConfig;
use crate::error::{NotifyError, Result};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tracing::{info, instrument};

/// Redis 缓存客户端
#[derive(Clone)]
pub struct Cache {
    client: Client,
}

impl Cache {
    /// 创建 Redis 客户端
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis client created");
        Ok(Self { client })
    }

    /// 获取连接
    async fn get_conn(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(NotifyError::from)
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(NotifyError::from)
    }

    /// 获取值
    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn.get(key).await?;

        match value {
            Some(v) => {
                let parsed: T = serde_json::from_str(&v).map_err(|e| {
                    NotifyError::Internal(format!("Cache deserialization error: {e}"))
                })?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }

    /// 设置值
    #[instrument(skip(self, value))]
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let serialized = serde_json::to_string(value)
            .map_err(|e| NotifyError::Internal(format!("Cache serialization error: {e}")))?;

        let _: () = conn.set_ex(key, serialized, ttl.as_secs()).await?;
        Ok(())
    }

    /// 删除值
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// 批量删除指定的键
    pub async fn delete_keys(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_conn().await?;
        let count: u64 = conn.del(keys).await?;
        Ok(count)
    }

    /// 检查键是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    /// 获取键的剩余存活时间
    ///
    /// 键不存在或未设置 TTL 时返回 None。
    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.get_conn().await?;
        let secs: i64 = conn.ttl(key).await?;
        if secs < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_secs(secs as u64)))
    }

    /// 执行 Lua 脚本
    ///
    /// 多键检查-修改必须走脚本以保证原子性。返回类型由脚本决定，
    /// 调用方通过类型参数声明期望的形状。
    #[instrument(skip(self, script, args))]
    pub async fn eval_script<T: redis::FromRedisValue>(
        &self,
        script: &Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<T> {
        let mut conn = self.get_conn().await?;
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        invocation
            .invoke_async(&mut conn)
            .await
            .map_err(NotifyError::from)
    }
}
