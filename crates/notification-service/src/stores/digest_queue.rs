//! 摘要队列存储
//!
//! 每个 (user, frequency) 一个有序列表。免打扰时段内符合摘要条件的
//! 通知按到达顺序追加，摘要引擎在触发时刻读取全量、发送成功后清空。
//! 列表 TTL 固定一周，防止用户关闭摘要后产生永不回收的孤儿队列。
//!
//! 键模式: `digest:{hourly|daily|weekly}:{user}`

use async_trait::async_trait;
use notify_shared::cache::Cache;
use notify_shared::error::{NotifyError, Result};
use redis::Script;
use std::time::Duration;

use crate::types::{DigestEntry, DigestFrequency};

/// 孤儿队列保留上限
const QUEUE_TTL: Duration = Duration::from_secs(7 * 24 * 3_600);

/// 摘要队列接口
#[async_trait]
pub trait DigestQueue: Send + Sync {
    /// 追加一条摘要条目并续期队列 TTL，返回追加后的队列长度
    async fn append(
        &self,
        user_id: &str,
        frequency: DigestFrequency,
        entry: &DigestEntry,
    ) -> Result<u64>;

    /// 读取队列全部条目（不清空）
    ///
    /// 发送成功前队列保持原样，失败的摘要下个周期重新组装。
    async fn entries(&self, user_id: &str, frequency: DigestFrequency) -> Result<Vec<DigestEntry>>;

    /// 清空队列（摘要邮件确认送出后调用）
    async fn clear(&self, user_id: &str, frequency: DigestFrequency) -> Result<()>;
}

/// 追加脚本：RPUSH 后统一续期，保证条目和 TTL 出现在同一次往返中
const APPEND_SCRIPT: &str = r#"
local len = redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return len
"#;

/// 读取脚本：全量 LRANGE
const ENTRIES_SCRIPT: &str = "return redis.call('LRANGE', KEYS[1], 0, -1)";

/// Redis 摘要队列
pub struct RedisDigestQueue {
    cache: Cache,
    append_script: Script,
    entries_script: Script,
}

impl RedisDigestQueue {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            append_script: Script::new(APPEND_SCRIPT),
            entries_script: Script::new(ENTRIES_SCRIPT),
        }
    }

    fn key(user_id: &str, frequency: DigestFrequency) -> String {
        format!("digest:{}:{user_id}", frequency.as_str())
    }
}

#[async_trait]
impl DigestQueue for RedisDigestQueue {
    async fn append(
        &self,
        user_id: &str,
        frequency: DigestFrequency,
        entry: &DigestEntry,
    ) -> Result<u64> {
        let key = Self::key(user_id, frequency);
        let payload = serde_json::to_string(entry)
            .map_err(|e| NotifyError::Internal(format!("摘要条目序列化失败: {e}")))?;

        let len: u64 = self
            .cache
            .eval_script(
                &self.append_script,
                &[&key],
                &[payload, QUEUE_TTL.as_secs().to_string()],
            )
            .await?;
        Ok(len)
    }

    async fn entries(&self, user_id: &str, frequency: DigestFrequency) -> Result<Vec<DigestEntry>> {
        let key = Self::key(user_id, frequency);
        let raw: Vec<String> = self
            .cache
            .eval_script(&self.entries_script, &[&key], &[])
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            let entry: DigestEntry = serde_json::from_str(&item)
                .map_err(|e| NotifyError::Internal(format!("摘要条目反序列化失败: {e}")))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn clear(&self, user_id: &str, frequency: DigestFrequency) -> Result<()> {
        self.cache.delete(&Self::key(user_id, frequency)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pattern() {
        assert_eq!(
            RedisDigestQueue::key("u-1", DigestFrequency::Daily),
            "digest:daily:u-1"
        );
        assert_eq!(
            RedisDigestQueue::key("u-2", DigestFrequency::Hourly),
            "digest:hourly:u-2"
        );
        assert_eq!(
            RedisDigestQueue::key("u-3", DigestFrequency::Weekly),
            "digest:weekly:u-3"
        );
    }

    #[test]
    fn test_queue_ttl_is_one_week() {
        assert_eq!(QUEUE_TTL, Duration::from_secs(604_800));
    }
}
