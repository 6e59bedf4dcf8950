//! 去重存储
//!
//! 以 (user, kind, source) 为指纹做"首见即胜"的注册：键已存在时返回
//! 首次通知的 id，否则写入当前通知 id 并设置 TTL = 事件类型的去重窗口。
//! 注册与查询在一次往返内原子完成。
//!
//! 键模式: `dedup:{user}:{kind}:{sourceId}`；source 缺省时为 "none"，
//! 表示该窗口内仅按 (user, kind) 去重。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::cache::Cache;
use notify_shared::error::Result;
use redis::Script;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::catalog::EventKind;
use crate::types::DedupOutcome;

/// 去重存储接口
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// 原子地检查并注册事件指纹
    ///
    /// 已存在 -> duplicate=true 并返回首次通知 id；
    /// 不存在 -> 写入 notification_id 并报告 duplicate=false。
    async fn check_and_register(
        &self,
        user_id: &str,
        kind: EventKind,
        source_id: &str,
        notification_id: &str,
        window: Duration,
    ) -> Result<DedupOutcome>;
}

/// 去重键的存储值：首次通知 id 加首见时间
#[derive(Debug, Serialize, Deserialize)]
struct DedupValue {
    notification_id: String,
    first_seen_at: DateTime<Utc>,
}

/// 检查-注册脚本
///
/// KEYS[1]=去重键 ARGV[1]=值 ARGV[2]=TTL秒
/// 返回 {1, 既有值} 或 {0, 新值}
const CHECK_AND_REGISTER_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
    return {1, existing}
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return {0, ARGV[1]}
"#;

/// Redis 去重存储
pub struct RedisDedupStore {
    cache: Cache,
    script: Script,
}

impl RedisDedupStore {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            script: Script::new(CHECK_AND_REGISTER_SCRIPT),
        }
    }

    fn key(user_id: &str, kind: EventKind, source_id: &str) -> String {
        format!("dedup:{user_id}:{kind}:{source_id}")
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn check_and_register(
        &self,
        user_id: &str,
        kind: EventKind,
        source_id: &str,
        notification_id: &str,
        window: Duration,
    ) -> Result<DedupOutcome> {
        let key = Self::key(user_id, kind, source_id);
        let value = serde_json::to_string(&DedupValue {
            notification_id: notification_id.to_string(),
            first_seen_at: Utc::now(),
        })
        .map_err(|e| notify_shared::error::NotifyError::Internal(format!("序列化失败: {e}")))?;

        // TTL 至少 1 秒，防止 0 窗口导致 SET 参数非法
        let ttl_secs = window.as_secs().max(1);

        let (exists, stored): (i64, String) = self
            .cache
            .eval_script(&self.script, &[&key], &[value, ttl_secs.to_string()])
            .await?;

        if exists == 1 {
            // 既有值解析失败时退化为"重复但原 id 未知"，不放行重复发送
            let original = serde_json::from_str::<DedupValue>(&stored)
                .map(|v| v.notification_id)
                .ok();
            Ok(DedupOutcome {
                duplicate: true,
                original_notification_id: original,
            })
        } else {
            Ok(DedupOutcome {
                duplicate: false,
                original_notification_id: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pattern() {
        assert_eq!(
            RedisDedupStore::key("u-1", EventKind::TransferCompleted, "txn-9"),
            "dedup:u-1:transfer_completed:txn-9"
        );
        assert_eq!(
            RedisDedupStore::key("u-1", EventKind::LoginFailed, "none"),
            "dedup:u-1:login_failed:none"
        );
    }

    #[test]
    fn test_dedup_value_roundtrip() {
        let value = DedupValue {
            notification_id: "0191-abc".to_string(),
            first_seen_at: Utc::now(),
        };
        let json = serde_json::to_string(&value).unwrap();
        let back: DedupValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.notification_id, "0191-abc");
    }

    #[test]
    fn test_script_sets_only_when_absent() {
        // 存在分支只读不写，保证"首见即胜"
        let exists_branch = CHECK_AND_REGISTER_SCRIPT
            .split("if existing then")
            .nth(1)
            .unwrap()
            .split("end")
            .next()
            .unwrap();
        assert!(!exists_branch.contains("SET"));
    }
}
