//! 速率预算存储
//!
//! 每个 (user, channel) 维护小时、天两个计数器，各自带与窗口等长的
//! TTL。检查与消费必须在一次往返内原子完成——两个计数器同时低于
//! 上限才会各自加一并补设 TTL。socket 渠道在路由器层面就绕过预算，
//! 不会到达这里。
//!
//! 键模式: `ratelimit:{channel}:{hour|day}:{user}`

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use notify_shared::cache::Cache;
use notify_shared::error::Result;
use redis::Script;

use crate::types::{BudgetDecision, BudgetLimits, Channel};

/// 小时窗口长度（秒）
const HOUR_WINDOW_SECS: i64 = 3_600;
/// 天窗口长度（秒）
const DAY_WINDOW_SECS: i64 = 86_400;

/// 速率预算存储接口
#[async_trait]
pub trait RateBudgetStore: Send + Sync {
    /// 原子地检查并消费一次预算
    ///
    /// 两个窗口都未达上限时各自加一并返回 allowed=true；
    /// 任一达到上限时不产生任何修改，reset_at 指向先到期的窗口。
    async fn consume(
        &self,
        user_id: &str,
        channel: Channel,
        limits: BudgetLimits,
    ) -> Result<BudgetDecision>;

    /// 清空预算计数（管理操作）
    ///
    /// channel 为 None 时清空该用户所有渠道。
    async fn reset(&self, user_id: &str, channel: Option<Channel>) -> Result<()>;
}

/// 检查-消费脚本
///
/// KEYS[1]=小时键 KEYS[2]=天键
/// ARGV[1]=小时上限 ARGV[2]=天上限 ARGV[3]=小时TTL ARGV[4]=天TTL
/// 返回 {allowed, 小时剩余, 距重置秒数}
const CONSUME_SCRIPT: &str = r#"
local hour = tonumber(redis.call('GET', KEYS[1]) or '0')
local day = tonumber(redis.call('GET', KEYS[2]) or '0')
local hour_cap = tonumber(ARGV[1])
local day_cap = tonumber(ARGV[2])

if hour >= hour_cap or day >= day_cap then
    local ttl
    if hour >= hour_cap then
        ttl = redis.call('TTL', KEYS[1])
    else
        ttl = redis.call('TTL', KEYS[2])
    end
    local remaining = hour_cap - hour
    if remaining < 0 then remaining = 0 end
    return {0, remaining, ttl}
end

hour = redis.call('INCR', KEYS[1])
if hour == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[3])
end
local new_day = redis.call('INCR', KEYS[2])
if new_day == 1 then
    redis.call('EXPIRE', KEYS[2], ARGV[4])
end
return {1, hour_cap - hour, redis.call('TTL', KEYS[1])}
"#;

/// Redis 速率预算存储
pub struct RedisRateBudgetStore {
    cache: Cache,
    consume_script: Script,
}

impl RedisRateBudgetStore {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache,
            consume_script: Script::new(CONSUME_SCRIPT),
        }
    }

    fn hour_key(channel: Channel, user_id: &str) -> String {
        format!("ratelimit:{channel}:hour:{user_id}")
    }

    fn day_key(channel: Channel, user_id: &str) -> String {
        format!("ratelimit:{channel}:day:{user_id}")
    }
}

#[async_trait]
impl RateBudgetStore for RedisRateBudgetStore {
    async fn consume(
        &self,
        user_id: &str,
        channel: Channel,
        limits: BudgetLimits,
    ) -> Result<BudgetDecision> {
        let hour_key = Self::hour_key(channel, user_id);
        let day_key = Self::day_key(channel, user_id);

        let (allowed, remaining, ttl_secs): (i64, i64, i64) = self
            .cache
            .eval_script(
                &self.consume_script,
                &[&hour_key, &day_key],
                &[
                    limits.hourly.to_string(),
                    limits.daily.to_string(),
                    HOUR_WINDOW_SECS.to_string(),
                    DAY_WINDOW_SECS.to_string(),
                ],
            )
            .await?;

        // 键不存在时 TTL 为负（如上限为 0 直接拒绝），按整窗处理
        let ttl_secs = if ttl_secs < 0 {
            HOUR_WINDOW_SECS
        } else {
            ttl_secs
        };

        Ok(BudgetDecision {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u32,
            reset_at: Utc::now() + ChronoDuration::seconds(ttl_secs),
        })
    }

    async fn reset(&self, user_id: &str, channel: Option<Channel>) -> Result<()> {
        let channels: Vec<Channel> = match channel {
            Some(c) => vec![c],
            None => Channel::ALL.into_iter().filter(|c| c.is_budgeted()).collect(),
        };

        let keys: Vec<String> = channels
            .iter()
            .flat_map(|c| [Self::hour_key(*c, user_id), Self::day_key(*c, user_id)])
            .collect();

        self.cache.delete_keys(&keys).await?;
        Ok(())
    }
}
