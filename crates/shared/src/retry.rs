//! 重试计划
//!
//! 投递失败后的重试不采用连续指数退避，而是使用一张固定的延迟表：
//! 1 秒、5 秒、30 秒、5 分钟、1 小时。前两档覆盖网络抖动类瞬时故障，
//! 后几档给服务商故障留出恢复时间，避免对已经不稳定的下游持续施压。

use std::time::Duration;

/// 重试计划
///
/// `delays` 的第 N 项是第 N+1 次重试前的等待时间；
/// 重试次数超出表长时取末项。
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    /// 重试次数上限，达到后转入死信
    pub max_attempts: u32,
    /// 各次重试的等待时间表
    pub delays: Vec<Duration>,
}

impl Default for RetrySchedule {
    /// 默认计划：最多 5 次，延迟 1s / 5s / 30s / 5min / 1h
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(300),
                Duration::from_secs(3_600),
            ],
        }
    }
}

impl RetrySchedule {
    /// 从配置的毫秒表构建
    pub fn from_millis(max_attempts: u32, schedule_ms: &[u64]) -> Self {
        let delays = if schedule_ms.is_empty() {
            Self::default().delays
        } else {
            schedule_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
        };
        Self {
            max_attempts,
            delays,
        }
    }

    /// 第 N 次重试前的等待时间（attempt 从 1 开始计数）
    ///
    /// attempt 为 0 或超出表长时分别取首项和末项，调用方不必关心边界。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// 已失败 `attempt` 次后是否还应继续重试
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
