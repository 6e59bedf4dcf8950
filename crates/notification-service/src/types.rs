//! 通知核心类型定义
//!
//! 定义渠道、优先级、投递状态、路由请求/结果以及投递记录等
//! 贯穿整个管道的数据结构。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::EventKind;

// ---------------------------------------------------------------------------
// Channel — 投递渠道
// ---------------------------------------------------------------------------

/// 投递渠道
///
/// socket 为实时推送（经外部网关），不受速率预算约束；
/// 其余三个渠道均有小时/天两级预算上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum Channel {
    Socket,
    Sms,
    Email,
    Push,
}

impl Channel {
    /// 全部渠道，按扇出时的尝试顺序排列
    pub const ALL: [Channel; 4] = [Channel::Socket, Channel::Sms, Channel::Email, Channel::Push];

    /// 是否受速率预算约束
    pub fn is_budgeted(&self) -> bool {
        !matches!(self, Channel::Socket)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Socket => "socket",
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::Push => "push",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority — 优先级
// ---------------------------------------------------------------------------

/// 通知优先级
///
/// critical 具有穿透语义：绕过免打扰时段，并在渠道交集为空时
/// 强制启用 socket 兜底。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn is_critical(&self) -> bool {
        matches!(self, Priority::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

// ---------------------------------------------------------------------------
// DeliveryStatus — 投递状态
// ---------------------------------------------------------------------------

/// 投递记录状态
///
/// 状态只能前进：pending -> (sent | rate_limited | queued_for_digest |
/// retrying | failed)，retrying 可循环回 sent 或 failed，
/// sent 可进入 delivered。已读通过 read_at 时间戳表达，不是独立状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Retrying,
    RateLimited,
    QueuedForDigest,
}

impl DeliveryStatus {
    /// 状态机迁移校验
    ///
    /// failed -> retrying 仅存在于管理员手工重试路径。
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match self {
            Pending => matches!(next, Sent | RateLimited | QueuedForDigest | Retrying | Failed),
            Retrying => matches!(next, Sent | Failed | Retrying),
            Sent => matches!(next, Delivered),
            QueuedForDigest => matches!(next, Delivered),
            Failed => matches!(next, Retrying),
            Delivered | RateLimited => false,
        }
    }

    /// 是否为成功出站的终态
    pub fn is_outbound_success(&self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Delivered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::RateLimited => "rate_limited",
            DeliveryStatus::QueuedForDigest => "queued_for_digest",
        }
    }
}

// ---------------------------------------------------------------------------
// DigestFrequency — 摘要频率
// ---------------------------------------------------------------------------

/// 摘要频率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    Hourly,
    Daily,
    Weekly,
}

impl DigestFrequency {
    pub const ALL: [DigestFrequency; 3] = [
        DigestFrequency::Hourly,
        DigestFrequency::Daily,
        DigestFrequency::Weekly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DigestFrequency::Hourly => "hourly",
            DigestFrequency::Daily => "daily",
            DigestFrequency::Weekly => "weekly",
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationRequest — 路由请求
// ---------------------------------------------------------------------------

/// 通知请求
///
/// 路由器的唯一输入。source_id 是上游业务标识（如交易号），
/// 用于同一真实事件跨重发的去重；缺省时仅按 (user, kind) 去重。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub user_id: String,
    pub kind: EventKind,
    pub source_id: Option<String>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    pub priority: Option<Priority>,
    pub correlation_id: Option<String>,
}

impl NotificationRequest {
    pub fn new(
        user_id: impl Into<String>,
        kind: EventKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            source_id: None,
            title: title.into(),
            body: body.into(),
            data: HashMap::new(),
            priority: None,
            correlation_id: None,
        }
    }

    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// 请求的生效优先级：显式指定优先，否则取事件类型目录的默认值
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or(self.kind.config().default_priority)
    }

    /// 去重维度的 source 部分；无 source_id 时固定为 "none"
    pub fn source_key(&self) -> &str {
        self.source_id.as_deref().unwrap_or("none")
    }
}

// ---------------------------------------------------------------------------
// SkipReason / ChannelSkip — 策略性拒绝
// ---------------------------------------------------------------------------

/// 渠道被跳过的原因
///
/// 策略性拒绝不是错误——它们以跳过条目的形式出现在 RouteResult 中，
/// 并携带人类可读的说明。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    /// 去重窗口内的重复请求，携带首次通知的 id
    Duplicate { original_notification_id: String },
    /// 用户开启了勿扰（do-not-contact），全渠道静默
    DoNotContact,
    /// 免打扰时段内且事件不可穿透
    QuietHours,
    /// 速率预算耗尽，reset_at 为窗口重置时间
    RateLimited { reset_at: DateTime<Utc> },
    /// 缺少已验证的联系方式（未验证手机/邮箱、无注册设备）
    MissingContact { detail: String },
    /// 渠道被全局禁用
    ChannelDisabled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Duplicate {
                original_notification_id,
            } => write!(f, "duplicate of {original_notification_id}"),
            SkipReason::DoNotContact => write!(f, "user opted out of all contact"),
            SkipReason::QuietHours => write!(f, "deferred by quiet hours"),
            SkipReason::RateLimited { reset_at } => {
                write!(f, "rate budget exhausted, resets at {reset_at}")
            }
            SkipReason::MissingContact { detail } => write!(f, "missing contact: {detail}"),
            SkipReason::ChannelDisabled => write!(f, "channel not enabled"),
        }
    }
}

/// 单渠道跳过条目；channel 为 None 表示整个请求被跳过
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSkip {
    pub channel: Option<Channel>,
    pub reason: SkipReason,
}

// ---------------------------------------------------------------------------
// ChannelAttempt / RouteResult — 路由结果
// ---------------------------------------------------------------------------

/// 单渠道投递尝试结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAttempt {
    pub channel: Channel,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

/// 路由结果
///
/// 路由器对普通渠道失败从不抛错——失败体现为 attempt 的 failed 状态
/// 或 skip 条目，调用方始终拿到一个完整的结果对象。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResult {
    pub notification_id: String,
    pub attempts: Vec<ChannelAttempt>,
    pub skips: Vec<ChannelSkip>,
    /// 因免打扰被整体延迟（非摘要路径）
    pub queued: bool,
    /// 已进入摘要队列
    pub digest_queued: bool,
}

impl RouteResult {
    pub fn new(notification_id: impl Into<String>) -> Self {
        Self {
            notification_id: notification_id.into(),
            attempts: Vec::new(),
            skips: Vec::new(),
            queued: false,
            digest_queued: false,
        }
    }

    /// 是否至少有一个渠道成功出站
    pub fn any_sent(&self) -> bool {
        self.attempts.iter().any(|a| a.status.is_outbound_success())
    }
}

// ---------------------------------------------------------------------------
// DeliveryRecord — 投递记录
// ---------------------------------------------------------------------------

/// 投递记录
///
/// 每个 (notification, channel) 尝试一行，驱动重试与审计，只增不删。
/// idempotency_key = `user:kind:source:channel` 上有唯一索引，
/// 重试重入时按该键更新原行而非新增。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub user_id: String,
    pub kind: EventKind,
    pub source_id: Option<String>,
    pub channel: Channel,
    pub priority: Priority,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub status: DeliveryStatus,
    pub provider: Option<String>,
    pub provider_message_id: Option<String>,
    pub retry_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// 历次失败明细：[{attempt, error, at}]，死信快照据此还原完整失败史
    pub failure_log: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<String>,
    pub idempotency_key: String,
}

impl DeliveryRecord {
    /// 构造一条待投递记录
    pub fn new(
        notification_id: Uuid,
        request: &NotificationRequest,
        channel: Channel,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            notification_id,
            user_id: request.user_id.clone(),
            kind: request.kind,
            source_id: request.source_id.clone(),
            channel,
            priority,
            title: request.title.clone(),
            body: request.body.clone(),
            data: serde_json::to_value(&request.data).unwrap_or(serde_json::Value::Null),
            status: DeliveryStatus::Pending,
            provider: None,
            provider_message_id: None,
            retry_count: 0,
            last_attempt_at: None,
            next_attempt_at: None,
            error: None,
            failure_log: serde_json::Value::Array(vec![]),
            created_at: now,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            correlation_id: request.correlation_id.clone(),
            idempotency_key: idempotency_key(
                &request.user_id,
                request.kind,
                request.source_key(),
                channel,
            ),
        }
    }

    /// 从记录还原路由请求，供重试引擎重入路由器
    pub fn to_request(&self) -> NotificationRequest {
        let data: HashMap<String, serde_json::Value> = self
            .data
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        NotificationRequest {
            user_id: self.user_id.clone(),
            kind: self.kind,
            source_id: self.source_id.clone(),
            title: self.title.clone(),
            body: self.body.clone(),
            data,
            priority: Some(self.priority),
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// 追加一条失败明细
    pub fn push_failure(&mut self, attempt: u32, error: &str) {
        let entry = serde_json::json!({
            "attempt": attempt,
            "error": error,
            "at": Utc::now().to_rfc3339(),
        });
        match self.failure_log.as_array_mut() {
            Some(arr) => arr.push(entry),
            None => self.failure_log = serde_json::Value::Array(vec![entry]),
        }
    }
}

/// 幂等键：user:kind:source:channel
pub fn idempotency_key(user_id: &str, kind: EventKind, source: &str, channel: Channel) -> String {
    format!("{user_id}:{kind}:{source}:{channel}")
}

// ---------------------------------------------------------------------------
// DigestEntry — 摘要队列条目
// ---------------------------------------------------------------------------

/// 摘要队列条目
///
/// 免打扰时段内符合摘要条件的通知不立即投递，而是以此形式
/// 追加到用户的摘要队列，由摘要引擎在用户配置的时间汇总成一封邮件。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestEntry {
    pub notification_id: Uuid,
    pub kind: EventKind,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// 预算 / 去重决策
// ---------------------------------------------------------------------------

/// 速率预算检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetDecision {
    pub allowed: bool,
    /// 小时窗口内剩余额度
    pub remaining: u32,
    /// 最先到期的窗口重置时间
    pub reset_at: DateTime<Utc>,
}

/// 某 (user, channel) 的生效预算上限
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub hourly: u32,
    pub daily: u32,
}

/// 去重检查结果
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    pub duplicate: bool,
    pub original_notification_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        use DeliveryStatus::*;

        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(RateLimited));
        assert!(Pending.can_transition_to(QueuedForDigest));
        assert!(Pending.can_transition_to(Retrying));
        assert!(Pending.can_transition_to(Failed));

        assert!(Retrying.can_transition_to(Sent));
        assert!(Retrying.can_transition_to(Failed));
        assert!(Retrying.can_transition_to(Retrying));

        assert!(Sent.can_transition_to(Delivered));
        assert!(QueuedForDigest.can_transition_to(Delivered));

        // 终态不可再迁移
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!RateLimited.can_transition_to(Sent));
        // failed 只开放手工重试这一条出路
        assert!(Failed.can_transition_to(Retrying));
        assert!(!Failed.can_transition_to(Sent));
        // 不允许回退
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Retrying.can_transition_to(Pending));
    }

    #[test]
    fn test_effective_priority_falls_back_to_catalog() {
        let req = NotificationRequest::new("u1", EventKind::FraudDetected, "t", "b");
        assert_eq!(req.effective_priority(), Priority::Critical);

        let req = req.with_priority(Priority::Low);
        assert_eq!(req.effective_priority(), Priority::Low);
    }

    #[test]
    fn test_idempotency_key_format() {
        let key = idempotency_key("u-1", EventKind::TransferCompleted, "txn-9", Channel::Sms);
        assert_eq!(key, "u-1:transfer_completed:txn-9:sms");

        let req = NotificationRequest::new("u-1", EventKind::TransferCompleted, "t", "b");
        assert_eq!(req.source_key(), "none");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Critical.is_critical());
        assert!(!Priority::High.is_critical());
    }

    #[test]
    fn test_record_roundtrip_to_request() {
        let req = NotificationRequest::new("u-7", EventKind::TransferFailed, "标题", "正文")
            .with_source_id("txn-1")
            .with_priority(Priority::High)
            .with_data("amount", serde_json::json!(250.0))
            .with_correlation_id("corr-1");

        let record = DeliveryRecord::new(Uuid::now_v7(), &req, Channel::Email, Priority::High);
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.idempotency_key, "u-7:transfer_failed:txn-1:email");

        let rebuilt = record.to_request();
        assert_eq!(rebuilt.user_id, "u-7");
        assert_eq!(rebuilt.kind, EventKind::TransferFailed);
        assert_eq!(rebuilt.source_id.as_deref(), Some("txn-1"));
        assert_eq!(rebuilt.priority, Some(Priority::High));
        assert_eq!(rebuilt.data.get("amount"), Some(&serde_json::json!(250.0)));
        assert_eq!(rebuilt.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn test_push_failure_accumulates() {
        let req = NotificationRequest::new("u-1", EventKind::TransferFailed, "t", "b");
        let mut record = DeliveryRecord::new(Uuid::now_v7(), &req, Channel::Email, Priority::High);

        record.push_failure(1, "timeout");
        record.push_failure(2, "connection reset");

        let log = record.failure_log.as_array().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0]["attempt"], 1);
        assert_eq!(log[1]["error"], "connection reset");
    }

    #[test]
    fn test_skip_reason_display_mentions_duplicate() {
        let reason = SkipReason::Duplicate {
            original_notification_id: "abc-123".to_string(),
        };
        let text = reason.to_string();
        assert!(text.contains("duplicate"));
        assert!(text.contains("abc-123"));
    }

    #[test]
    fn test_budgeted_channels() {
        assert!(!Channel::Socket.is_budgeted());
        assert!(Channel::Sms.is_budgeted());
        assert!(Channel::Email.is_budgeted());
        assert!(Channel::Push.is_budgeted());
    }
}
