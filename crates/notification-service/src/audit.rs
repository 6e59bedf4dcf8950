//! 审计事件出口
//!
//! 投递生命周期的关键节点（已发送、已送达、失败、已读、重试排期、
//! 移入死信）发布到审计 topic，供下游风控与对账系统消费。
//! 消息以用户 id 作分区键，GZIP 压缩，携带 event-type /
//! event-version / source-service 三个 header。
//!
//! 审计发布是尽力而为：失败只记 warn，不阻断投递主流程。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::error::Result;
use notify_shared::kafka::KafkaProducer;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Channel;

/// 审计事件版本号（header event-version）
const EVENT_VERSION: &str = "1";
/// 来源服务标识（header source-service）
const SOURCE_SERVICE: &str = "notification-service";

/// 审计事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Sent,
    Delivered,
    Failed,
    Read,
    RetryScheduled,
    DlqMoved,
}

impl AuditKind {
    /// 对外的事件类型名（header event-type 与消费侧分发键）
    pub fn event_type(&self) -> &'static str {
        match self {
            AuditKind::Sent => "notification.sent",
            AuditKind::Delivered => "notification.delivered",
            AuditKind::Failed => "notification.failed",
            AuditKind::Read => "notification.read",
            AuditKind::RetryScheduled => "notification.retry.scheduled",
            AuditKind::DlqMoved => "notification.dlq.moved",
        }
    }
}

/// 审计事件正文
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub notification_id: String,
    pub user_id: String,
    pub channels: Vec<Channel>,
    pub occurred_at: DateTime<Utc>,
    /// 类别相关的补充字段（错误文本、下次重试时间等）
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        kind: AuditKind,
        notification_id: impl Into<String>,
        user_id: impl Into<String>,
        channels: Vec<Channel>,
    ) -> Self {
        Self {
            kind,
            notification_id: notification_id.into(),
            user_id: user_id.into(),
            channels,
            occurred_at: Utc::now(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// 审计出口接口
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn publish(&self, event: &AuditEvent) -> Result<()>;

    /// 尽力而为的发布：失败记 warn 并吞掉
    async fn publish_quiet(&self, event: &AuditEvent) {
        if let Err(e) = self.publish(event).await {
            warn!(
                event_type = event.kind.event_type(),
                notification_id = %event.notification_id,
                error = %e,
                "审计事件发布失败"
            );
        }
    }
}

/// Kafka 审计发布器
pub struct KafkaAuditPublisher {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaAuditPublisher {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl AuditSink for KafkaAuditPublisher {
    async fn publish(&self, event: &AuditEvent) -> Result<()> {
        let headers = [
            ("event-type", event.kind.event_type()),
            ("event-version", EVENT_VERSION),
            ("source-service", SOURCE_SERVICE),
        ];

        // 分区键 = 用户 id，同一用户的审计事件保持分区内有序
        self.producer
            .send_json_with_headers(&self.topic, &event.user_id, event, &headers)
            .await?;

        Ok(())
    }
}
