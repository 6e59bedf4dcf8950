//! 死信存储
//!
//! 重试耗尽的投递和无法路由的事件在此落地，等待人工介入。
//! 记录是失败现场的完整快照（含全部失败历史），复核状态机：
//! pending_review -> under_review -> (resolved | abandoned)。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::error::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{Channel, DeliveryRecord, Priority};

// ---------------------------------------------------------------------------
// ReviewStatus / DlqRecord
// ---------------------------------------------------------------------------

/// 死信复核状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum ReviewStatus {
    PendingReview,
    UnderReview,
    Resolved,
    Abandoned,
}

/// 死信记录
///
/// `notification_id` 为空表示消息在路由之前就已失败（负载畸形等），
/// 此时 payload 保存原始消息内容供排查。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DlqRecord {
    pub id: Uuid,
    pub notification_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub kind: Option<String>,
    pub channel: Option<Channel>,
    pub priority: Option<Priority>,
    pub title: Option<String>,
    pub body: Option<String>,
    /// 失败现场的原始负载（畸形消息）或投递数据快照
    pub payload: serde_json::Value,
    pub failure_reason: String,
    pub total_attempts: i32,
    /// 完整失败历史：[{attempt, error, at}]
    pub failure_history: serde_json::Value,
    /// 来源标识：topic 名或 "retry-engine"
    pub source: String,
    pub correlation_id: Option<String>,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DlqRecord {
    /// 从重试耗尽的投递记录生成快照
    pub fn from_delivery(record: &DeliveryRecord, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            notification_id: Some(record.notification_id),
            user_id: Some(record.user_id.clone()),
            kind: Some(record.kind.to_string()),
            channel: Some(record.channel),
            priority: Some(record.priority),
            title: Some(record.title.clone()),
            body: Some(record.body.clone()),
            payload: record.data.clone(),
            failure_reason: reason.into(),
            total_attempts: record.retry_count,
            failure_history: record.failure_log.clone(),
            source: "retry-engine".to_string(),
            correlation_id: record.correlation_id.clone(),
            review_status: ReviewStatus::PendingReview,
            reviewed_by: None,
            resolution_notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 从无法路由的总线消息生成记录
    ///
    /// `marker` 区分失败类别（如 "malformed" / "routing_failed"）。
    pub fn from_bus_message(
        source_topic: impl Into<String>,
        message_key: impl Into<String>,
        payload: serde_json::Value,
        reason: impl Into<String>,
        marker: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            notification_id: None,
            user_id: None,
            kind: Some(marker.to_string()),
            channel: None,
            priority: None,
            title: None,
            body: None,
            payload,
            failure_reason: reason.into(),
            total_attempts: 1,
            failure_history: serde_json::Value::Array(vec![]),
            source: source_topic.into(),
            correlation_id: Some(message_key.into()),
            review_status: ReviewStatus::PendingReview,
            reviewed_by: None,
            resolution_notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// DlqStore
// ---------------------------------------------------------------------------

/// 死信存储接口
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// 写入一条死信记录
    async fn insert(&self, record: &DlqRecord) -> Result<()>;

    /// 按复核状态列出记录
    async fn list_by_status(&self, status: ReviewStatus, limit: i64) -> Result<Vec<DlqRecord>>;

    /// 复核状态迁移（管理操作）
    async fn update_review(
        &self,
        id: Uuid,
        status: ReviewStatus,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<bool>;
}

/// PostgreSQL 死信存储
pub struct PgDlqStore {
    pool: PgPool,
}

impl PgDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DLQ_COLUMNS: &str = r#"
    id, notification_id, user_id, kind, channel, priority, title, body,
    payload, failure_reason, total_attempts, failure_history, source,
    correlation_id, review_status, reviewed_by, resolution_notes,
    created_at, updated_at
"#;

#[async_trait]
impl DlqStore for PgDlqStore {
    async fn insert(&self, record: &DlqRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dlq_records (
                id, notification_id, user_id, kind, channel, priority, title, body,
                payload, failure_reason, total_attempts, failure_history, source,
                correlation_id, review_status, reviewed_by, resolution_notes,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(record.id)
        .bind(record.notification_id)
        .bind(&record.user_id)
        .bind(&record.kind)
        .bind(record.channel)
        .bind(record.priority)
        .bind(&record.title)
        .bind(&record.body)
        .bind(&record.payload)
        .bind(&record.failure_reason)
        .bind(record.total_attempts)
        .bind(&record.failure_history)
        .bind(&record.source)
        .bind(&record.correlation_id)
        .bind(record.review_status)
        .bind(&record.reviewed_by)
        .bind(&record.resolution_notes)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_by_status(&self, status: ReviewStatus, limit: i64) -> Result<Vec<DlqRecord>> {
        let records = sqlx::query_as::<_, DlqRecord>(&format!(
            r#"
            SELECT {DLQ_COLUMNS}
            FROM dlq_records
            WHERE review_status = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_review(
        &self,
        id: Uuid,
        status: ReviewStatus,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dlq_records
            SET review_status = $2, reviewed_by = $3, resolution_notes = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(reviewer)
        .bind(notes)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EventKind;
    use crate::types::NotificationRequest;

    #[test]
    fn test_from_delivery_snapshot() {
        let req = NotificationRequest::new("u-1", EventKind::TransferFailed, "标题", "正文")
            .with_source_id("txn-5")
            .with_correlation_id("corr-9");
        let mut record = DeliveryRecord::new(Uuid::now_v7(), &req, Channel::Email, Priority::High);
        record.retry_count = 5;
        record.push_failure(1, "timeout");
        record.push_failure(2, "timeout");

        let dlq = DlqRecord::from_delivery(&record, "重试次数耗尽");

        assert_eq!(dlq.notification_id, Some(record.notification_id));
        assert_eq!(dlq.user_id.as_deref(), Some("u-1"));
        assert_eq!(dlq.kind.as_deref(), Some("transfer_failed"));
        assert_eq!(dlq.channel, Some(Channel::Email));
        assert_eq!(dlq.total_attempts, 5);
        assert_eq!(dlq.failure_history.as_array().unwrap().len(), 2);
        assert_eq!(dlq.review_status, ReviewStatus::PendingReview);
        assert_eq!(dlq.source, "retry-engine");
        assert_eq!(dlq.correlation_id.as_deref(), Some("corr-9"));
    }

    #[test]
    fn test_from_bus_message_malformed() {
        let dlq = DlqRecord::from_bus_message(
            "bank.transaction.events",
            "bank.transaction.events:0:42",
            serde_json::json!({"raw": "not an event"}),
            "负载缺少 userId",
            "malformed",
        );

        assert!(dlq.notification_id.is_none());
        assert_eq!(dlq.kind.as_deref(), Some("malformed"));
        assert_eq!(dlq.source, "bank.transaction.events");
        assert_eq!(
            dlq.correlation_id.as_deref(),
            Some("bank.transaction.events:0:42")
        );
        assert_eq!(dlq.review_status, ReviewStatus::PendingReview);
    }
}
