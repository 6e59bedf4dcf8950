//! 投递记录存储
//!
//! delivery_records 表的数据访问。每个 (notification, channel) 尝试
//! 一行，只增不删；idempotency_key 上的唯一索引保证重试重入走
//! UPDATE 而非新插入。重试扫描使用 `FOR UPDATE SKIP LOCKED`，
//! 多实例部署时不会重复认领同一批记录。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_shared::error::Result;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::types::DeliveryRecord;

/// 投递记录存储接口
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// 写入或更新一条投递记录
    ///
    /// 以 idempotency_key 为冲突键：同一 (user, kind, source, channel)
    /// 的重试重入更新原行的状态与重试字段。
    async fn upsert(&self, record: &DeliveryRecord) -> Result<()>;

    /// 按通知 id 取全部渠道的记录
    async fn get_by_notification(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>>;

    /// 认领一批到期的重试记录
    ///
    /// 选出 status=retrying 且 next_attempt_at 已到期的记录（按到期
    /// 时间升序，至多 limit 条），并在同一事务内把 next_attempt_at
    /// 推后 lease，作为跨实例的处理租约。返回认领时的原始记录。
    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>>;

    /// 批量把记录标记为已送达（摘要确认送出后调用）
    async fn mark_delivered(&self, notification_ids: &[Uuid]) -> Result<u64>;

    /// 记录用户已读时间
    async fn mark_read(&self, notification_id: Uuid, at: DateTime<Utc>) -> Result<u64>;
}

/// PostgreSQL 投递记录存储
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = r#"
    id, notification_id, user_id, kind, source_id, channel, priority,
    title, body, data, status, provider, provider_message_id, retry_count,
    last_attempt_at, next_attempt_at, error, failure_log, created_at,
    sent_at, delivered_at, read_at, correlation_id, idempotency_key
"#;

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn upsert(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (
                id, notification_id, user_id, kind, source_id, channel, priority,
                title, body, data, status, provider, provider_message_id, retry_count,
                last_attempt_at, next_attempt_at, error, failure_log, created_at,
                sent_at, delivered_at, read_at, correlation_id, idempotency_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (idempotency_key) DO UPDATE SET
                status = EXCLUDED.status,
                provider = EXCLUDED.provider,
                provider_message_id = EXCLUDED.provider_message_id,
                retry_count = EXCLUDED.retry_count,
                last_attempt_at = EXCLUDED.last_attempt_at,
                next_attempt_at = EXCLUDED.next_attempt_at,
                error = EXCLUDED.error,
                failure_log = EXCLUDED.failure_log,
                sent_at = EXCLUDED.sent_at,
                delivered_at = EXCLUDED.delivered_at
            "#,
        )
        .bind(record.id)
        .bind(record.notification_id)
        .bind(&record.user_id)
        .bind(record.kind)
        .bind(&record.source_id)
        .bind(record.channel)
        .bind(record.priority)
        .bind(&record.title)
        .bind(&record.body)
        .bind(&record.data)
        .bind(record.status)
        .bind(&record.provider)
        .bind(&record.provider_message_id)
        .bind(record.retry_count)
        .bind(record.last_attempt_at)
        .bind(record.next_attempt_at)
        .bind(&record.error)
        .bind(&record.failure_log)
        .bind(record.created_at)
        .bind(record.sent_at)
        .bind(record.delivered_at)
        .bind(record.read_at)
        .bind(&record.correlation_id)
        .bind(&record.idempotency_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_by_notification(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM delivery_records
            WHERE notification_id = $1
            ORDER BY created_at ASC
            "#
        ))
        .bind(notification_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>> {
        let mut tx = self.pool.begin().await?;

        let records = sqlx::query_as::<_, DeliveryRecord>(&format!(
            r#"
            SELECT {SELECT_COLUMNS}
            FROM delivery_records
            WHERE status = 'retrying' AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if records.is_empty() {
            tx.rollback().await?;
            return Ok(records);
        }

        // 认领租约：把 next_attempt_at 推后，别的实例在租约期内不会再选中。
        // 处理结果落库时会覆盖该字段。
        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();
        sqlx::query(
            r#"
            UPDATE delivery_records
            SET next_attempt_at = $1
            WHERE id = ANY($2)
            "#,
        )
        .bind(lease_until)
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(records)
    }

    async fn mark_delivered(&self, notification_ids: &[Uuid]) -> Result<u64> {
        if notification_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET status = 'delivered', delivered_at = NOW()
            WHERE notification_id = ANY($1)
              AND status IN ('sent', 'queued_for_digest')
            "#,
        )
        .bind(notification_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_read(&self, notification_id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_records
            SET read_at = $2
            WHERE notification_id = $1 AND read_at IS NULL
            "#,
        )
        .bind(notification_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
