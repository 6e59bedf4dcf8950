//! 重试引擎
//!
//! 周期扫描（默认 30 秒）status=retrying 且 next_attempt_at 已到期的
//! 投递记录，按到期顺序认领一批（默认 100 条，带跨实例租约），
//! 由原记录重建请求后重入路由器。
//!
//! 结果处理：任一渠道 sent/delivered -> 记录转 sent 并结束；否则
//! 重试计数加一，达到上限（默认 5）时写死信并标记 failed，未达上限
//! 时按固定延迟表排下一次尝试。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify_shared::config::RetryConfig;
use notify_shared::retry::RetrySchedule;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::error::Result;
use crate::router::Router;
use crate::stores::{DlqRecord, DlqStore, HistoryStore};
use crate::types::{DeliveryRecord, DeliveryStatus, RouteResult};

/// 认领租约：租约期内其他实例不会重复选中同一记录
const CLAIM_LEASE: Duration = Duration::from_secs(300);

/// 重试引擎
pub struct RetryEngine {
    history: Arc<dyn HistoryStore>,
    dlq: Arc<dyn DlqStore>,
    router: Arc<Router>,
    audit: Arc<dyn AuditSink>,
    schedule: RetrySchedule,
    interval: Duration,
    batch_size: i64,
}

impl RetryEngine {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        dlq: Arc<dyn DlqStore>,
        router: Arc<Router>,
        audit: Arc<dyn AuditSink>,
        config: &RetryConfig,
    ) -> Self {
        Self {
            history,
            dlq,
            router,
            audit,
            schedule: RetrySchedule::from_millis(config.max_attempts, &config.schedule_ms),
            interval: Duration::from_millis(config.scan_interval_ms),
            batch_size: config.scan_batch_size,
        }
    }

    /// 扫描循环，直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            batch_size = self.batch_size,
            max_attempts = self.schedule.max_attempts,
            "重试引擎已启动"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，重试引擎完成当前轮后退出");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "重试扫描轮次出错");
                    }
                }
            }
        }

        info!("重试引擎已停止");
    }

    /// 执行一轮扫描，返回处理的记录数
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let records = self
            .history
            .claim_due_retries(now, CLAIM_LEASE, self.batch_size)
            .await?;

        if records.is_empty() {
            return Ok(0);
        }

        let count = records.len();
        info!(count, "认领到期重试记录");

        for record in records {
            self.process_record(record).await;
        }

        Ok(count)
    }

    /// 驱动一条记录的重试
    async fn process_record(&self, mut record: DeliveryRecord) {
        let request = record.to_request();

        let result = match self
            .router
            .reroute(record.notification_id, request, record.channel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                // 偏好存储不可用等瞬时故障：不消耗重试次数，
                // 租约到期后该记录会被重新认领
                warn!(
                    notification_id = %record.notification_id,
                    error = %e,
                    "重入路由失败，等待下一轮"
                );
                return;
            }
        };

        let now = Utc::now();

        if result.any_sent() {
            self.finish_as_sent(&mut record, &result, now).await;
            return;
        }

        // 本轮失败：计数加一
        let error = extract_failure_text(&result);
        let new_count = record.retry_count + 1;
        record.retry_count = new_count;
        record.error = Some(error.clone());
        record.last_attempt_at = Some(now);
        record.push_failure(new_count as u32, &error);

        if new_count >= self.schedule.max_attempts as i32 {
            self.finish_as_dead(&mut record, now).await;
        } else {
            record.status = DeliveryStatus::Retrying;
            let delay = self.schedule.delay_for_attempt(new_count as u32);
            record.next_attempt_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());

            self.persist(&record).await;

            let event = AuditEvent::new(
                AuditKind::RetryScheduled,
                record.notification_id.to_string(),
                record.user_id.clone(),
                vec![record.channel],
            )
            .with_details(serde_json::json!({
                "retryCount": record.retry_count,
                "nextAttemptAt": record.next_attempt_at,
                "error": record.error,
            }));
            self.audit.publish_quiet(&event).await;
        }
    }

    /// 重试成功：记录转 sent
    async fn finish_as_sent(
        &self,
        record: &mut DeliveryRecord,
        result: &RouteResult,
        now: chrono::DateTime<Utc>,
    ) {
        let success = result
            .attempts
            .iter()
            .find(|a| a.status.is_outbound_success());

        record.status = DeliveryStatus::Sent;
        record.sent_at = Some(now);
        record.last_attempt_at = Some(now);
        record.next_attempt_at = None;
        record.error = None;
        if let Some(attempt) = success {
            record.provider_message_id = attempt.provider_message_id.clone();
            if attempt.status == DeliveryStatus::Delivered {
                record.delivered_at = Some(now);
            }
        }

        self.persist(record).await;

        info!(
            notification_id = %record.notification_id,
            channel = %record.channel,
            retry_count = record.retry_count,
            "重试成功"
        );

        let event = AuditEvent::new(
            AuditKind::Sent,
            record.notification_id.to_string(),
            record.user_id.clone(),
            vec![record.channel],
        )
        .with_details(serde_json::json!({
            "retryCount": record.retry_count,
            "providerMessageId": record.provider_message_id,
        }));
        self.audit.publish_quiet(&event).await;
    }

    /// 重试耗尽：写死信快照并标记 failed
    async fn finish_as_dead(&self, record: &mut DeliveryRecord, now: chrono::DateTime<Utc>) {
        record.status = DeliveryStatus::Failed;
        record.next_attempt_at = None;
        record.last_attempt_at = Some(now);

        self.persist(record).await;

        let dlq_record = DlqRecord::from_delivery(record, "重试次数耗尽");
        if let Err(e) = self.dlq.insert(&dlq_record).await {
            // 死信写失败时记录仍是 failed，人工介入依据投递记录本身
            error!(
                notification_id = %record.notification_id,
                error = %e,
                "死信写入失败"
            );
            return;
        }

        warn!(
            notification_id = %record.notification_id,
            channel = %record.channel,
            total_attempts = record.retry_count,
            "重试耗尽，移入死信"
        );

        let event = AuditEvent::new(
            AuditKind::DlqMoved,
            record.notification_id.to_string(),
            record.user_id.clone(),
            vec![record.channel],
        )
        .with_details(serde_json::json!({
            "totalAttempts": record.retry_count,
            "failureReason": record.error,
        }));
        self.audit.publish_quiet(&event).await;
    }

    /// 管理操作：手工重试
    ///
    /// 仅允许 failed / retrying 状态的记录；重置计数与下次尝试时间后
    /// 同步驱动一轮。返回是否有记录被驱动。
    pub async fn manual_retry(&self, notification_id: Uuid) -> Result<bool> {
        let records = self.history.get_by_notification(notification_id).await?;
        let now = Utc::now();
        let mut driven = false;

        for mut record in records {
            if !matches!(
                record.status,
                DeliveryStatus::Failed | DeliveryStatus::Retrying
            ) {
                continue;
            }

            record.status = DeliveryStatus::Retrying;
            record.retry_count = 0;
            record.next_attempt_at = Some(now);
            record.error = None;
            self.history.upsert(&record).await?;

            self.process_record(record).await;
            driven = true;
        }

        Ok(driven)
    }

    async fn persist(&self, record: &DeliveryRecord) {
        if let Err(e) = self.history.upsert(record).await {
            warn!(
                notification_id = %record.notification_id,
                error = %e,
                "重试记录写入失败"
            );
        }
    }
}

/// 从路由结果提取失败说明
fn extract_failure_text(result: &RouteResult) -> String {
    if let Some(attempt) = result.attempts.iter().find(|a| a.error.is_some()) {
        return attempt.error.clone().unwrap_or_default();
    }
    if let Some(skip) = result.skips.first() {
        return skip.reason.to_string();
    }
    "no channel attempted".to_string()
}
