//! 路由决策引擎
//!
//! 单一入口 [`Router::route`]：把一条通知请求解析为一组渠道尝试。
//! 决策顺序（带提前返回）：
//!
//! 1. 分配通知 id
//! 2. 去重闸门（原子注册，重复则整体跳过）
//! 3. 加载偏好（存储不可用则调用失败——没有偏好无法执行任何策略）
//! 4. 解析渠道集合（用户覆盖 ∩ 全局开关，critical 空集时 socket 兜底）
//! 5. 免打扰闸门（critical 或穿透标志放行；可摘要则入摘要队列）
//! 6. 渠道并发扇出（前置条件 -> 预算 -> 适配器 -> 记录）
//!
//! 错误策略：适配器异常产出 failed 记录但不破坏整个调用；去重/预算
//! 存储不可用按放行处理（fail-open，warn 日志）；投递记录写失败只记
//! 日志——丢一条审计比丢一次投递可接受。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use notify_shared::config::BudgetConfig;
use notify_shared::crypto::FieldEncryptor;
use notify_shared::retry::RetrySchedule;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRequest, ProviderAdapter};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::error::{Result, ServiceError};
use crate::preferences::{ResolvedContact, UserPreferences};
use crate::stores::{DedupStore, DigestQueue, HistoryStore, PreferencesStore, RateBudgetStore};
use crate::types::{
    BudgetLimits, Channel, ChannelAttempt, ChannelSkip, DeliveryRecord, DeliveryStatus,
    DigestEntry, NotificationRequest, Priority, RouteResult, SkipReason,
};

// ---------------------------------------------------------------------------
// RouterSettings
// ---------------------------------------------------------------------------

/// 路由器运行参数
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// 单请求渠道扇出的并发上限
    pub fanout_parallelism: usize,
    /// 服务级默认预算（用户覆盖具最终效力）
    pub default_budgets: BudgetConfig,
    /// 事件类型目录未指定时的默认去重窗口
    pub default_dedup_window: std::time::Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            fanout_parallelism: 4,
            default_budgets: BudgetConfig::default(),
            default_dedup_window: std::time::Duration::from_secs(300),
        }
    }
}

impl RouterSettings {
    /// 某渠道的服务级默认上限
    pub fn default_limits(&self, channel: Channel) -> BudgetLimits {
        match channel {
            Channel::Sms => BudgetLimits {
                hourly: self.default_budgets.sms_hourly,
                daily: self.default_budgets.sms_daily,
            },
            Channel::Email => BudgetLimits {
                hourly: self.default_budgets.email_hourly,
                daily: self.default_budgets.email_daily,
            },
            Channel::Push => BudgetLimits {
                hourly: self.default_budgets.push_hourly,
                daily: self.default_budgets.push_daily,
            },
            // socket 不受预算约束，此分支不会被消费路径触达
            Channel::Socket => BudgetLimits {
                hourly: u32::MAX,
                daily: u32::MAX,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// 单渠道处理的中间产物
enum ChannelOutcome {
    Skip {
        skip: ChannelSkip,
        record: Option<DeliveryRecord>,
    },
    Attempt {
        attempt: ChannelAttempt,
        record: DeliveryRecord,
    },
}

/// 路由决策引擎
///
/// 所有依赖经构造函数注入；运行期组合一次，测试注入内存假件。
pub struct Router {
    preferences: Arc<dyn PreferencesStore>,
    dedup: Arc<dyn DedupStore>,
    budgets: Arc<dyn RateBudgetStore>,
    history: Arc<dyn HistoryStore>,
    digest_queue: Arc<dyn DigestQueue>,
    adapters: HashMap<Channel, Arc<dyn ProviderAdapter>>,
    audit: Arc<dyn AuditSink>,
    encryptor: Arc<FieldEncryptor>,
    settings: RouterSettings,
    schedule: RetrySchedule,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        preferences: Arc<dyn PreferencesStore>,
        dedup: Arc<dyn DedupStore>,
        budgets: Arc<dyn RateBudgetStore>,
        history: Arc<dyn HistoryStore>,
        digest_queue: Arc<dyn DigestQueue>,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        audit: Arc<dyn AuditSink>,
        encryptor: Arc<FieldEncryptor>,
        settings: RouterSettings,
        schedule: RetrySchedule,
    ) -> Self {
        let adapters = adapters.into_iter().map(|a| (a.channel(), a)).collect();
        Self {
            preferences,
            dedup,
            budgets,
            history,
            digest_queue,
            adapters,
            audit,
            encryptor,
            settings,
            schedule,
        }
    }

    /// 路由一条通知请求
    #[instrument(skip(self, request), fields(user_id = %request.user_id, kind = %request.kind))]
    pub async fn route(&self, request: NotificationRequest) -> Result<RouteResult> {
        let notification_id = Uuid::now_v7();
        self.route_inner(notification_id, request, None, true).await
    }

    /// 重试重入：沿用原通知 id，渠道钉死为记录所属渠道，不落新记录
    ///
    /// 去重闸门对"既有注册者就是自己"的情况放行，因此重入不会
    /// 被自己的首次注册挡下，也不会削弱对真正新请求的去重。
    pub async fn reroute(
        &self,
        notification_id: Uuid,
        request: NotificationRequest,
        channel: Channel,
    ) -> Result<RouteResult> {
        self.route_inner(notification_id, request, Some(channel), false)
            .await
    }

    async fn route_inner(
        &self,
        notification_id: Uuid,
        request: NotificationRequest,
        pinned_channel: Option<Channel>,
        persist: bool,
    ) -> Result<RouteResult> {
        let mut result = RouteResult::new(notification_id.to_string());
        let now = Utc::now();
        let kind_config = request.kind.config();
        let priority = request.effective_priority();

        // ---- 去重闸门（fail-open） ----
        let dedup_window = kind_config
            .dedup_window
            .unwrap_or(self.settings.default_dedup_window);
        match self
            .dedup
            .check_and_register(
                &request.user_id,
                request.kind,
                request.source_key(),
                &result.notification_id,
                dedup_window,
            )
            .await
        {
            Ok(outcome) if outcome.duplicate => {
                let original = outcome
                    .original_notification_id
                    .unwrap_or_else(|| "unknown".to_string());
                // 注册者就是本通知时是重试重入，放行
                if original != result.notification_id {
                    debug!(original_notification_id = %original, "去重窗口内的重复请求");
                    result.skips.push(ChannelSkip {
                        channel: None,
                        reason: SkipReason::Duplicate {
                            original_notification_id: original,
                        },
                    });
                    return Ok(result);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "去重存储不可用，按非重复放行");
            }
        }

        // ---- 偏好（不可用则调用失败） ----
        let prefs = self
            .preferences
            .get_or_create(&request.user_id)
            .await
            .map_err(|e| ServiceError::PreferencesUnavailable(e.to_string()))?;

        if prefs.is_do_not_contact(now) {
            debug!("用户开启勿扰，全渠道跳过");
            result.skips.push(ChannelSkip {
                channel: None,
                reason: SkipReason::DoNotContact,
            });
            return Ok(result);
        }

        // ---- 渠道集合 ----
        let mut channels = prefs.channels_for(request.kind);
        if priority.is_critical() && channels.is_empty() && prefs.channels.socket {
            // critical 不允许无声消失：socket 全局开启时强制兜底
            channels.push(Channel::Socket);
        }
        if let Some(pinned) = pinned_channel {
            channels.retain(|c| *c == pinned);
        }

        // ---- 免打扰闸门 ----
        if !priority.is_critical()
            && !prefs.bypasses_quiet_hours(request.kind)
            && prefs
                .quiet_hours
                .as_ref()
                .is_some_and(|qh| qh.is_quiet_at(now))
        {
            return Ok(self
                .defer_for_quiet_hours(notification_id, &request, &prefs, priority, result, persist)
                .await);
        }

        // ---- 渠道并发扇出 ----
        let contact = prefs.resolve_contact(&self.encryptor)?;
        let semaphore = Arc::new(Semaphore::new(self.settings.fanout_parallelism.max(1)));

        let attempt_futures: Vec<_> = channels
            .iter()
            .map(|channel| {
                let semaphore = semaphore.clone();
                let channel = *channel;
                let request = &request;
                let prefs = &prefs;
                let contact = &contact;
                async move {
                    // 信号量 closed 只发生在进程退出路径，此处不可达
                    let _permit = semaphore.acquire().await.expect("信号量未关闭");
                    self.attempt_channel(
                        notification_id,
                        request,
                        prefs,
                        contact,
                        channel,
                        priority,
                        now,
                    )
                    .await
                }
            })
            .collect();

        let outcomes = join_all(attempt_futures).await;

        for outcome in outcomes {
            match outcome {
                ChannelOutcome::Skip { skip, record } => {
                    if persist && let Some(record) = record {
                        self.persist_record(&record).await;
                    }
                    result.skips.push(skip);
                }
                ChannelOutcome::Attempt { attempt, record } => {
                    if persist {
                        self.persist_record(&record).await;
                        self.publish_attempt_audit(&record, &attempt).await;
                    }
                    result.attempts.push(attempt);
                }
            }
        }

        info!(
            notification_id = %result.notification_id,
            attempts = result.attempts.len(),
            skips = result.skips.len(),
            "路由完成"
        );
        Ok(result)
    }

    /// 免打扰延迟路径：可摘要则入队，否则仅标记 queued
    async fn defer_for_quiet_hours(
        &self,
        notification_id: Uuid,
        request: &NotificationRequest,
        prefs: &UserPreferences,
        priority: Priority,
        mut result: RouteResult,
        persist: bool,
    ) -> RouteResult {
        let kind_config = request.kind.config();

        if kind_config.digest_eligible && prefs.digest.enabled {
            let entry = DigestEntry {
                notification_id,
                kind: request.kind,
                title: request.title.clone(),
                body: request.body.clone(),
                created_at: Utc::now(),
                data: serde_json::to_value(&request.data).unwrap_or(serde_json::Value::Null),
            };

            match self
                .digest_queue
                .append(&request.user_id, prefs.digest.frequency, &entry)
                .await
            {
                Ok(queue_len) => {
                    debug!(queue_len, "通知已入摘要队列");
                    if persist {
                        let mut record =
                            DeliveryRecord::new(notification_id, request, Channel::Email, priority);
                        record.status = DeliveryStatus::QueuedForDigest;
                        self.persist_record(&record).await;
                    }
                    result.digest_queued = true;
                }
                Err(e) => {
                    // 摘要队列故障时降级为普通延迟，通知不丢但也不重复
                    warn!(error = %e, "摘要队列不可用，降级为延迟");
                    result.queued = true;
                }
            }
        } else {
            result.queued = true;
        }

        result.skips.push(ChannelSkip {
            channel: None,
            reason: SkipReason::QuietHours,
        });
        result
    }

    /// 单渠道处理：前置条件 -> 预算 -> 适配器调用 -> 记录组装
    #[allow(clippy::too_many_arguments)]
    async fn attempt_channel(
        &self,
        notification_id: Uuid,
        request: &NotificationRequest,
        prefs: &UserPreferences,
        contact: &ResolvedContact,
        channel: Channel,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> ChannelOutcome {
        let Some(adapter) = self.adapters.get(&channel) else {
            return ChannelOutcome::Skip {
                skip: ChannelSkip {
                    channel: Some(channel),
                    reason: SkipReason::ChannelDisabled,
                },
                record: None,
            };
        };

        // 前置条件先于预算消费：因缺联系方式而跳过不得扣减预算额度
        if let Some(detail) = missing_contact(prefs, channel) {
            return ChannelOutcome::Skip {
                skip: ChannelSkip {
                    channel: Some(channel),
                    reason: SkipReason::MissingContact { detail },
                },
                record: None,
            };
        }

        // 预算闸门（socket 豁免；存储不可用按放行处理）
        if channel.is_budgeted() {
            let limits = prefs.budget_limits_for(channel, self.settings.default_limits(channel));
            match self.budgets.consume(&request.user_id, channel, limits).await {
                Ok(decision) if !decision.allowed => {
                    let mut record = DeliveryRecord::new(notification_id, request, channel, priority);
                    record.status = DeliveryStatus::RateLimited;
                    return ChannelOutcome::Skip {
                        skip: ChannelSkip {
                            channel: Some(channel),
                            reason: SkipReason::RateLimited {
                                reset_at: decision.reset_at,
                            },
                        },
                        record: Some(record),
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(channel = %channel, error = %e, "预算存储不可用，按放行处理");
                }
            }
        }

        // 适配器调用
        let adapter_request = AdapterRequest {
            notification_id,
            user_id: request.user_id.clone(),
            kind: request.kind,
            priority,
            title: request.title.clone(),
            body: request.body.clone(),
            data: serde_json::to_value(&request.data).unwrap_or(serde_json::Value::Null),
            contact: contact.clone(),
            silent: request
                .data
                .get("silent")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        };

        let outcome = match adapter.send(&adapter_request).await {
            Ok(outcome) => outcome,
            // 适配器异常降格为 failed 结果，调用整体不失败
            Err(e) => {
                warn!(channel = %channel, error = %e, "适配器异常");
                crate::adapters::AdapterOutcome::failed(e.to_string())
            }
        };

        // 记录组装
        let mut record = DeliveryRecord::new(notification_id, request, channel, priority);
        record.provider = Some(adapter.provider_tag().to_string());
        record.provider_message_id = outcome.provider_message_id.clone();
        record.last_attempt_at = Some(now);

        match outcome.status {
            DeliveryStatus::Delivered => {
                record.status = DeliveryStatus::Delivered;
                record.sent_at = Some(now);
                record.delivered_at = Some(now);
            }
            DeliveryStatus::Sent => {
                record.status = DeliveryStatus::Sent;
                record.sent_at = Some(now);
            }
            _ => {
                // 失败进入重试轨道：本次算第 1 次尝试
                let error = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown provider failure".to_string());
                record.status = DeliveryStatus::Retrying;
                record.retry_count = 1;
                record.error = Some(error.clone());
                record.push_failure(1, &error);
                record.next_attempt_at = Some(
                    now + chrono::Duration::from_std(self.schedule.delay_for_attempt(1))
                        .unwrap_or_default(),
                );
            }
        }

        ChannelOutcome::Attempt {
            attempt: ChannelAttempt {
                channel,
                status: record.status,
                provider_message_id: record.provider_message_id.clone(),
                error: record.error.clone(),
            },
            record,
        }
    }

    /// 持久化投递记录；失败只记日志，不中断路由
    async fn persist_record(&self, record: &DeliveryRecord) {
        if let Err(e) = self.history.upsert(record).await {
            warn!(
                notification_id = %record.notification_id,
                channel = %record.channel,
                error = %e,
                "投递记录写入失败"
            );
        }
    }

    /// 按渠道尝试结果发布审计事件
    async fn publish_attempt_audit(&self, record: &DeliveryRecord, attempt: &ChannelAttempt) {
        let kind = match attempt.status {
            DeliveryStatus::Delivered => AuditKind::Delivered,
            DeliveryStatus::Sent => AuditKind::Sent,
            _ => AuditKind::Failed,
        };

        let event = AuditEvent::new(
            kind,
            record.notification_id.to_string(),
            record.user_id.clone(),
            vec![attempt.channel],
        )
        .with_details(serde_json::json!({
            "providerMessageId": attempt.provider_message_id,
            "error": attempt.error,
            "sentAt": record.sent_at,
            "deliveredAt": record.delivered_at,
        }));

        self.audit.publish_quiet(&event).await;
    }
}

/// 渠道前置条件检查；返回缺失说明
fn missing_contact(prefs: &UserPreferences, channel: Channel) -> Option<String> {
    match channel {
        Channel::Sms if !prefs.contact.has_verified_phone() => {
            Some("no verified phone number".to_string())
        }
        Channel::Email if !prefs.contact.has_verified_email() => {
            Some("no verified email address".to_string())
        }
        Channel::Push if prefs.devices.is_empty() => {
            Some("no registered push devices".to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_match_service_defaults() {
        let settings = RouterSettings::default();
        assert_eq!(
            settings.default_limits(Channel::Sms),
            BudgetLimits {
                hourly: 10,
                daily: 50
            }
        );
        assert_eq!(
            settings.default_limits(Channel::Email),
            BudgetLimits {
                hourly: 20,
                daily: 100
            }
        );
        assert_eq!(
            settings.default_limits(Channel::Push),
            BudgetLimits {
                hourly: 30,
                daily: 200
            }
        );
    }

    #[test]
    fn test_missing_contact_checks() {
        let prefs = UserPreferences::defaults_for("u-1");

        // 默认偏好没有任何联系方式
        assert!(missing_contact(&prefs, Channel::Sms).is_some());
        assert!(missing_contact(&prefs, Channel::Email).is_some());
        assert!(missing_contact(&prefs, Channel::Push).is_some());
        // socket 无前置条件
        assert!(missing_contact(&prefs, Channel::Socket).is_none());
    }
}
