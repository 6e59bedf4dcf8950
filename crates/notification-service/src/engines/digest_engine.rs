//! 摘要引擎
//!
//! 周期任务（默认 60 秒检查一次），每小时至多触发一次，且只在
//! 整点后的宽限窗口（默认 5 分钟）内触发。枚举开启摘要的用户：
//!
//! - hourly 每个整点触发；
//! - daily 在用户时区的当前小时等于配置的摘要小时时触发；
//! - weekly 额外要求周一。
//!
//! 触发时读取该用户的摘要队列，组装一封汇总邮件经 Email 适配器
//! 发送；只有确认 sent 才清空队列并把关联投递记录标记 delivered，
//! 失败时队列原样保留，下个周期重新组装。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use notify_shared::config::DigestConfig;
use notify_shared::crypto::FieldEncryptor;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRequest, ProviderAdapter};
use crate::audit::{AuditEvent, AuditKind, AuditSink};
use crate::error::Result;
use crate::preferences::UserPreferences;
use crate::stores::{DigestQueue, HistoryStore, PreferencesStore};
use crate::types::{Channel, DigestEntry, DigestFrequency, Priority};

/// 摘要引擎
pub struct DigestEngine {
    preferences: Arc<dyn PreferencesStore>,
    queue: Arc<dyn DigestQueue>,
    history: Arc<dyn HistoryStore>,
    email: Arc<dyn ProviderAdapter>,
    audit: Arc<dyn AuditSink>,
    encryptor: Arc<FieldEncryptor>,
    config: DigestConfig,
    /// 最近一次触发的小时桶（epoch 小时数），保证每小时至多一次
    last_fired_hour: Mutex<Option<i64>>,
}

impl DigestEngine {
    pub fn new(
        preferences: Arc<dyn PreferencesStore>,
        queue: Arc<dyn DigestQueue>,
        history: Arc<dyn HistoryStore>,
        email: Arc<dyn ProviderAdapter>,
        audit: Arc<dyn AuditSink>,
        encryptor: Arc<FieldEncryptor>,
        config: DigestConfig,
    ) -> Self {
        Self {
            preferences,
            queue,
            history,
            email,
            audit,
            encryptor,
            config,
            last_fired_hour: Mutex::new(None),
        }
    }

    /// 扫描循环，直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("摘要引擎已按配置禁用");
            return;
        }

        info!(
            check_interval_ms = self.config.check_interval_ms,
            fire_grace_minutes = self.config.fire_grace_minutes,
            "摘要引擎已启动"
        );

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.check_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，摘要引擎完成当前轮后退出");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "摘要扫描轮次出错");
                    }
                }
            }
        }

        info!("摘要引擎已停止");
    }

    /// 执行一轮检查，返回成功发出的摘要数
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        // 整点宽限窗口外不触发：错过本小时就等下一个整点
        if now.minute() > self.config.fire_grace_minutes {
            return Ok(0);
        }

        // 每小时至多一次
        let hour_bucket = now.timestamp() / 3_600;
        {
            let mut last = self.last_fired_hour.lock().await;
            if *last == Some(hour_bucket) {
                return Ok(0);
            }
            *last = Some(hour_bucket);
        }

        let users = self.preferences.list_digest_enabled().await?;
        debug!(user_count = users.len(), "枚举摘要用户");

        let mut sent = 0usize;
        for prefs in users {
            if !should_fire(&prefs, now) {
                continue;
            }
            match self.assemble_and_send(&prefs).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                // 单个用户的失败不阻塞其他用户的摘要
                Err(e) => {
                    warn!(user_id = %prefs.user_id, error = %e, "摘要组装失败");
                }
            }
        }

        if sent > 0 {
            info!(sent, "本轮摘要发送完成");
        }
        Ok(sent)
    }

    /// 管理操作：立即为某用户触发摘要，绕过时间闸门
    pub async fn force_digest(&self, user_id: &str) -> Result<bool> {
        let prefs = self.preferences.get_or_create(user_id).await?;
        self.assemble_and_send(&prefs).await
    }

    /// 组装并发送一个用户的摘要
    ///
    /// 队列为空或用户无已验证邮箱时返回 false；发送失败时队列
    /// 保持原样（下一轮重试），返回 false。
    async fn assemble_and_send(&self, prefs: &UserPreferences) -> Result<bool> {
        let frequency = prefs.digest.frequency;
        let entries = self.queue.entries(&prefs.user_id, frequency).await?;
        if entries.is_empty() {
            return Ok(false);
        }

        if !prefs.contact.has_verified_email() {
            warn!(
                user_id = %prefs.user_id,
                queued = entries.len(),
                "用户无已验证邮箱，摘要暂留队列"
            );
            return Ok(false);
        }

        let contact = prefs.resolve_contact(&self.encryptor)?;
        let (title, body) = compose_digest(frequency, &entries);

        let request = AdapterRequest {
            notification_id: Uuid::now_v7(),
            user_id: prefs.user_id.clone(),
            kind: entries[0].kind,
            priority: Priority::Medium,
            title,
            body,
            data: serde_json::json!({
                "_digest": true,
                "entryCount": entries.len(),
                "frequency": frequency.as_str(),
            }),
            contact,
            silent: false,
        };

        let outcome = self.email.send(&request).await?;
        if !outcome.is_success() {
            warn!(
                user_id = %prefs.user_id,
                error = ?outcome.error,
                "摘要邮件发送失败，队列保留待下轮"
            );
            return Ok(false);
        }

        // 确认送出后才清队列并把关联记录标记 delivered
        self.queue.clear(&prefs.user_id, frequency).await?;

        let notification_ids: Vec<Uuid> = entries.iter().map(|e| e.notification_id).collect();
        if let Err(e) = self.history.mark_delivered(&notification_ids).await {
            warn!(user_id = %prefs.user_id, error = %e, "摘要记录标记 delivered 失败");
        }

        for entry in &entries {
            let event = AuditEvent::new(
                AuditKind::Delivered,
                entry.notification_id.to_string(),
                prefs.user_id.clone(),
                vec![Channel::Email],
            )
            .with_details(serde_json::json!({
                "digest": true,
                "frequency": frequency.as_str(),
            }));
            self.audit.publish_quiet(&event).await;
        }

        info!(
            user_id = %prefs.user_id,
            entries = entries.len(),
            frequency = frequency.as_str(),
            "摘要邮件已发出"
        );
        Ok(true)
    }
}

/// 用户的摘要是否应在当前时刻触发
///
/// 时间判定一律在用户时区进行；时区缺失或非法时回退 UTC。
fn should_fire(prefs: &UserPreferences, now: DateTime<Utc>) -> bool {
    match prefs.digest.frequency {
        DigestFrequency::Hourly => true,
        DigestFrequency::Daily | DigestFrequency::Weekly => {
            let tz: Tz = prefs
                .digest_timezone()
                .and_then(|name| name.parse().ok())
                .unwrap_or(chrono_tz::UTC);
            let local = now.with_timezone(&tz);

            let hour_matches = local.hour() == prefs.digest.hour;
            match prefs.digest.frequency {
                DigestFrequency::Weekly => hour_matches && local.weekday() == Weekday::Mon,
                _ => hour_matches,
            }
        }
    }
}

/// 组装摘要邮件的标题与正文
fn compose_digest(frequency: DigestFrequency, entries: &[DigestEntry]) -> (String, String) {
    let period = match frequency {
        DigestFrequency::Hourly => "hourly",
        DigestFrequency::Daily => "daily",
        DigestFrequency::Weekly => "weekly",
    };

    let title = format!("Your {period} account summary");

    let mut body = format!(
        "Here is your {period} summary of {} notification(s):\n\n",
        entries.len()
    );
    for entry in entries {
        body.push_str(&format!(
            "* {} — {} ({})\n",
            entry.title,
            entry.body,
            entry.created_at.format("%Y-%m-%d %H:%M UTC")
        ));
    }

    (title, body)
}
