//! 集成测试支撑：全部存储与适配器的内存假件
//!
//! 路由器和引擎通过构造函数注入依赖，这里用进程内数据结构替换
//! PostgreSQL / Redis / Kafka / 服务商，驱动端到端场景。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use notify_shared::crypto::FieldEncryptor;
use notify_shared::error::{NotifyError, Result};
use notify_shared::retry::RetrySchedule;

use notification_service::adapters::{AdapterOutcome, AdapterRequest, ProviderAdapter};
use notification_service::audit::{AuditEvent, AuditKind, AuditSink};
use notification_service::catalog::EventKind;
use notification_service::preferences::{PushDevice, UserPreferences};
use notification_service::router::{Router, RouterSettings};
use notification_service::stores::{
    DedupStore, DigestQueue, DlqRecord, DlqStore, HistoryStore, PreferencesStore, RateBudgetStore,
};
use notification_service::types::{
    BudgetDecision, BudgetLimits, Channel, DedupOutcome, DeliveryRecord, DeliveryStatus,
    DigestEntry, DigestFrequency,
};

/// 测试用固定加密密钥
pub fn test_encryptor() -> Arc<FieldEncryptor> {
    let key: Vec<u8> = (0u8..32).collect();
    Arc::new(FieldEncryptor::new(&key).expect("测试密钥合法"))
}

/// 带已验证手机/邮箱和一台注册设备的用户偏好
pub fn verified_prefs(user_id: &str, encryptor: &FieldEncryptor) -> UserPreferences {
    let mut prefs = UserPreferences::defaults_for(user_id);
    prefs.contact.phone_encrypted = Some(encryptor.encrypt("+14155550123").unwrap());
    prefs.contact.phone_verified_at = Some(Utc::now());
    prefs.contact.email_encrypted = Some(encryptor.encrypt("user@example.com").unwrap());
    prefs.contact.email_verified_at = Some(Utc::now());
    prefs.devices.push(PushDevice {
        device_id: "d-1".to_string(),
        token_encrypted: encryptor.encrypt("push-token-abcdef123456").unwrap(),
        platform: "ios".to_string(),
        last_seen_at: Utc::now(),
    });
    prefs
}

// ---------------------------------------------------------------------------
// 偏好存储假件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPreferencesStore {
    docs: Mutex<HashMap<String, UserPreferences>>,
    pub fail: AtomicBool,
}

impl MemoryPreferencesStore {
    pub async fn put(&self, prefs: UserPreferences) {
        self.docs.lock().await.insert(prefs.user_id.clone(), prefs);
    }
}

#[async_trait]
impl PreferencesStore for MemoryPreferencesStore {
    async fn get_or_create(&self, user_id: &str) -> Result<UserPreferences> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Internal("偏好存储已注入故障".to_string()));
        }
        let mut docs = self.docs.lock().await;
        Ok(docs
            .entry(user_id.to_string())
            .or_insert_with(|| UserPreferences::defaults_for(user_id))
            .clone())
    }

    async fn save(&self, prefs: &UserPreferences) -> Result<()> {
        self.docs
            .lock()
            .await
            .insert(prefs.user_id.clone(), prefs.clone());
        Ok(())
    }

    async fn list_digest_enabled(&self) -> Result<Vec<UserPreferences>> {
        Ok(self
            .docs
            .lock()
            .await
            .values()
            .filter(|p| p.digest.enabled)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// 去重存储假件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDedupStore {
    entries: Mutex<HashMap<String, (String, Instant, Duration)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_register(
        &self,
        user_id: &str,
        kind: EventKind,
        source_id: &str,
        notification_id: &str,
        window: Duration,
    ) -> Result<DedupOutcome> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Internal("去重存储已注入故障".to_string()));
        }

        let key = format!("{user_id}:{kind}:{source_id}");
        let mut entries = self.entries.lock().await;

        if let Some((original, registered_at, ttl)) = entries.get(&key)
            && registered_at.elapsed() < *ttl
        {
            return Ok(DedupOutcome {
                duplicate: true,
                original_notification_id: Some(original.clone()),
            });
        }

        entries.insert(key, (notification_id.to_string(), Instant::now(), window));
        Ok(DedupOutcome {
            duplicate: false,
            original_notification_id: None,
        })
    }
}

// ---------------------------------------------------------------------------
// 速率预算假件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRateBudgetStore {
    counts: Mutex<HashMap<(String, Channel), (u32, u32)>>,
    pub fail: AtomicBool,
}

impl MemoryRateBudgetStore {
    /// 当前已消费的 (小时, 天) 计数
    pub async fn used(&self, user_id: &str, channel: Channel) -> (u32, u32) {
        self.counts
            .lock()
            .await
            .get(&(user_id.to_string(), channel))
            .copied()
            .unwrap_or((0, 0))
    }
}

#[async_trait]
impl RateBudgetStore for MemoryRateBudgetStore {
    async fn consume(
        &self,
        user_id: &str,
        channel: Channel,
        limits: BudgetLimits,
    ) -> Result<BudgetDecision> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Internal("预算存储已注入故障".to_string()));
        }

        let mut counts = self.counts.lock().await;
        let entry = counts.entry((user_id.to_string(), channel)).or_insert((0, 0));

        if entry.0 >= limits.hourly || entry.1 >= limits.daily {
            return Ok(BudgetDecision {
                allowed: false,
                remaining: limits.hourly.saturating_sub(entry.0),
                reset_at: Utc::now() + chrono::Duration::minutes(30),
            });
        }

        entry.0 += 1;
        entry.1 += 1;
        Ok(BudgetDecision {
            allowed: true,
            remaining: limits.hourly - entry.0,
            reset_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn reset(&self, user_id: &str, channel: Option<Channel>) -> Result<()> {
        let mut counts = self.counts.lock().await;
        match channel {
            Some(c) => {
                counts.remove(&(user_id.to_string(), c));
            }
            None => counts.retain(|(u, _), _| u != user_id),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 投递记录假件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<HashMap<String, DeliveryRecord>>,
}

impl MemoryHistoryStore {
    pub async fn all(&self) -> Vec<DeliveryRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn by_status(&self, status: DeliveryStatus) -> Vec<DeliveryRecord> {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn upsert(&self, record: &DeliveryRecord) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn get_by_notification(&self, notification_id: Uuid) -> Result<Vec<DeliveryRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn claim_due_retries(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<DeliveryRecord>> {
        let mut records = self.records.lock().await;
        let mut due: Vec<DeliveryRecord> = records
            .values()
            .filter(|r| {
                r.status == DeliveryStatus::Retrying
                    && r.next_attempt_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_attempt_at);
        due.truncate(limit as usize);

        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();
        for record in &due {
            if let Some(stored) = records.get_mut(&record.idempotency_key) {
                stored.next_attempt_at = Some(lease_until);
            }
        }
        Ok(due)
    }

    async fn mark_delivered(&self, notification_ids: &[Uuid]) -> Result<u64> {
        let mut records = self.records.lock().await;
        let mut updated = 0;
        for record in records.values_mut() {
            if notification_ids.contains(&record.notification_id)
                && matches!(
                    record.status,
                    DeliveryStatus::Sent | DeliveryStatus::QueuedForDigest
                )
            {
                record.status = DeliveryStatus::Delivered;
                record.delivered_at = Some(Utc::now());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn mark_read(&self, notification_id: Uuid, at: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let mut updated = 0;
        for record in records.values_mut() {
            if record.notification_id == notification_id && record.read_at.is_none() {
                record.read_at = Some(at);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// 死信假件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDlqStore {
    records: Mutex<Vec<DlqRecord>>,
    pub fail: AtomicBool,
}

impl MemoryDlqStore {
    pub async fn all(&self) -> Vec<DlqRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn insert(&self, record: &DlqRecord) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::Internal("死信存储已注入故障".to_string()));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: notification_service::stores::ReviewStatus,
        limit: i64,
    ) -> Result<Vec<DlqRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.review_status == status)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn update_review(
        &self,
        id: Uuid,
        status: notification_service::stores::ReviewStatus,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<bool> {
        let mut records = self.records.lock().await;
        for record in records.iter_mut() {
            if record.id == id {
                record.review_status = status;
                record.reviewed_by = Some(reviewer.to_string());
                record.resolution_notes = notes.map(String::from);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// 摘要队列假件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryDigestQueue {
    queues: Mutex<HashMap<(String, DigestFrequency), Vec<DigestEntry>>>,
}

impl MemoryDigestQueue {
    pub async fn len(&self, user_id: &str, frequency: DigestFrequency) -> usize {
        self.queues
            .lock()
            .await
            .get(&(user_id.to_string(), frequency))
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl DigestQueue for MemoryDigestQueue {
    async fn append(
        &self,
        user_id: &str,
        frequency: DigestFrequency,
        entry: &DigestEntry,
    ) -> Result<u64> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry((user_id.to_string(), frequency)).or_default();
        queue.push(entry.clone());
        Ok(queue.len() as u64)
    }

    async fn entries(&self, user_id: &str, frequency: DigestFrequency) -> Result<Vec<DigestEntry>> {
        Ok(self
            .queues
            .lock()
            .await
            .get(&(user_id.to_string(), frequency))
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, user_id: &str, frequency: DigestFrequency) -> Result<()> {
        self.queues
            .lock()
            .await
            .remove(&(user_id.to_string(), frequency));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 审计假件
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn count_of(&self, kind: AuditKind) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn publish(&self, event: &AuditEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 可编排的适配器假件
// ---------------------------------------------------------------------------

/// 适配器行为脚本
#[derive(Debug, Clone)]
pub enum AdapterScript {
    Delivered,
    Sent,
    Fail(String),
}

pub struct ScriptedAdapter {
    channel: Channel,
    script: std::sync::Mutex<AdapterScript>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(channel: Channel, script: AdapterScript) -> Arc<Self> {
        Arc::new(Self {
            channel,
            script: std::sync::Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_script(&self, script: AdapterScript) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn provider_tag(&self) -> &str {
        "scripted-provider"
    }

    async fn send(&self, _request: &AdapterRequest) -> Result<AdapterOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().unwrap().clone();
        Ok(match script {
            AdapterScript::Delivered => AdapterOutcome::delivered(format!("msg_{}", Uuid::new_v4())),
            AdapterScript::Sent => AdapterOutcome::sent(format!("msg_{}", Uuid::new_v4())),
            AdapterScript::Fail(error) => AdapterOutcome::failed(error),
        })
    }
}

// ---------------------------------------------------------------------------
// 组装
// ---------------------------------------------------------------------------

/// 测试装配：路由器加全部假件的引用
pub struct Harness {
    pub router: Arc<Router>,
    pub preferences: Arc<MemoryPreferencesStore>,
    pub dedup: Arc<MemoryDedupStore>,
    pub budgets: Arc<MemoryRateBudgetStore>,
    pub history: Arc<MemoryHistoryStore>,
    pub dlq: Arc<MemoryDlqStore>,
    pub digest_queue: Arc<MemoryDigestQueue>,
    pub audit: Arc<MemoryAuditSink>,
    pub encryptor: Arc<FieldEncryptor>,
    pub socket: Arc<ScriptedAdapter>,
    pub sms: Arc<ScriptedAdapter>,
    pub email: Arc<ScriptedAdapter>,
    pub push: Arc<ScriptedAdapter>,
}

impl Harness {
    /// 默认装配：socket 即达，其余渠道接受
    pub fn new() -> Self {
        let preferences = Arc::new(MemoryPreferencesStore::default());
        let dedup = Arc::new(MemoryDedupStore::default());
        let budgets = Arc::new(MemoryRateBudgetStore::default());
        let history = Arc::new(MemoryHistoryStore::default());
        let dlq = Arc::new(MemoryDlqStore::default());
        let digest_queue = Arc::new(MemoryDigestQueue::default());
        let audit = Arc::new(MemoryAuditSink::default());
        let encryptor = test_encryptor();

        let socket = ScriptedAdapter::new(Channel::Socket, AdapterScript::Delivered);
        let sms = ScriptedAdapter::new(Channel::Sms, AdapterScript::Sent);
        let email = ScriptedAdapter::new(Channel::Email, AdapterScript::Sent);
        let push = ScriptedAdapter::new(Channel::Push, AdapterScript::Sent);

        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
            socket.clone(),
            sms.clone(),
            email.clone(),
            push.clone(),
        ];

        let router = Arc::new(Router::new(
            preferences.clone(),
            dedup.clone(),
            budgets.clone(),
            history.clone(),
            digest_queue.clone(),
            adapters,
            audit.clone(),
            encryptor.clone(),
            RouterSettings::default(),
            RetrySchedule::default(),
        ));

        Self {
            router,
            preferences,
            dedup,
            budgets,
            history,
            dlq,
            digest_queue,
            audit,
            encryptor,
            socket,
            sms,
            email,
            push,
        }
    }

    /// 注册一个联系方式齐全的用户
    pub async fn seed_verified_user(&self, user_id: &str) -> UserPreferences {
        let prefs = verified_prefs(user_id, &self.encryptor);
        self.preferences.put(prefs.clone()).await;
        prefs
    }
}
