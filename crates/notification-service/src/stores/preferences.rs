//! 用户偏好存储
//!
//! PostgreSQL JSONB 文档，user_id 唯一。读路径带进程内 TTL 缓存
//! （约 5 分钟），写入时失效对应条目。偏好是所有投递策略的前提，
//! 因此这一存储不可用时路由调用直接失败，不做 fail-open。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use notify_shared::error::{NotifyError, Result};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::debug;

use crate::preferences::UserPreferences;

/// 缓存条目 TTL
const CACHE_TTL: Duration = Duration::from_secs(300);

/// 偏好存储接口
#[async_trait]
pub trait PreferencesStore: Send + Sync {
    /// 读取用户偏好；不存在时落库并返回默认偏好
    async fn get_or_create(&self, user_id: &str) -> Result<UserPreferences>;

    /// 保存偏好并使缓存失效
    async fn save(&self, prefs: &UserPreferences) -> Result<()>;

    /// 枚举开启了摘要的用户（摘要引擎每次触发时调用）
    async fn list_digest_enabled(&self) -> Result<Vec<UserPreferences>>;
}

/// PostgreSQL 偏好存储
pub struct PgPreferencesStore {
    pool: PgPool,
    /// 进程内读穿缓存：user_id -> (文档, 载入时刻)
    cache: RwLock<HashMap<String, (UserPreferences, Instant)>>,
}

impl PgPreferencesStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn cache_get(&self, user_id: &str) -> Option<UserPreferences> {
        let cache = self.cache.read().await;
        cache.get(user_id).and_then(|(prefs, loaded_at)| {
            if loaded_at.elapsed() < CACHE_TTL {
                Some(prefs.clone())
            } else {
                None
            }
        })
    }

    async fn cache_put(&self, prefs: &UserPreferences) {
        let mut cache = self.cache.write().await;
        cache.insert(prefs.user_id.clone(), (prefs.clone(), Instant::now()));
    }

    async fn cache_invalidate(&self, user_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(user_id);
    }

    fn decode_document(raw: serde_json::Value) -> Result<UserPreferences> {
        serde_json::from_value(raw)
            .map_err(|e| NotifyError::Internal(format!("偏好文档解码失败: {e}")))
    }
}

#[async_trait]
impl PreferencesStore for PgPreferencesStore {
    async fn get_or_create(&self, user_id: &str) -> Result<UserPreferences> {
        if let Some(prefs) = self.cache_get(user_id).await {
            return Ok(prefs);
        }

        let row = sqlx::query("SELECT document FROM user_preferences WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let prefs = match row {
            Some(row) => Self::decode_document(row.get("document"))?,
            None => {
                // 首次出现的用户：写入默认文档。并发竞争时以先写入者为准。
                let defaults = UserPreferences::defaults_for(user_id);
                let document = serde_json::to_value(&defaults)
                    .map_err(|e| NotifyError::Internal(format!("偏好文档编码失败: {e}")))?;

                sqlx::query(
                    r#"
                    INSERT INTO user_preferences (user_id, document, updated_at)
                    VALUES ($1, $2, NOW())
                    ON CONFLICT (user_id) DO NOTHING
                    "#,
                )
                .bind(user_id)
                .bind(&document)
                .execute(&self.pool)
                .await?;

                debug!(user_id, "已为新用户创建默认偏好");
                defaults
            }
        };

        self.cache_put(&prefs).await;
        Ok(prefs)
    }

    async fn save(&self, prefs: &UserPreferences) -> Result<()> {
        let mut updated = prefs.clone();
        updated.updated_at = Utc::now();

        let document = serde_json::to_value(&updated)
            .map_err(|e| NotifyError::Internal(format!("偏好文档编码失败: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO user_preferences (user_id, document, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&updated.user_id)
        .bind(&document)
        .bind(updated.updated_at)
        .execute(&self.pool)
        .await?;

        // 写失效：下一次读取回源加载最新文档
        self.cache_invalidate(&updated.user_id).await;
        Ok(())
    }

    async fn list_digest_enabled(&self) -> Result<Vec<UserPreferences>> {
        let rows = sqlx::query(
            r#"
            SELECT document
            FROM user_preferences
            WHERE (document #>> '{digest,enabled}')::boolean = true
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(Self::decode_document(row.get("document"))?);
        }
        Ok(result)
    }
}
