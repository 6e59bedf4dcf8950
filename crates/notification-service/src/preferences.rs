//! 用户偏好模型
//!
//! 每个用户一份偏好文档：渠道开关、加密的联系方式、设备注册表、
//! 按事件类型的覆盖、免打扰时段、预算覆盖与勿扰开关。
//!
//! 联系方式（手机号、邮箱、设备令牌）在文档中只以密文出现，
//! 解密只发生在投递前的瞬时内存视图中。

use std::collections::HashMap;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::EventKind;
use crate::types::{BudgetLimits, Channel, DigestFrequency};

/// 设备注册表容量上限，超出时按 last_seen_at 淘汰最旧设备
pub const MAX_DEVICES: usize = 10;

// ---------------------------------------------------------------------------
// 子结构
// ---------------------------------------------------------------------------

/// 渠道总开关
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelToggles {
    pub socket: bool,
    pub sms: bool,
    pub email: bool,
    pub push: bool,
}

impl Default for ChannelToggles {
    fn default() -> Self {
        Self {
            socket: true,
            sms: true,
            email: true,
            push: true,
        }
    }
}

impl ChannelToggles {
    pub fn enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Socket => self.socket,
            Channel::Sms => self.sms,
            Channel::Email => self.email,
            Channel::Push => self.push,
        }
    }
}

/// 加密的联系方式与验证时间
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFields {
    pub phone_encrypted: Option<String>,
    pub phone_verified_at: Option<DateTime<Utc>>,
    pub email_encrypted: Option<String>,
    pub email_verified_at: Option<DateTime<Utc>>,
}

impl ContactFields {
    pub fn has_verified_phone(&self) -> bool {
        self.phone_encrypted.is_some() && self.phone_verified_at.is_some()
    }

    pub fn has_verified_email(&self) -> bool {
        self.email_encrypted.is_some() && self.email_verified_at.is_some()
    }
}

/// 已注册的推送设备
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDevice {
    pub device_id: String,
    /// 推送令牌密文
    pub token_encrypted: String,
    /// 平台标签（ios / android / web）
    pub platform: String,
    pub last_seen_at: DateTime<Utc>,
}

/// 按事件类型的偏好覆盖
///
/// 用户可以关闭某类通知或收窄其渠道；`bypass_quiet_hours` 只能
/// 放宽用户自己的免打扰（目录级穿透标志不受此影响）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindOverride {
    pub enabled: bool,
    pub channels: Option<Vec<Channel>>,
    pub bypass_quiet_hours: Option<bool>,
}

/// 免打扰时段
///
/// start > end 表示跨午夜窗口（如 22:00 - 07:00）。
/// 判定一律在用户时区进行，进程本地时间不参与。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// IANA 时区名（如 "America/New_York"）
    pub timezone: String,
    /// critical 优先级是否穿透（目录级 critical 总是穿透，此处
    /// 冗余保留供用户显式确认）
    pub critical_bypass: bool,
}

impl QuietHours {
    /// 给定 UTC 时刻是否落在免打扰窗口内
    pub fn is_quiet_at(&self, now: DateTime<Utc>) -> bool {
        let tz: Tz = match self.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(timezone = %self.timezone, "无法识别的时区，按不在免打扰时段处理");
                return false;
            }
        };

        let local = now.with_timezone(&tz).time();
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            // 跨午夜窗口
            local >= self.start || local < self.end
        }
    }
}

/// 勿扰开关
///
/// 启用后压制所有渠道，优先级高于任何渠道级开关；
/// `resume_at` 到期后自动恢复联系。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoNotContact {
    pub enabled: bool,
    pub reason: Option<String>,
    pub resume_at: Option<DateTime<Utc>>,
}

/// 摘要偏好
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestPrefs {
    pub enabled: bool,
    pub frequency: DigestFrequency,
    /// daily / weekly 摘要的触发小时（用户时区，0-23）
    pub hour: u32,
    /// 摘要时间判定所用时区；缺省沿用免打扰时段的时区
    pub timezone: Option<String>,
}

impl Default for DigestPrefs {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: DigestFrequency::Daily,
            hour: 9,
            timezone: None,
        }
    }
}

// ---------------------------------------------------------------------------
// UserPreferences
// ---------------------------------------------------------------------------

/// 用户偏好文档
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    pub user_id: String,
    #[serde(default)]
    pub channels: ChannelToggles,
    #[serde(default)]
    pub contact: ContactFields,
    #[serde(default)]
    pub devices: Vec<PushDevice>,
    #[serde(default)]
    pub kind_overrides: HashMap<EventKind, KindOverride>,
    pub quiet_hours: Option<QuietHours>,
    /// 渠道预算覆盖；存在即具最终效力，可放宽或收紧服务默认值
    #[serde(default)]
    pub budget_overrides: HashMap<Channel, BudgetLimits>,
    #[serde(default)]
    pub do_not_contact: DoNotContact,
    #[serde(default)]
    pub digest: DigestPrefs,
    pub updated_at: DateTime<Utc>,
}

impl UserPreferences {
    /// 新用户的默认偏好：全渠道开启、无联系方式、无免打扰
    pub fn defaults_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            channels: ChannelToggles::default(),
            contact: ContactFields::default(),
            devices: Vec::new(),
            kind_overrides: HashMap::new(),
            quiet_hours: None,
            budget_overrides: HashMap::new(),
            do_not_contact: DoNotContact::default(),
            digest: DigestPrefs::default(),
            updated_at: Utc::now(),
        }
    }

    /// 勿扰是否在指定时刻生效
    pub fn is_do_not_contact(&self, now: DateTime<Utc>) -> bool {
        if !self.do_not_contact.enabled {
            return false;
        }
        match self.do_not_contact.resume_at {
            // 恢复时间已过，勿扰自动失效
            Some(resume_at) => now < resume_at,
            None => true,
        }
    }

    /// 注册设备；容量满时淘汰 last_seen_at 最旧的设备
    ///
    /// 同一 device_id 重复注册视为令牌/平台更新。
    pub fn register_device(&mut self, device: PushDevice) {
        if let Some(existing) = self
            .devices
            .iter_mut()
            .find(|d| d.device_id == device.device_id)
        {
            *existing = device;
            return;
        }

        if self.devices.len() >= MAX_DEVICES {
            if let Some(oldest_idx) = self
                .devices
                .iter()
                .enumerate()
                .min_by_key(|(_, d)| d.last_seen_at)
                .map(|(i, _)| i)
            {
                self.devices.remove(oldest_idx);
            }
        }
        self.devices.push(device);
    }

    /// 解析某事件类型的用户侧渠道集合
    ///
    /// 覆盖存在且禁用 -> 空集；覆盖指定渠道 -> 用覆盖；
    /// 否则用目录默认。结果再与全局渠道开关求交。
    pub fn channels_for(&self, kind: EventKind) -> Vec<Channel> {
        let base: Vec<Channel> = match self.kind_overrides.get(&kind) {
            Some(ov) if !ov.enabled => return Vec::new(),
            Some(ov) => match &ov.channels {
                Some(chosen) => chosen.clone(),
                None => kind.config().default_channels.to_vec(),
            },
            None => kind.config().default_channels.to_vec(),
        };

        base.into_iter()
            .filter(|c| self.channels.enabled(*c))
            .collect()
    }

    /// 某事件类型是否穿透免打扰：目录级标志或用户覆盖任一为真即穿透
    pub fn bypasses_quiet_hours(&self, kind: EventKind) -> bool {
        if kind.config().bypass_quiet_hours {
            return true;
        }
        self.kind_overrides
            .get(&kind)
            .and_then(|ov| ov.bypass_quiet_hours)
            .unwrap_or(false)
    }

    /// 某渠道的生效预算上限：用户覆盖具有最终效力
    pub fn budget_limits_for(&self, channel: Channel, defaults: BudgetLimits) -> BudgetLimits {
        self.budget_overrides
            .get(&channel)
            .copied()
            .unwrap_or(defaults)
    }

    /// 摘要时间判定所用的时区名
    pub fn digest_timezone(&self) -> Option<&str> {
        self.digest
            .timezone
            .as_deref()
            .or_else(|| self.quiet_hours.as_ref().map(|q| q.timezone.as_str()))
    }

    /// 解密出投递用的联系方式瞬时视图
    ///
    /// 只在投递前调用，结果不落任何持久化存储；日志中引用时
    /// 必须经过 `notify_shared::crypto` 的脱敏函数。
    pub fn resolve_contact(
        &self,
        encryptor: &notify_shared::crypto::FieldEncryptor,
    ) -> Result<ResolvedContact, notify_shared::crypto::CryptoError> {
        let phone = match &self.contact.phone_encrypted {
            Some(ciphertext) => Some(encryptor.decrypt(ciphertext)?),
            None => None,
        };
        let email = match &self.contact.email_encrypted {
            Some(ciphertext) => Some(encryptor.decrypt(ciphertext)?),
            None => None,
        };

        let mut devices = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            devices.push(ResolvedDevice {
                device_id: device.device_id.clone(),
                token: encryptor.decrypt(&device.token_encrypted)?,
                platform: device.platform.clone(),
            });
        }

        Ok(ResolvedContact {
            phone,
            email,
            devices,
        })
    }
}

// ---------------------------------------------------------------------------
// ResolvedContact — 投递用联系方式瞬时视图
// ---------------------------------------------------------------------------

/// 解密后的设备
#[derive(Clone)]
pub struct ResolvedDevice {
    pub device_id: String,
    pub token: String,
    pub platform: String,
}

/// 解密后的联系方式
///
/// 仅存在于投递路径的栈上，不实现 Serialize，杜绝意外落盘。
/// Debug 输出一律脱敏，误把整个请求打进日志也不会泄露明文。
#[derive(Clone, Default)]
pub struct ResolvedContact {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub devices: Vec<ResolvedDevice>,
}

impl std::fmt::Debug for ResolvedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDevice")
            .field("device_id", &self.device_id)
            .field("token", &notify_shared::crypto::mask_token(&self.token))
            .field("platform", &self.platform)
            .finish()
    }
}

impl std::fmt::Debug for ResolvedContact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedContact")
            .field(
                "phone",
                &self.phone.as_deref().map(notify_shared::crypto::mask_phone),
            )
            .field(
                "email",
                &self.email.as_deref().map(notify_shared::crypto::mask_email),
            )
            .field("devices", &self.devices)
            .finish()
    }
}
