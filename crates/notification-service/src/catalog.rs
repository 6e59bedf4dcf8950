//! 事件类型目录
//!
//! 定义通知系统支持的全部事件类型（封闭集合）及其静态配置：
//! 默认渠道、默认优先级、免打扰穿透、摘要资格和去重窗口。
//! 目录在运行期不可变；请求未指定优先级时以目录为准，
//! 用户可以覆盖渠道选择但不能覆盖穿透/去重标志。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Channel, Priority};

// ---------------------------------------------------------------------------
// EventKind — 事件类型枚举
// ---------------------------------------------------------------------------

/// 事件类型枚举
///
/// 按业务域划分为四大类：交易、安全、风控、用户生命周期。
/// 分类信息用于选择邮件模板族和审计维度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
pub enum EventKind {
    // 交易类事件 — 资金流转结果通知
    TransferCompleted,
    TransferFailed,
    DepositReceived,
    WithdrawalCompleted,
    PaymentDue,
    LowBalance,

    // 安全类事件 — 认证与凭据变更
    LoginFailed,
    NewDeviceLogin,
    PasswordChanged,
    MfaEnabled,

    // 风控类事件 — 欺诈检测与账户保护
    FraudDetected,
    CardBlocked,
    SuspiciousTransaction,

    // 用户生命周期事件
    AccountCreated,
    AccountLocked,
    AccountClosed,
    KycApproved,
}

impl EventKind {
    /// 交易类事件以结果告知为主，多数可进入摘要
    pub fn is_transaction(&self) -> bool {
        matches!(
            self,
            Self::TransferCompleted
                | Self::TransferFailed
                | Self::DepositReceived
                | Self::WithdrawalCompleted
                | Self::PaymentDue
                | Self::LowBalance
        )
    }

    /// 安全类事件要求用户尽快知晓，默认走直达渠道
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::LoginFailed | Self::NewDeviceLogin | Self::PasswordChanged | Self::MfaEnabled
        )
    }

    /// 风控类事件一律高优先级，多数允许穿透免打扰时段
    pub fn is_fraud(&self) -> bool {
        matches!(
            self,
            Self::FraudDetected | Self::CardBlocked | Self::SuspiciousTransaction
        )
    }

    /// 生命周期事件频率低，容忍延迟
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::AccountCreated | Self::AccountLocked | Self::AccountClosed | Self::KycApproved
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransferCompleted => "transfer_completed",
            Self::TransferFailed => "transfer_failed",
            Self::DepositReceived => "deposit_received",
            Self::WithdrawalCompleted => "withdrawal_completed",
            Self::PaymentDue => "payment_due",
            Self::LowBalance => "low_balance",
            Self::LoginFailed => "login_failed",
            Self::NewDeviceLogin => "new_device_login",
            Self::PasswordChanged => "password_changed",
            Self::MfaEnabled => "mfa_enabled",
            Self::FraudDetected => "fraud_detected",
            Self::CardBlocked => "card_blocked",
            Self::SuspiciousTransaction => "suspicious_transaction",
            Self::AccountCreated => "account_created",
            Self::AccountLocked => "account_locked",
            Self::AccountClosed => "account_closed",
            Self::KycApproved => "kyc_approved",
        }
    }

    /// 事件类型的静态配置
    ///
    /// 目录即代码：配置随发布演进，运行期只读。
    pub fn config(&self) -> KindConfig {
        use Channel::*;
        use Priority::*;

        match self {
            // 交易结果类沿用配置的默认去重窗口
            Self::TransferCompleted => KindConfig::new(&[Socket, Push], Medium).digest_eligible(),
            Self::TransferFailed => KindConfig::new(&[Socket, Email], High),
            Self::DepositReceived => KindConfig::new(&[Socket, Push], Low).digest_eligible(),
            Self::WithdrawalCompleted => KindConfig::new(&[Socket, Push, Sms], Medium),
            Self::PaymentDue => KindConfig::new(&[Email, Push], Medium)
                .digest_eligible()
                .dedup_secs(86_400),
            Self::LowBalance => KindConfig::new(&[Push, Email], Medium)
                .digest_eligible()
                .dedup_secs(21_600),

            Self::LoginFailed => KindConfig::new(&[Sms, Email], Medium).dedup_secs(600),
            Self::NewDeviceLogin => KindConfig::new(&[Sms, Email, Push], High).dedup_secs(3_600),
            Self::PasswordChanged => KindConfig::new(&[Email, Sms], High).dedup_secs(3_600),
            Self::MfaEnabled => KindConfig::new(&[Email], Medium).dedup_secs(3_600),

            Self::FraudDetected => KindConfig::new(&[Socket, Sms, Push, Email], Critical)
                .bypass_quiet_hours(),
            Self::CardBlocked => KindConfig::new(&[Socket, Sms, Push], Critical)
                .bypass_quiet_hours()
                .dedup_secs(3_600),
            Self::SuspiciousTransaction => KindConfig::new(&[Socket, Push, Sms], High)
                .bypass_quiet_hours()
                .dedup_secs(600),

            Self::AccountCreated => KindConfig::new(&[Email], Low).dedup_secs(86_400),
            Self::AccountLocked => KindConfig::new(&[Socket, Sms, Email], Critical)
                .bypass_quiet_hours()
                .dedup_secs(3_600),
            Self::AccountClosed => KindConfig::new(&[Email], Medium).dedup_secs(86_400),
            Self::KycApproved => KindConfig::new(&[Email, Push], Low)
                .digest_eligible()
                .dedup_secs(86_400),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KindConfig — 事件类型配置
// ---------------------------------------------------------------------------

/// 事件类型配置记录
#[derive(Debug, Clone)]
pub struct KindConfig {
    /// 未被用户覆盖时的默认渠道集合
    pub default_channels: &'static [Channel],
    /// 请求未显式指定时的默认优先级
    pub default_priority: Priority,
    /// 是否无条件穿透免打扰时段（用户不可关闭）
    pub bypass_quiet_hours: bool,
    /// 免打扰时段内是否可折叠进摘要
    pub digest_eligible: bool,
    /// 去重窗口；None 表示沿用配置的服务级默认窗口（DEDUP_WINDOW_MS）
    pub dedup_window: Option<Duration>,
}

impl KindConfig {
    fn new(default_channels: &'static [Channel], default_priority: Priority) -> Self {
        Self {
            default_channels,
            default_priority,
            bypass_quiet_hours: false,
            digest_eligible: false,
            dedup_window: None,
        }
    }

    fn bypass_quiet_hours(mut self) -> Self {
        self.bypass_quiet_hours = true;
        self
    }

    fn digest_eligible(mut self) -> Self {
        self.digest_eligible = true;
        self
    }

    fn dedup_secs(mut self, secs: u64) -> Self {
        self.dedup_window = Some(Duration::from_secs(secs));
        self
    }
}
