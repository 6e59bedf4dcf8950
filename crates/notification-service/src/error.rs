//! 通知服务错误类型

use notify_shared::crypto::CryptoError;
use notify_shared::error::NotifyError;
use thiserror::Error;

/// 通知服务错误
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Shared(#[from] NotifyError),

    #[error("字段加密错误: {0}")]
    Crypto(#[from] CryptoError),

    /// 事件负载解码失败或缺失必要字段（如 userId）
    #[error("事件负载无效: {0}")]
    MalformedEvent(String),

    /// 偏好存储不可用——没有偏好无法执行任何投递策略，调用必须失败
    #[error("偏好存储不可用: {0}")]
    PreferencesUnavailable(String),

    /// 投递记录状态机不允许的迁移
    #[error("非法状态迁移: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// 死信写入失败——摄取工作线程据此停止推进分区位移
    #[error("死信写入失败: {0}")]
    DlqWriteFailed(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, ServiceError>;
