//! 渠道适配器
//!
//! 定义统一的适配器 trait 并提供四个渠道的具体实现。
//!
//! ## 契约
//!
//! - 普通的服务商失败（超时、5xx、无效接收方）以 `AdapterOutcome`
//!   的 failed 状态返回，绝不抛 Err——调用方据此区分"策略/环境失败"
//!   和"程序错误"；
//! - Err 只用于输入形状不符合约定（如路由器漏查前置条件）；
//! - 渠道被配置禁用时返回 failed("channel not enabled")，不发起外呼。

mod email;
mod push;
mod sms;
mod socket;

pub use email::EmailAdapter;
pub use push::PushAdapter;
pub use sms::SmsAdapter;
pub use socket::SocketGatewayAdapter;

use async_trait::async_trait;
use notify_shared::error::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::EventKind;
use crate::preferences::ResolvedContact;
use crate::types::{Channel, DeliveryStatus, Priority};

/// 适配器收到的投递请求
///
/// 联系方式已解密（瞬时视图），适配器不接触偏好文档。
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub notification_id: Uuid,
    pub user_id: String,
    pub kind: EventKind,
    pub priority: Priority,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub contact: ResolvedContact,
    /// 推送渠道的静默数据变体：不弹通知，仅唤醒客户端同步数据
    pub silent: bool,
}

/// 单次投递的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterOutcome {
    /// sent / delivered / failed 三者之一
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
}

impl AdapterOutcome {
    pub fn sent(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
        }
    }

    pub fn delivered(provider_message_id: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            provider_message_id: Some(provider_message_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            provider_message_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_outbound_success()
    }
}

/// 渠道适配器 trait
///
/// 实现应当无状态、可并发调用。
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// 所属渠道
    fn channel(&self) -> Channel;

    /// 服务商标签（写入投递记录的 provider 字段）
    fn provider_tag(&self) -> &str;

    /// 执行一次投递
    async fn send(&self, request: &AdapterRequest) -> Result<AdapterOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_constructors() {
        let sent = AdapterOutcome::sent("msg-1");
        assert_eq!(sent.status, DeliveryStatus::Sent);
        assert!(sent.is_success());

        let delivered = AdapterOutcome::delivered("msg-2");
        assert_eq!(delivered.status, DeliveryStatus::Delivered);
        assert!(delivered.is_success());

        let failed = AdapterOutcome::failed("provider timeout");
        assert_eq!(failed.status, DeliveryStatus::Failed);
        assert!(!failed.is_success());
        assert_eq!(failed.error.as_deref(), Some("provider timeout"));
        assert!(failed.provider_message_id.is_none());
    }
}
