//! Push 设备推送适配器
//!
//! 对用户注册的全部设备做多播。内部优先级映射到平台原生值
//! （critical -> high/10，其余 -> normal/5），消息 TTL 一小时。
//! 静默数据变体不携带弹窗段、置 content-available 标记，只唤醒
//! 客户端后台同步。令牌被服务商判定永久失效时记录脱敏后缀，
//! 供上游清理设备注册表。

use async_trait::async_trait;
use notify_shared::crypto::mask_token;
use notify_shared::error::{NotifyError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notify_shared::config::PushConfig;

use super::{AdapterOutcome, AdapterRequest, ProviderAdapter};
use crate::preferences::ResolvedDevice;
use crate::types::{Channel, Priority};

/// 平台原生优先级：(android 字符串, ios 数值)
fn platform_priority(priority: Priority) -> (&'static str, u8) {
    if priority.is_critical() {
        ("high", 10)
    } else {
        ("normal", 5)
    }
}

// ---------------------------------------------------------------------------
// PushPayload — 平台无关的推送负载
// ---------------------------------------------------------------------------

/// 弹窗段；静默推送没有这一段
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAlert {
    pub title: String,
    pub body: String,
}

/// 推送负载
///
/// 普通推送携带 [`PushAlert`] 弹窗；静默数据变体 alert 为 None 且
/// `content_available` 为 true（iOS content-available=1 /
/// Android data-only 消息），客户端被唤醒同步数据而不打扰用户。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<PushAlert>,
    pub data: serde_json::Value,
    pub content_available: bool,
    pub android_priority: &'static str,
    pub ios_priority: u8,
    pub ttl_seconds: u64,
}

impl PushPayload {
    /// 按请求组装负载；silent 决定弹窗段与 content-available 的取舍
    fn from_request(request: &AdapterRequest, ttl_seconds: u64) -> Self {
        let (android_priority, ios_priority) = platform_priority(request.priority);
        Self {
            alert: if request.silent {
                None
            } else {
                Some(PushAlert {
                    title: request.title.clone(),
                    body: request.body.clone(),
                })
            },
            data: request.data.clone(),
            content_available: request.silent,
            android_priority,
            ios_priority,
            ttl_seconds,
        }
    }
}

/// 单设备投递结果
enum DeviceOutcome {
    Accepted,
    /// 令牌被服务商判定失效（永久失败）
    TokenRevoked,
    Transient(String),
}

/// Push 设备推送适配器
pub struct PushAdapter {
    config: PushConfig,
}

impl PushAdapter {
    pub fn new(config: PushConfig) -> Self {
        Self { config }
    }

    /// 向单个设备推送（模拟实现，生产环境接入 FCM/APNs SDK）
    async fn dispatch_to_device(
        &self,
        device: &ResolvedDevice,
        payload: &PushPayload,
    ) -> DeviceOutcome {
        debug!(
            device_id = %device.device_id,
            platform = %device.platform,
            has_alert = payload.alert.is_some(),
            content_available = payload.content_available,
            android_priority = payload.android_priority,
            ios_priority = payload.ios_priority,
            ttl_seconds = payload.ttl_seconds,
            "Push 发送中"
        );

        DeviceOutcome::Accepted
    }
}

#[async_trait]
impl ProviderAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    fn provider_tag(&self) -> &str {
        "push-provider"
    }

    async fn send(&self, request: &AdapterRequest) -> Result<AdapterOutcome> {
        if !self.config.enabled {
            return Ok(AdapterOutcome::failed("channel not enabled"));
        }

        if request.contact.devices.is_empty() {
            return Err(NotifyError::InvalidArgument {
                field: "contact.devices".to_string(),
                message: "Push 投递请求没有注册设备".to_string(),
            });
        }

        let payload = PushPayload::from_request(request, self.config.ttl_seconds);

        let mut accepted = 0usize;
        let mut last_error: Option<String> = None;

        for device in &request.contact.devices {
            match self.dispatch_to_device(device, &payload).await {
                DeviceOutcome::Accepted => accepted += 1,
                DeviceOutcome::TokenRevoked => {
                    // 脱敏后缀足够上游定位失效设备，完整令牌不落日志
                    warn!(
                        notification_id = %request.notification_id,
                        device_id = %device.device_id,
                        token_suffix = %mask_token(&device.token),
                        "推送令牌已失效，应从设备注册表清理"
                    );
                    last_error = Some(format!("token revoked for device {}", device.device_id));
                }
                DeviceOutcome::Transient(e) => {
                    last_error = Some(e);
                }
            }
        }

        if accepted > 0 {
            let message_id = format!("push_{}", Uuid::new_v4());
            info!(
                notification_id = %request.notification_id,
                message_id = %message_id,
                accepted,
                total = request.contact.devices.len(),
                silent = request.silent,
                "Push 多播完成"
            );
            Ok(AdapterOutcome::sent(message_id))
        } else {
            Ok(AdapterOutcome::failed(
                last_error.unwrap_or_else(|| "all devices rejected".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EventKind;
    use crate::preferences::ResolvedContact;

    fn request_with_devices(count: usize) -> AdapterRequest {
        let devices = (0..count)
            .map(|i| ResolvedDevice {
                device_id: format!("d{i}"),
                token: format!("token-{i}-abcdef"),
                platform: if i % 2 == 0 { "ios" } else { "android" }.to_string(),
            })
            .collect();

        AdapterRequest {
            notification_id: Uuid::now_v7(),
            user_id: "u-1".to_string(),
            kind: EventKind::TransferCompleted,
            priority: Priority::Medium,
            title: "标题".to_string(),
            body: "正文".to_string(),
            data: serde_json::json!({"transactionId": "txn-1"}),
            contact: ResolvedContact {
                phone: None,
                email: None,
                devices,
            },
            silent: false,
        }
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(platform_priority(Priority::Critical), ("high", 10));
        assert_eq!(platform_priority(Priority::High), ("normal", 5));
        assert_eq!(platform_priority(Priority::Medium), ("normal", 5));
        assert_eq!(platform_priority(Priority::Low), ("normal", 5));
    }

    #[test]
    fn test_normal_payload_carries_alert() {
        let request = request_with_devices(1);
        let payload = PushPayload::from_request(&request, 3_600);

        let alert = payload.alert.expect("普通推送应携带弹窗段");
        assert_eq!(alert.title, "标题");
        assert_eq!(alert.body, "正文");
        assert!(!payload.content_available);
        assert_eq!(payload.ttl_seconds, 3_600);
        assert_eq!(payload.data["transactionId"], "txn-1");
    }

    #[test]
    fn test_silent_variant_is_data_only() {
        let mut request = request_with_devices(1);
        request.silent = true;
        let silent = PushPayload::from_request(&request, 3_600);

        // 静默变体：无弹窗段、置 content-available，数据原样携带
        assert!(silent.alert.is_none());
        assert!(silent.content_available);
        assert_eq!(silent.data["transactionId"], "txn-1");

        // 与普通负载可观察地不同
        request.silent = false;
        let normal = PushPayload::from_request(&request, 3_600);
        assert_ne!(silent, normal);

        // 线缆格式：静默负载不含 alert 字段
        let wire = serde_json::to_value(&silent).unwrap();
        assert!(wire.get("alert").is_none());
        assert_eq!(wire["contentAvailable"], true);
        let wire = serde_json::to_value(&normal).unwrap();
        assert_eq!(wire["alert"]["title"], "标题");
        assert_eq!(wire["contentAvailable"], false);
    }

    #[test]
    fn test_critical_payload_uses_platform_high_priority() {
        let mut request = request_with_devices(1);
        request.priority = Priority::Critical;
        let payload = PushPayload::from_request(&request, 3_600);

        assert_eq!(payload.android_priority, "high");
        assert_eq!(payload.ios_priority, 10);
    }

    #[tokio::test]
    async fn test_no_devices_is_programmer_error() {
        let adapter = PushAdapter::new(PushConfig::default());
        let result = adapter.send(&request_with_devices(0)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_multicast_sends() {
        let adapter = PushAdapter::new(PushConfig::default());
        let outcome = adapter.send(&request_with_devices(3)).await.unwrap();
        assert!(outcome.is_success());
        assert!(outcome.provider_message_id.unwrap().starts_with("push_"));
    }

    #[tokio::test]
    async fn test_silent_multicast_sends() {
        let adapter = PushAdapter::new(PushConfig::default());
        let mut request = request_with_devices(2);
        request.silent = true;

        let outcome = adapter.send(&request).await.unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_disabled_channel() {
        let adapter = PushAdapter::new(PushConfig {
            enabled: false,
            ttl_seconds: 3600,
            timeout_ms: 1000,
        });
        let outcome = adapter.send(&request_with_devices(1)).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("channel not enabled"));
    }
}
