//! SMS 短信适配器
//!
//! 校验 E.164 号码格式，按 160 字符限制组装正文（超长时截断并加
//! 省略号，退订后缀始终保留）。critical 事件以服务商的高优先级
//! 队列发送。服务商 SDK 本身是外部协作方，此处为其窄接口的模拟
//! 实现，生产环境在 `dispatch_to_provider` 内接入真实 SDK。

use std::sync::LazyLock;

use async_trait::async_trait;
use notify_shared::crypto::mask_phone;
use notify_shared::error::{NotifyError, Result};
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use notify_shared::config::SmsConfig;

use super::{AdapterOutcome, AdapterRequest, ProviderAdapter};
use crate::types::Channel;

/// 单条短信的最大长度（GSM-7 单段）
const MAX_SMS_CHARS: usize = 160;

static E164: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{7,14}$").expect("E.164 正则字面量合法"));

/// SMS 短信适配器
pub struct SmsAdapter {
    config: SmsConfig,
}

impl SmsAdapter {
    pub fn new(config: SmsConfig) -> Self {
        Self { config }
    }

    /// 组装短信正文
    ///
    /// 格式为 `{title}: {body}{退订后缀}`，整体不超过 160 字符；
    /// 超长时截断 body 并以 "…" 结尾，后缀不参与截断。
    fn compose(&self, title: &str, body: &str) -> String {
        let suffix = &self.config.unsubscribe_suffix;
        let overhead = title.chars().count() + 2 + suffix.chars().count();
        let budget = MAX_SMS_CHARS.saturating_sub(overhead);

        let body_chars: Vec<char> = body.chars().collect();
        if body_chars.len() <= budget {
            return format!("{title}: {body}{suffix}");
        }

        let truncated: String = body_chars[..budget.saturating_sub(1)].iter().collect();
        format!("{title}: {truncated}…{suffix}")
    }

    /// 调用短信服务商（模拟实现）
    async fn dispatch_to_provider(
        &self,
        phone: &str,
        message: &str,
        high_priority: bool,
    ) -> Result<String> {
        debug!(
            phone = %mask_phone(phone),
            message_length = message.chars().count(),
            high_priority,
            sender_id = %self.config.sender_id,
            "SMS 发送中"
        );

        let message_id = format!("sms_{}", Uuid::new_v4());
        Ok(message_id)
    }
}

#[async_trait]
impl ProviderAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn provider_tag(&self) -> &str {
        "sms-provider"
    }

    async fn send(&self, request: &AdapterRequest) -> Result<AdapterOutcome> {
        if !self.config.enabled {
            return Ok(AdapterOutcome::failed("channel not enabled"));
        }

        // 路由器在调用前已校验过"存在已验证手机号"的前置条件，
        // 走到这里却没有号码属于程序错误
        let phone = request.contact.phone.as_deref().ok_or_else(|| {
            NotifyError::InvalidArgument {
                field: "contact.phone".to_string(),
                message: "SMS 投递请求缺少手机号".to_string(),
            }
        })?;

        // 号码格式错误是永久性失败，交给重试/死信流程归档
        if !E164.is_match(phone) {
            return Ok(AdapterOutcome::failed(format!(
                "invalid phone number format: {}",
                mask_phone(phone)
            )));
        }

        let message = self.compose(&request.title, &request.body);
        let high_priority = request.priority.is_critical();

        match self.dispatch_to_provider(phone, &message, high_priority).await {
            Ok(message_id) => {
                info!(
                    notification_id = %request.notification_id,
                    message_id = %message_id,
                    "SMS 已提交服务商"
                );
                Ok(AdapterOutcome::sent(message_id))
            }
            Err(e) => Ok(AdapterOutcome::failed(e.to_string())),
        }
    }
}
