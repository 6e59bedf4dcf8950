//! Email 邮件适配器
//!
//! 地址经基础正则校验；按事件类型族优先选用预注册模板
//! （transfers / security / digest），无模板时回退到内联 HTML+纯文本。
//! 打开与点击跟踪按配置开启。邮件服务商 SDK 是外部协作方，
//! `dispatch_to_provider` 为其窄接口的模拟实现。

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use notify_shared::crypto::mask_email;
use notify_shared::error::{NotifyError, Result};
use regex::Regex;
use tracing::{debug, info};
use uuid::Uuid;

use notify_shared::config::EmailConfig;

use super::{AdapterOutcome, AdapterRequest, ProviderAdapter};
use crate::catalog::EventKind;
use crate::types::Channel;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("邮箱正则字面量合法")
});

/// 模板族：按事件类型分组复用同一套邮件版式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateFamily {
    Transfers,
    Security,
    Digest,
}

impl TemplateFamily {
    /// 事件类型到模板族的映射；摘要邮件由摘要引擎显式指定
    fn for_kind(kind: EventKind) -> Option<Self> {
        if kind.is_transaction() {
            Some(Self::Transfers)
        } else if kind.is_security() || kind.is_fraud() {
            Some(Self::Security)
        } else {
            None
        }
    }
}

/// Email 邮件适配器
pub struct EmailAdapter {
    config: EmailConfig,
    /// 模板族 -> 服务商侧模板 id
    templates: HashMap<TemplateFamily, String>,
}

impl EmailAdapter {
    pub fn new(config: EmailConfig) -> Self {
        let templates = HashMap::from([
            (TemplateFamily::Transfers, "tpl-bank-transfers".to_string()),
            (TemplateFamily::Security, "tpl-bank-security".to_string()),
            (TemplateFamily::Digest, "tpl-bank-digest".to_string()),
        ]);
        Self { config, templates }
    }

    /// 请求对应的模板 id；摘要引擎通过 data._digest 标记走摘要模板
    fn template_for(&self, request: &AdapterRequest) -> Option<&str> {
        let family = if request
            .data
            .get("_digest")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            Some(TemplateFamily::Digest)
        } else {
            TemplateFamily::for_kind(request.kind)
        };

        family
            .and_then(|f| self.templates.get(&f))
            .map(String::as_str)
    }

    /// 内联 HTML 正文（无模板时的回退）
    fn build_html(&self, title: &str, body: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>{title}</title></head>
<body style="font-family: Arial, sans-serif; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2>{title}</h2>
    <p>{body}</p>
    <p style="color: #888; font-size: 12px;">This message was sent automatically. Please do not reply.</p>
  </div>
</body>
</html>"#
        )
    }

    /// 调用邮件服务商（模拟实现）
    async fn dispatch_to_provider(
        &self,
        to: &str,
        subject: &str,
        template_id: Option<&str>,
        html: &str,
        text: &str,
    ) -> Result<String> {
        debug!(
            to = %mask_email(to),
            subject,
            template_id = ?template_id,
            html_length = html.len(),
            text_length = text.len(),
            tracking = self.config.tracking_enabled,
            from = %self.config.from_address,
            "Email 发送中"
        );

        let message_id = format!("email_{}", Uuid::new_v4());
        Ok(message_id)
    }
}

#[async_trait]
impl ProviderAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn provider_tag(&self) -> &str {
        "email-provider"
    }

    async fn send(&self, request: &AdapterRequest) -> Result<AdapterOutcome> {
        if !self.config.enabled {
            return Ok(AdapterOutcome::failed("channel not enabled"));
        }

        let address = request.contact.email.as_deref().ok_or_else(|| {
            NotifyError::InvalidArgument {
                field: "contact.email".to_string(),
                message: "Email 投递请求缺少邮箱地址".to_string(),
            }
        })?;

        if !EMAIL_RE.is_match(address) {
            return Ok(AdapterOutcome::failed(format!(
                "invalid email address: {}",
                mask_email(address)
            )));
        }

        let template_id = self.template_for(request);
        let html = self.build_html(&request.title, &request.body);

        match self
            .dispatch_to_provider(address, &request.title, template_id, &html, &request.body)
            .await
        {
            Ok(message_id) => {
                info!(
                    notification_id = %request.notification_id,
                    message_id = %message_id,
                    "Email 已提交服务商"
                );
                Ok(AdapterOutcome::sent(message_id))
            }
            Err(e) => Ok(AdapterOutcome::failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::ResolvedContact;
    use crate::types::Priority;

    fn request(kind: EventKind, email: Option<&str>) -> AdapterRequest {
        AdapterRequest {
            notification_id: Uuid::now_v7(),
            user_id: "u-1".to_string(),
            kind,
            priority: Priority::Medium,
            title: "Transfer complete".to_string(),
            body: "Your transfer of $250 has completed".to_string(),
            data: serde_json::json!({}),
            contact: ResolvedContact {
                phone: None,
                email: email.map(String::from),
                devices: vec![],
            },
            silent: false,
        }
    }

    #[test]
    fn test_email_regex() {
        assert!(EMAIL_RE.is_match("alice@example.com"));
        assert!(EMAIL_RE.is_match("a.b+tag@sub.domain.org"));
        assert!(!EMAIL_RE.is_match("not-an-email"));
        assert!(!EMAIL_RE.is_match("missing@tld"));
        assert!(!EMAIL_RE.is_match("@example.com"));
    }

    #[test]
    fn test_template_family_selection() {
        let adapter = EmailAdapter::new(EmailConfig::default());

        // 交易族
        let req = request(EventKind::TransferCompleted, Some("a@b.com"));
        assert_eq!(adapter.template_for(&req), Some("tpl-bank-transfers"));

        // 安全族（含风控）
        let req = request(EventKind::FraudDetected, Some("a@b.com"));
        assert_eq!(adapter.template_for(&req), Some("tpl-bank-security"));

        // 生命周期事件无预注册模板，回退内联正文
        let req = request(EventKind::AccountCreated, Some("a@b.com"));
        assert_eq!(adapter.template_for(&req), None);

        // 摘要标记强制摘要模板
        let mut req = request(EventKind::TransferCompleted, Some("a@b.com"));
        req.data = serde_json::json!({"_digest": true});
        assert_eq!(adapter.template_for(&req), Some("tpl-bank-digest"));
    }

    #[test]
    fn test_inline_html_contains_title_and_body() {
        let adapter = EmailAdapter::new(EmailConfig::default());
        let html = adapter.build_html("标题", "正文内容");
        assert!(html.contains("标题"));
        assert!(html.contains("正文内容"));
        assert!(html.starts_with("<!DOCTYPE html>"));
    }

    #[tokio::test]
    async fn test_missing_email_is_programmer_error() {
        let adapter = EmailAdapter::new(EmailConfig::default());
        let result = adapter.send(&request(EventKind::TransferCompleted, None)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_address_is_failed_outcome() {
        let adapter = EmailAdapter::new(EmailConfig::default());
        let outcome = adapter
            .send(&request(EventKind::TransferCompleted, Some("bad-address")))
            .await
            .unwrap();
        assert!(!outcome.is_success());
        assert!(!outcome.error.unwrap().contains("bad-address"));
    }

    #[tokio::test]
    async fn test_valid_address_sends() {
        let adapter = EmailAdapter::new(EmailConfig::default());
        let outcome = adapter
            .send(&request(EventKind::TransferCompleted, Some("alice@example.com")))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert!(outcome.provider_message_id.unwrap().starts_with("email_"));
    }
}
