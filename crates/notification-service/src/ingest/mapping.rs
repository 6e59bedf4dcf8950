//! 事件到通知请求的静态映射
//!
//! (topic 角色, eventType) -> (事件类型, 标题, 正文模板, 去重源字段)。
//! 映射表按 topic 限定作用域：同名 eventType 出现在别的 topic 上
//! 不会被误配。未收录的 eventType 由调用方静默丢弃（debug 日志）。
//!
//! 正文模板只做 `{field}` 级别的朴素替换，占位字段取自事件 payload；
//! 字段缺失时保留占位符原样，便于在预发环境肉眼发现映射缺字段。

use notify_shared::config::TopicsConfig;

use super::decoder::BusEvent;
use crate::catalog::EventKind;
use crate::types::NotificationRequest;

// ---------------------------------------------------------------------------
// TopicRole
// ---------------------------------------------------------------------------

/// 入口 topic 的业务角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRole {
    Security,
    Transaction,
    Fraud,
    User,
}

impl TopicRole {
    /// 按配置的 topic 名解析角色
    pub fn from_topic(topics: &TopicsConfig, topic: &str) -> Option<Self> {
        if topic == topics.security {
            Some(Self::Security)
        } else if topic == topics.transaction {
            Some(Self::Transaction)
        } else if topic == topics.fraud {
            Some(Self::Fraud)
        } else if topic == topics.user {
            Some(Self::User)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// 映射表
// ---------------------------------------------------------------------------

/// 一条映射规则
struct MappingRule {
    kind: EventKind,
    title: &'static str,
    body_template: &'static str,
    /// 去重 source_id 取自 payload 的哪个字段
    source_field: Option<&'static str>,
}

/// 查映射表
fn lookup(role: TopicRole, event_type: &str) -> Option<MappingRule> {
    use EventKind::*;
    use TopicRole::*;

    let rule = match (role, event_type) {
        (Transaction, "transfer.completed") => MappingRule {
            kind: TransferCompleted,
            title: "Transfer Complete",
            body_template: "Your transfer of {amount} {currency} has completed.",
            source_field: Some("transactionId"),
        },
        (Transaction, "transfer.failed") => MappingRule {
            kind: TransferFailed,
            title: "Transfer Failed",
            body_template: "Your transfer of {amount} {currency} could not be completed: {reason}",
            source_field: Some("transactionId"),
        },
        (Transaction, "deposit.received") => MappingRule {
            kind: DepositReceived,
            title: "Deposit Received",
            body_template: "A deposit of {amount} {currency} has arrived in your account.",
            source_field: Some("transactionId"),
        },
        (Transaction, "withdrawal.completed") => MappingRule {
            kind: WithdrawalCompleted,
            title: "Withdrawal Complete",
            body_template: "Your withdrawal of {amount} {currency} has completed.",
            source_field: Some("transactionId"),
        },
        (Transaction, "payment.due") => MappingRule {
            kind: PaymentDue,
            title: "Payment Due",
            body_template: "A payment of {amount} {currency} is due on {dueDate}.",
            source_field: Some("paymentId"),
        },
        (Transaction, "balance.low") => MappingRule {
            kind: LowBalance,
            title: "Low Balance",
            body_template: "Your account balance has fallen below {threshold} {currency}.",
            source_field: Some("accountId"),
        },

        (Security, "login.failed") => MappingRule {
            kind: LoginFailed,
            title: "Failed Login Attempt",
            body_template: "A failed login attempt was detected from {location}.",
            source_field: Some("sessionId"),
        },
        (Security, "login.new_device") => MappingRule {
            kind: NewDeviceLogin,
            title: "New Device Login",
            body_template: "Your account was accessed from a new device: {deviceName}.",
            source_field: Some("sessionId"),
        },
        (Security, "password.changed") => MappingRule {
            kind: PasswordChanged,
            title: "Password Changed",
            body_template: "Your account password was changed. If this wasn't you, contact support immediately.",
            source_field: None,
        },
        (Security, "mfa.enabled") => MappingRule {
            kind: MfaEnabled,
            title: "Two-Factor Authentication Enabled",
            body_template: "Two-factor authentication is now active on your account.",
            source_field: None,
        },

        (Fraud, "fraud.detected") => MappingRule {
            kind: FraudDetected,
            title: "Fraud Alert",
            body_template: "Suspicious activity was detected on your account: {summary}",
            source_field: Some("caseId"),
        },
        (Fraud, "card.blocked") => MappingRule {
            kind: CardBlocked,
            title: "Card Blocked",
            body_template: "Your card ending in {cardSuffix} has been blocked for your protection.",
            source_field: Some("caseId"),
        },
        (Fraud, "transaction.suspicious") => MappingRule {
            kind: SuspiciousTransaction,
            title: "Suspicious Transaction",
            body_template: "A transaction of {amount} {currency} was flagged for review.",
            source_field: Some("transactionId"),
        },

        (User, "account.created") => MappingRule {
            kind: AccountCreated,
            title: "Welcome",
            body_template: "Your account has been created successfully.",
            source_field: None,
        },
        (User, "account.locked") => MappingRule {
            kind: AccountLocked,
            title: "Account Locked",
            body_template: "Your account has been locked: {reason}",
            source_field: None,
        },
        (User, "account.closed") => MappingRule {
            kind: AccountClosed,
            title: "Account Closed",
            body_template: "Your account has been closed.",
            source_field: None,
        },
        (User, "kyc.approved") => MappingRule {
            kind: KycApproved,
            title: "Identity Verified",
            body_template: "Your identity verification has been approved.",
            source_field: None,
        },

        _ => return None,
    };

    Some(rule)
}

/// 把总线事件映射为通知请求；未收录的 eventType 返回 None
pub fn map_event(role: TopicRole, event: &BusEvent) -> Option<NotificationRequest> {
    let rule = lookup(role, &event.event_type)?;

    let body = render(rule.body_template, &event.payload);

    let mut request = NotificationRequest::new(event.user_id(), rule.kind, rule.title, body);

    if let Some(field) = rule.source_field
        && let Some(source_id) = event.payload_str(field)
    {
        request = request.with_source_id(source_id);
    }

    if let Some(correlation_id) = &event.correlation_id {
        request = request.with_correlation_id(correlation_id.clone());
    }

    // payload 原样进入结构化数据，渠道适配器和摘要按需取用
    if let Some(map) = event.payload.as_object() {
        for (key, value) in map {
            if key != "userId" {
                request = request.with_data(key.clone(), value.clone());
            }
        }
    }

    Some(request)
}

/// 朴素 `{field}` 替换；缺失字段保留占位符
fn render(template: &str, payload: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let field = &after[..end];
                match payload.get(field) {
                    Some(serde_json::Value::String(s)) => out.push_str(s),
                    Some(serde_json::Value::Number(n)) => out.push_str(&n.to_string()),
                    Some(serde_json::Value::Bool(b)) => out.push_str(&b.to_string()),
                    // 缺失或复合类型：保留占位符
                    _ => {
                        out.push('{');
                        out.push_str(field);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
