//! 总线事件解码
//!
//! 上游负载是松散的 JSON 信封；此处做严格解码：信封字段齐全、
//! timestamp 为合法 RFC 3339、payload 为对象且包含非空 userId。
//! 不满足任何一条都按畸形消息处理，进死信而不是带着无类型数据
//! 继续向下游传播。

use chrono::{DateTime, Utc};
use notify_shared::kafka::ConsumerMessage;
use serde::Deserialize;

use crate::error::{Result, ServiceError};

/// 总线事件信封
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub version: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub payload: serde_json::Value,
}

impl BusEvent {
    /// 从 Kafka 消息严格解码
    pub fn decode(msg: &ConsumerMessage) -> Result<Self> {
        let event: BusEvent = serde_json::from_slice(&msg.payload)
            .map_err(|e| ServiceError::MalformedEvent(format!("信封解码失败: {e}")))?;

        if !event.payload.is_object() {
            return Err(ServiceError::MalformedEvent(
                "payload 不是 JSON 对象".to_string(),
            ));
        }

        let user_id = event
            .payload
            .get("userId")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if user_id.is_empty() {
            return Err(ServiceError::MalformedEvent(
                "payload 缺少 userId".to_string(),
            ));
        }

        Ok(event)
    }

    /// 受影响用户的 id（decode 已保证存在）
    pub fn user_id(&self) -> &str {
        self.payload
            .get("userId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }

    /// 读取 payload 中的字符串字段
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn message(payload: &str) -> ConsumerMessage {
        ConsumerMessage {
            topic: "bank.transaction.events".to_string(),
            partition: 0,
            offset: 7,
            key: None,
            payload: payload.as_bytes().to_vec(),
            timestamp: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn test_decode_valid_event() {
        let msg = message(
            r#"{
                "eventType": "transfer.completed",
                "timestamp": "2025-06-01T10:30:00Z",
                "service": "payments",
                "version": "2.1",
                "correlationId": "corr-1",
                "payload": {"userId": "u-1", "transactionId": "txn-9", "amount": 250.0}
            }"#,
        );

        let event = BusEvent::decode(&msg).unwrap();
        assert_eq!(event.event_type, "transfer.completed");
        assert_eq!(event.service, "payments");
        assert_eq!(event.user_id(), "u-1");
        assert_eq!(event.payload_str("transactionId"), Some("txn-9"));
        assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(BusEvent::decode(&message("not json")).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_user_id() {
        let msg = message(
            r#"{
                "eventType": "transfer.completed",
                "timestamp": "2025-06-01T10:30:00Z",
                "service": "payments",
                "version": "2.1",
                "payload": {"transactionId": "txn-9"}
            }"#,
        );
        let err = BusEvent::decode(&msg).unwrap_err();
        assert!(err.to_string().contains("userId"));
    }

    #[test]
    fn test_decode_rejects_non_object_payload() {
        let msg = message(
            r#"{
                "eventType": "transfer.completed",
                "timestamp": "2025-06-01T10:30:00Z",
                "service": "payments",
                "version": "2.1",
                "payload": "just a string"
            }"#,
        );
        assert!(BusEvent::decode(&msg).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let msg = message(
            r#"{
                "eventType": "transfer.completed",
                "timestamp": "yesterday",
                "service": "payments",
                "version": "2.1",
                "payload": {"userId": "u-1"}
            }"#,
        );
        assert!(BusEvent::decode(&msg).is_err());
    }
}
