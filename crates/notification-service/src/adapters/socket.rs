//! Socket 网关适配器
//!
//! 实时推送本身由外部 socket 网关承担，本适配器只做两次 HTTP 调用：
//! 查询用户是否在线，然后把通知投给网关。用户在线时网关直接下发，
//! 状态记 delivered；离线时网关缓冲待用户重连，状态记 sent。

use std::time::Duration;

use async_trait::async_trait;
use notify_shared::error::{NotifyError, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use notify_shared::config::SocketConfig;

use super::{AdapterOutcome, AdapterRequest, ProviderAdapter};
use crate::types::Channel;

/// 网关在线状态响应
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStatus {
    connected: bool,
}

/// 网关投递响应
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    message_id: String,
}

/// Socket 网关适配器
pub struct SocketGatewayAdapter {
    config: SocketConfig,
    http: reqwest::Client,
}

impl SocketGatewayAdapter {
    pub fn new(config: SocketConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotifyError::Internal(format!("构建 HTTP 客户端失败: {e}")))?;

        Ok(Self { config, http })
    }

    /// 查询用户当前是否有活跃连接
    ///
    /// 查询失败不阻断投递——按离线处理，结果降级为 sent。
    async fn is_connected(&self, user_id: &str) -> bool {
        let url = format!("{}/api/connections/{user_id}", self.config.base_url);

        let response = self
            .http
            .get(&url)
            .header("X-API-Key", &self.config.api_key)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => resp
                .json::<ConnectionStatus>()
                .await
                .map(|s| s.connected)
                .unwrap_or(false),
            Ok(resp) => {
                debug!(user_id, status = %resp.status(), "在线状态查询返回非 2xx");
                false
            }
            Err(e) => {
                debug!(user_id, error = %e, "在线状态查询失败，按离线处理");
                false
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for SocketGatewayAdapter {
    fn channel(&self) -> Channel {
        Channel::Socket
    }

    fn provider_tag(&self) -> &str {
        "socket-gateway"
    }

    async fn send(&self, request: &AdapterRequest) -> Result<AdapterOutcome> {
        if !self.config.enabled {
            return Ok(AdapterOutcome::failed("channel not enabled"));
        }

        let connected = self.is_connected(&request.user_id).await;

        let url = format!("{}/api/notifications/send", self.config.base_url);
        let payload = serde_json::json!({
            "userId": request.user_id,
            "notificationId": request.notification_id,
            "title": request.title,
            "body": request.body,
            "priority": request.priority.as_str(),
            "data": request.data,
        });

        let response = self
            .http
            .post(&url)
            .header("X-API-Key", &self.config.api_key)
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                let message_id = resp
                    .json::<SendResponse>()
                    .await
                    .map(|r| r.message_id)
                    .unwrap_or_else(|_| request.notification_id.to_string());

                // 在线即达，离线进入网关缓冲
                if connected {
                    Ok(AdapterOutcome::delivered(message_id))
                } else {
                    Ok(AdapterOutcome::sent(message_id))
                }
            }
            Ok(resp) => {
                let status = resp.status();
                warn!(
                    notification_id = %request.notification_id,
                    status = %status,
                    "socket 网关拒绝投递"
                );
                Ok(AdapterOutcome::failed(format!("gateway returned {status}")))
            }
            Err(e) => {
                warn!(
                    notification_id = %request.notification_id,
                    error = %e,
                    "socket 网关调用失败"
                );
                Ok(AdapterOutcome::failed(format!("gateway error: {e}")))
            }
        }
    }
}
