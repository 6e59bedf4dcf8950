//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和位移管理语义，避免各服务重复编写样板代码。
//!
//! 消费侧采用"批量拉取 + 手动位移"模型：自动提交完全关闭，位移在
//! 单条消息处理完成后写入（`store_offset`），并在每批结束后由调用方
//! 显式 `commit` 上送。这样一条无法处理且无法落入死信的消息会阻塞
//! 分区推进，而不是被静默丢弃。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::error::NotifyError;

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数，并在处理完成后
/// 凭 (topic, partition, offset) 回写位移。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 将负载视为 UTF-8 字符串返回
    pub fn payload_str(&self) -> Result<&str, NotifyError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| NotifyError::Kafka(format!("负载非 UTF-8 编码: {e}")))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, NotifyError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| NotifyError::Kafka(format!("负载反序列化失败: {e}")))
    }

    /// 消息在分区流中的位置标识，用于日志和合成死信键
    pub fn position(&self) -> String {
        format!("{}:{}:{}", self.topic, self.partition, self.offset)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// 设置 `message.timeout.ms` 为 5 秒——5 秒内仍无法投递时
    /// 应由上层决定重试或放弃，而非无限等待。
    pub fn new(config: &KafkaConfig) -> Result<Self, NotifyError> {
        Self::build(config, None)
    }

    /// 创建启用压缩的生产者
    ///
    /// 审计流量体量大且正文高度重复，统一走 GZIP。
    pub fn with_compression(config: &KafkaConfig, codec: &str) -> Result<Self, NotifyError> {
        Self::build(config, Some(codec))
    }

    fn build(config: &KafkaConfig, compression: Option<&str>) -> Result<Self, NotifyError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000");
        if let Some(codec) = compression {
            client_config.set("compression.type", codec);
        }

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, compression = ?compression, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), NotifyError> {
        self.send_with_headers(topic, key, payload, &[]).await
    }

    /// 发送带 header 的消息
    ///
    /// 审计事件要求携带 event-type / event-version / source-service 头，
    /// 下游消费者据此做事件分发而无需解析正文。
    pub async fn send_with_headers(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<(i32, i64), NotifyError> {
        let mut record = FutureRecord::to(topic).key(key).payload(payload);

        if !headers.is_empty() {
            let mut owned = OwnedHeaders::new();
            for &(name, value) in headers {
                owned = owned.insert(Header {
                    key: name,
                    value: Some(value),
                });
            }
            record = record.headers(owned);
        }

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| NotifyError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), NotifyError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| NotifyError::Kafka(format!("序列化失败: {e}")))?;

        self.send(topic, key, &payload).await
    }

    /// 序列化为 JSON 并附带 header 发送
    pub async fn send_json_with_headers<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
        headers: &[(&str, &str)],
    ) -> Result<(i32, i64), NotifyError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| NotifyError::Kafka(format!("序列化失败: {e}")))?;

        self.send_with_headers(topic, key, &payload, headers).await
    }
}

// ---------------------------------------------------------------------------
// KafkaBatchConsumer
// ---------------------------------------------------------------------------

/// 批量拉取、手动位移的 Kafka 消费者
///
/// 与自动提交消费者的区别：
/// - `enable.auto.commit = false` 且 `enable.auto.offset.store = false`：
///   位移只在调用方显式 `store_offset` 后记录、显式 `commit` 后上送，
///   后台不存在任何自动提交，保证 at-least-once；
/// - `recv_batch` 在凑满一批或等待超时后返回，调用方可在批内并发处理。
pub struct KafkaBatchConsumer {
    consumer: StreamConsumer,
}

impl KafkaBatchConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组，
    /// 例如 "notification-service.ingest"。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, NotifyError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set(
                "heartbeat.interval.ms",
                config.heartbeat_interval_ms.to_string(),
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| NotifyError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 批量消费者已初始化");
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), NotifyError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| NotifyError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 拉取一批消息
    ///
    /// 最多等待 `max_wait` 凑满 `max` 条；期间有消息到达则继续收集剩余
    /// 时间内到达的消息。无消息时返回空批，由调用方决定下一轮节奏。
    pub async fn recv_batch(
        &self,
        max: usize,
        max_wait: Duration,
    ) -> Result<Vec<ConsumerMessage>, NotifyError> {
        let mut batch = Vec::with_capacity(max);
        let deadline = tokio::time::Instant::now() + max_wait;

        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(borrowed)) => batch.push(ConsumerMessage::from_borrowed(&borrowed)),
                Ok(Err(e)) => {
                    return Err(NotifyError::Kafka(format!("接收消息出错: {e}")));
                }
                // 等待超时，本批结束
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    /// 存储单条消息的位移（处理完成的标记）
    ///
    /// 存储 offset+1，表示下一条待消费的位置。
    pub fn store_offset(&self, msg: &ConsumerMessage) -> Result<(), NotifyError> {
        self.consumer
            .store_offset(&msg.topic, msg.partition, msg.offset + 1)
            .map_err(|e| NotifyError::Kafka(format!("存储位移失败 {}: {e}", msg.position())))
    }

    /// 同步提交已存储的位移
    ///
    /// 自动提交已关闭，这里是位移上送的唯一通道：摄取器在每批
    /// 处理完成后调用一次，优雅关闭前再调用一次兜底。
    pub fn commit(&self) -> Result<(), NotifyError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|e| NotifyError::Kafka(format!("提交位移失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
