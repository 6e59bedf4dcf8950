//! 事件摄取工作线程
//!
//! 处理模型：批量拉取 -> 批内并发处理（有界）-> 单条完成后存储位移
//! -> 每批结束统一提交。自动提交关闭，位移上送只走这条显式路径。
//! 单条消息的归宿只有三种：完成一次路由调用、落一条死信记录、
//! 或带错停住工作线程——除了文档化的"未识别事件类型"外不存在
//! 静默丢弃。死信写入失败时位移不前进，银行域宁可停摆不可丢数据。

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use notify_shared::config::{IngestConfig, KafkaConfig, TopicsConfig};
use notify_shared::kafka::{ConsumerMessage, KafkaBatchConsumer};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use super::decoder::BusEvent;
use super::mapping::{TopicRole, map_event};
use crate::error::{Result, ServiceError};
use crate::router::Router;
use crate::stores::{DlqRecord, DlqStore};

/// 事件摄取器
pub struct EventIngestor {
    consumer: KafkaBatchConsumer,
    router: Arc<Router>,
    dlq: Arc<dyn DlqStore>,
    topics: TopicsConfig,
    config: IngestConfig,
}

impl EventIngestor {
    pub fn new(
        kafka: &KafkaConfig,
        config: IngestConfig,
        router: Arc<Router>,
        dlq: Arc<dyn DlqStore>,
    ) -> Result<Self> {
        let consumer = KafkaBatchConsumer::new(kafka, Some("ingest"))?;
        Ok(Self {
            consumer,
            router,
            dlq,
            topics: kafka.topics.clone(),
            config,
        })
    }

    /// 消费循环，直到收到关闭信号或遭遇基础设施级错误
    ///
    /// 返回 Err 表示分区被有意停住（死信不可写），需要运维介入；
    /// 进程不得捕获后静默继续。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ingress: Vec<&str> = self.topics.ingress();
        self.consumer.subscribe(&ingress)?;
        info!(topics = ?ingress, "事件摄取器已启动");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，事件摄取器停止拉取");
                        break;
                    }
                }

                batch = self.consumer.recv_batch(
                    self.config.batch_size,
                    Duration::from_millis(self.config.batch_max_wait_ms),
                ) => {
                    match batch {
                        Ok(batch) if batch.is_empty() => continue,
                        Ok(batch) => {
                            self.process_batch(batch).await?;
                            // 自动提交已关闭：每批结束后显式上送已存储的位移。
                            // 提交失败不致命——位移仍在本地，下一批后重试，
                            // 最坏情况是重启后重放（at-least-once 允许）。
                            if let Err(e) = self.consumer.commit() {
                                warn!(error = %e, "提交位移失败，下一批后重试");
                            }
                        }
                        Err(e) => {
                            // 拉取错误多为瞬时（rebalance、broker 切换），记录后继续
                            warn!(error = %e, "拉取消息批次失败");
                        }
                    }
                }
            }
        }

        // 关闭前同步提交最后一批已存储的位移
        if let Err(e) = self.consumer.commit() {
            warn!(error = %e, "关闭时提交位移失败");
        }
        info!("事件摄取器已停止");
        Ok(())
    }

    /// 处理一批消息
    ///
    /// 批内并发上限由配置决定；设为 1 可恢复分区内严格有序。
    /// 任一消息遭遇基础设施级失败（死信不可写）时整体返回错误，
    /// 该消息的位移不会被存储。
    async fn process_batch(&self, batch: Vec<ConsumerMessage>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));

        let handles: Vec<_> = batch
            .iter()
            .map(|msg| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("信号量未关闭");
                    (msg, self.handle_message(msg).await)
                }
            })
            .collect();

        let results = join_all(handles).await;

        let mut fatal: Option<ServiceError> = None;
        for (msg, result) in results {
            match result {
                Ok(()) => {
                    // 消息处理完成（路由成功或已落死信），推进位移
                    self.consumer.store_offset(msg)?;
                }
                Err(e) => {
                    error!(
                        position = %msg.position(),
                        error = %e,
                        "消息处理遭遇基础设施级失败，位移不前进"
                    );
                    fatal.get_or_insert(e);
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 处理单条消息
    ///
    /// Ok 表示消息已有归宿（完成路由 / 落入死信 / 文档化丢弃）；
    /// Err 只用于死信写入失败这类必须停住分区的情况。
    async fn handle_message(&self, msg: &ConsumerMessage) -> Result<()> {
        // 1. 严格解码；畸形消息落死信后位移照常推进
        let event = match BusEvent::decode(msg) {
            Ok(event) => event,
            Err(e) => {
                warn!(position = %msg.position(), error = %e, "畸形事件，移入死信");
                return self.quarantine(msg, None, e.to_string(), "malformed").await;
            }
        };

        // 2. topic 角色解析；只订阅了四个入口 topic，不识别属于配置错误
        let Some(role) = TopicRole::from_topic(&self.topics, &msg.topic) else {
            warn!(topic = %msg.topic, "消息来自未知 topic，忽略");
            return Ok(());
        };

        // 3. 映射；未收录的 eventType 是文档化的静默丢弃路径
        let Some(request) = map_event(role, &event) else {
            debug!(
                topic = %msg.topic,
                event_type = %event.event_type,
                "未识别的事件类型，丢弃"
            );
            return Ok(());
        };

        // 4. 路由；路由失败时按关联 id（缺省合成 topic:partition:offset）落死信
        match self.router.route(request).await {
            Ok(result) => {
                debug!(
                    notification_id = %result.notification_id,
                    attempts = result.attempts.len(),
                    skips = result.skips.len(),
                    "事件路由完成"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    position = %msg.position(),
                    event_type = %event.event_type,
                    error = %e,
                    "路由失败，移入死信"
                );
                self.quarantine(msg, event.correlation_id.as_deref(), e.to_string(), "routing_failed")
                    .await
            }
        }
    }

    /// 把消息隔离到死信存储
    ///
    /// 写入失败向上传播 DlqWriteFailed，调用方据此停住分区。
    async fn quarantine(
        &self,
        msg: &ConsumerMessage,
        correlation_id: Option<&str>,
        reason: String,
        marker: &str,
    ) -> Result<()> {
        let key = correlation_id
            .map(String::from)
            .unwrap_or_else(|| msg.position());

        let payload = serde_json::from_slice::<serde_json::Value>(&msg.payload)
            .unwrap_or_else(|_| serde_json::json!({
                "raw": String::from_utf8_lossy(&msg.payload),
            }));

        let record = DlqRecord::from_bus_message(&msg.topic, key, payload, reason, marker);

        self.dlq.insert(&record).await.map_err(|e| {
            ServiceError::DlqWriteFailed(format!("{} ({})", e, msg.position()))
        })?;

        Ok(())
    }
}
