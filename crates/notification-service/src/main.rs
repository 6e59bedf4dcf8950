//! 通知服务进程入口
//!
//! 组合根：装配存储、适配器、路由器与各引擎，启动摄取/重试/摘要
//! 工作任务和健康检查端点，并处理优雅关闭。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use notify_shared::cache::Cache;
use notify_shared::config::AppConfig;
use notify_shared::crypto::FieldEncryptor;
use notify_shared::database::Database;
use notify_shared::kafka::KafkaProducer;
use notify_shared::retry::RetrySchedule;
use notify_shared::telemetry;

use notification_service::adapters::{
    EmailAdapter, ProviderAdapter, PushAdapter, SmsAdapter, SocketGatewayAdapter,
};
use notification_service::audit::KafkaAuditPublisher;
use notification_service::engines::{DigestEngine, RetryEngine};
use notification_service::ingest::EventIngestor;
use notification_service::router::{Router, RouterSettings};
use notification_service::stores::{
    PgDlqStore, PgHistoryStore, PgPreferencesStore, RedisDedupStore, RedisDigestQueue,
    RedisRateBudgetStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置并初始化日志
    let config = AppConfig::load("notification-service").unwrap_or_else(|e| {
        eprintln!("配置加载失败，使用默认值: {e}");
        AppConfig::default()
    });
    telemetry::init(&config.observability);

    info!(
        environment = %config.environment,
        "notification-service 启动中"
    );

    // 2. 字段加密器——密钥是强制配置，联系方式不允许明文落库
    let encryptor = Arc::new(
        FieldEncryptor::from_hex(&config.encryption.key_hex)
            .context("NOTIFY_ENCRYPTION_KEY_HEX 未配置或非法（需 64 字符 hex）")?,
    );

    // 3. 基础设施连接
    let db = Database::connect(&config.database).await?;
    let pool = db.pool().clone();
    info!("数据库连接已建立");

    let cache = Cache::new(&config.redis)?;
    cache.health_check().await?;
    info!("Redis 连接已建立");

    // 4. 存储
    let history = Arc::new(PgHistoryStore::new(pool.clone()));
    let dlq = Arc::new(PgDlqStore::new(pool.clone()));
    let preferences = Arc::new(PgPreferencesStore::new(pool.clone()));
    let budgets = Arc::new(RedisRateBudgetStore::new(cache.clone()));
    let dedup = Arc::new(RedisDedupStore::new(cache.clone()));
    let digest_queue = Arc::new(RedisDigestQueue::new(cache.clone()));
    info!("存储层已初始化");

    // 5. 审计出口（GZIP 压缩）
    let audit_producer = KafkaProducer::with_compression(&config.kafka, "gzip")?;
    let audit = Arc::new(KafkaAuditPublisher::new(
        audit_producer,
        config.kafka.topics.audit.clone(),
    ));

    // 6. 渠道适配器
    let email_adapter: Arc<dyn ProviderAdapter> =
        Arc::new(EmailAdapter::new(config.channels.email.clone()));
    let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
        Arc::new(SocketGatewayAdapter::new(config.channels.socket.clone())?),
        Arc::new(SmsAdapter::new(config.channels.sms.clone())),
        email_adapter.clone(),
        Arc::new(PushAdapter::new(config.channels.push.clone())),
    ];

    // 7. 路由器与引擎
    let schedule = RetrySchedule::from_millis(config.retry.max_attempts, &config.retry.schedule_ms);
    let router = Arc::new(Router::new(
        preferences.clone(),
        dedup,
        budgets,
        history.clone(),
        digest_queue.clone(),
        adapters,
        audit.clone(),
        encryptor.clone(),
        RouterSettings {
            fanout_parallelism: config.router.fanout_parallelism,
            default_budgets: config.budgets.clone(),
            default_dedup_window: config.dedup.default_window(),
        },
        schedule,
    ));

    let retry_engine = Arc::new(RetryEngine::new(
        history.clone(),
        dlq.clone(),
        router.clone(),
        audit.clone(),
        &config.retry,
    ));

    let digest_engine = Arc::new(DigestEngine::new(
        preferences,
        digest_queue,
        history,
        email_adapter,
        audit,
        encryptor,
        config.digest.clone(),
    ));

    let ingestor = EventIngestor::new(&config.kafka, config.ingest.clone(), router, dlq)?;

    // 8. 启动工作任务
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_addr: SocketAddr = config
        .server_addr()
        .parse()
        .context("健康检查端点地址非法")?;
    tokio::spawn(run_health_server(health_addr, db.clone(), cache.clone()));
    info!(addr = %health_addr, "健康检查端点已启动");

    let retry_handle = tokio::spawn(retry_engine.run(shutdown_rx.clone()));
    let digest_handle = tokio::spawn(digest_engine.run(shutdown_rx.clone()));
    let mut ingest_handle = tokio::spawn(ingestor.run(shutdown_rx));

    // 9. 等待退出条件：信号，或摄取器带错停摆（基础设施级故障）
    let mut ingest_failed = false;
    tokio::select! {
        _ = shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭");
        }
        result = &mut ingest_handle => {
            match result {
                Ok(Ok(())) => warn!("事件摄取器意外退出"),
                Ok(Err(e)) => {
                    error!(error = %e, "事件摄取器因基础设施故障停摆");
                    ingest_failed = true;
                }
                Err(e) => {
                    error!(error = %e, "事件摄取任务崩溃");
                    ingest_failed = true;
                }
            }
        }
    }

    // 10. 广播关闭并等待宽限期
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.server.shutdown_grace_seconds);
    let drained = tokio::time::timeout(grace, async {
        let _ = retry_handle.await;
        let _ = digest_handle.await;
        if !ingest_handle.is_finished() {
            let _ = ingest_handle.await;
        }
    })
    .await;

    db.close().await;

    if drained.is_err() {
        error!(grace_seconds = config.server.shutdown_grace_seconds, "宽限期内未能完成关闭");
        std::process::exit(1);
    }
    if ingest_failed {
        std::process::exit(1);
    }

    info!("notification-service 已退出");
    Ok(())
}

/// 健康检查服务器
///
/// 提供 /health 和 /ready 端点，用于编排系统的存活与就绪探针
async fn run_health_server(addr: SocketAddr, db: Database, cache: Cache) {
    use axum::{Json, Router as AxumRouter, routing::get};
    use serde::Serialize;

    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
        service: String,
    }

    #[derive(Serialize)]
    struct ReadyResponse {
        ready: bool,
        database: String,
        redis: String,
    }

    let app = AxumRouter::new()
        .route(
            "/health",
            get(|| async {
                Json(HealthResponse {
                    status: "healthy".to_string(),
                    service: "notification-service".to_string(),
                })
            }),
        )
        .route(
            "/ready",
            get(move || {
                let db = db.clone();
                let cache = cache.clone();
                async move {
                    let db_status = match db.health_check().await {
                        Ok(_) => "connected",
                        Err(_) => "disconnected",
                    };
                    let redis_status = match cache.health_check().await {
                        Ok(_) => "connected",
                        Err(_) => "disconnected",
                    };

                    Json(ReadyResponse {
                        ready: db_status == "connected" && redis_status == "connected",
                        database: db_status.to_string(),
                        redis: redis_status.to_string(),
                    })
                }
            }),
        );

    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "健康检查服务器退出");
            }
        }
        Err(e) => error!(addr = %addr, error = %e, "健康检查端口绑定失败"),
    }
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("安装 Ctrl+C 处理器失败");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("安装 SIGTERM 处理器失败")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
