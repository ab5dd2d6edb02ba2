//! 支付结算服务
//!
//! 消费支付 topic，完成签名校验与按店铺的订单落地。

use std::sync::Arc;

use settlement_service::consumer::PaymentEventsConsumer;
use settlement_service::session::RedisSessionStore;
use settlement_service::settlement::SettlementService;
use storefront_shared::cache::Cache;
use storefront_shared::config::AppConfig;
use storefront_shared::database::Database;
use storefront_shared::events::topics;
use storefront_shared::kafka::{EventProducer, ensure_topics, wait_for_broker};
use storefront_shared::observability;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 统一加载配置：从 config/{service_name}.toml 加载
    let config = AppConfig::load("settlement-service").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志
    observability::init(&config.observability);

    info!("Starting settlement-service...");
    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        "Configuration loaded"
    );

    // 3. 等待 broker 就绪并声明 topic
    wait_for_broker(&config.kafka).await;
    ensure_topics(&config.kafka, topics::ALL).await?;

    // 4. 初始化数据库连接并执行迁移
    let db = Database::connect(&config.database).await?;
    db.run_migrations().await?;
    info!("Database connection established");

    // 5. 初始化 Redis 会话存储
    let cache = Cache::new(&config.redis)?;
    cache.health_check().await?;
    info!("Redis connection established");
    let sessions = Arc::new(RedisSessionStore::new(cache));

    // 6. 事件生产者（发布订单创建事件，惰性连接）
    let producer = Arc::new(EventProducer::new(&config.kafka));

    let settlement = Arc::new(SettlementService::new(
        db.pool().clone(),
        sessions,
        producer.clone(),
    ));

    // 7. 优雅停机：Ctrl+C 触发 watch 信号，消费循环在批次边界退出
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "监听停机信号失败");
            return;
        }
        info!("收到停机信号，等待当前批次完成...");
        let _ = shutdown_tx.send(true);
    });

    // 8. 启动消费循环（阻塞直到 shutdown）
    let consumer = PaymentEventsConsumer::new(&config, settlement)?;
    consumer.run(shutdown_rx).await?;

    // flush 未投递的订单事件
    producer.disconnect().await?;
    db.close().await;
    info!("settlement-service stopped");
    Ok(())
}
