//! 行为分析 worker
//!
//! 消费行为事件 topic，维护用户画像与商品计数聚合。

use analytics_worker::consumer::UserEventsConsumer;
use storefront_analytics::AnalyticsService;
use storefront_shared::config::AppConfig;
use storefront_shared::database::Database;
use storefront_shared::events::topics;
use storefront_shared::kafka::{ensure_topics, wait_for_broker};
use storefront_shared::observability;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 统一加载配置：从 config/{service_name}.toml 加载
    let config = AppConfig::load("analytics-worker").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志
    observability::init(&config.observability);

    info!("Starting analytics-worker...");
    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        "Configuration loaded"
    );

    // 3. 等待 broker 就绪并声明 topic，再订阅
    wait_for_broker(&config.kafka).await;
    ensure_topics(&config.kafka, topics::ALL).await?;

    // 4. 初始化数据库连接并执行迁移
    let db = Database::connect(&config.database).await?;
    db.run_migrations().await?;
    info!("Database connection established");

    let analytics = AnalyticsService::new(db.pool().clone());

    // 5. 优雅停机：Ctrl+C 触发 watch 信号，消费循环在批次边界退出
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "监听停机信号失败");
            return;
        }
        info!("收到停机信号，等待当前批次完成...");
        let _ = shutdown_tx.send(true);
    });

    // 6. 启动消费循环（阻塞直到 shutdown）
    let consumer = UserEventsConsumer::new(&config, analytics)?;
    consumer.run(shutdown_rx).await?;

    db.close().await;
    info!("analytics-worker stopped");
    Ok(())
}
