//! Kafka 批量消费与事件分发
//!
//! 将 Kafka 消息解码为行为事件信封，解析动作后交给分析聚合服务。
//! 分析更新以 best-effort 策略执行——失败记日志吞掉，绝不阻塞
//! 批次位点提交（分析是非权威的次级数据，不是 system of record）。

use storefront_analytics::AnalyticsService;
use storefront_shared::config::AppConfig;
use storefront_shared::error::StorefrontError;
use storefront_shared::events::{UserEvent, consumer_groups, topics};
use storefront_shared::kafka::{BatchConsumer, ConsumerMessage, HandlerOutcome};
use storefront_shared::policy::best_effort;
use storefront_shared::retry::RetryPolicy;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 行为事件消费者
///
/// 组合 BatchConsumer（批量拉取 + 位点协议）与 AnalyticsService
/// （聚合写入），形成完整的消费管道。
pub struct UserEventsConsumer {
    consumer: BatchConsumer,
    analytics: AnalyticsService,
    retry: RetryPolicy,
}

impl UserEventsConsumer {
    pub fn new(config: &AppConfig, analytics: AnalyticsService) -> Result<Self, StorefrontError> {
        let consumer = BatchConsumer::new(&config.kafka, consumer_groups::USER_EVENTS_GROUP)?;
        Ok(Self {
            consumer,
            analytics,
            retry: RetryPolicy::default(),
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    ///
    /// 将 analytics 和 retry 移入闭包，通过 BatchConsumer::run 驱动。
    /// 单独抽取 handle_message 函数方便单元测试。
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), StorefrontError> {
        self.consumer.subscribe(&[topics::USER_EVENTS])?;

        info!(topic = topics::USER_EVENTS, "行为事件消费者已启动");

        let analytics = self.analytics;
        let retry = self.retry;

        self.consumer
            .run(shutdown, |msg| {
                let analytics = &analytics;
                let retry = &retry;
                async move { handle_message(analytics, retry, &msg).await }
            })
            .await;

        info!("行为事件消费者已停止");
        Ok(())
    }
}

/// 处理单条 Kafka 消息
///
/// 拆分为独立函数而非方法，便于在测试中直接调用而无需构造完整的 Consumer。
/// 流程：反序列化 -> 动作解析 -> best-effort 聚合写入。
///
/// 返回 Skipped 的两种情况都 resolve 位点而不报错：
/// - 负载不是合法的事件 JSON（毒消息不应永久阻塞分区）
/// - 动作字符串无法识别（新版生产者的前向兼容）
pub async fn handle_message(
    analytics: &AnalyticsService,
    retry: &RetryPolicy,
    msg: &ConsumerMessage,
) -> Result<HandlerOutcome, StorefrontError> {
    // 1. 反序列化事件信封
    let event: UserEvent = match msg.deserialize_payload() {
        Ok(event) => event,
        Err(e) => {
            warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                error = %e,
                "事件反序列化失败，按已处理跳过"
            );
            return Ok(HandlerOutcome::Skipped);
        }
    };

    // 2. 解析动作：未知动作记日志并跳过（版本偏移容忍）
    let Some(action) = event.parsed_action() else {
        warn!(
            action = %event.action,
            offset = msg.offset,
            "未知动作类型，按已处理跳过"
        );
        return Ok(HandlerOutcome::Skipped);
    };

    debug!(
        %action,
        user_id = event.user_id.as_deref().unwrap_or("-"),
        product_id = event.product_id.as_deref().unwrap_or("-"),
        "收到行为事件"
    );

    // 3. best-effort 聚合写入：瞬时故障先重试，最终失败吞掉。
    //    分析失败绝不传播到批次位点提交。
    best_effort(retry, "analytics.record_event", || {
        analytics.record_event(&event, action)
    })
    .await;

    Ok(HandlerOutcome::Handled)
}
