//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的抽象：
//! - `EventProducer`：带显式连接状态机的生产者，connect/disconnect 幂等
//! - `wait_for_broker` / `ensure_topics`：启动期就绪探测与幂等建topic
//! - `BatchConsumer`：关闭自动提交的批量消费循环，逐条 resolve、整批 commit，
//!   中途失败时只重投未 resolve 的尾部
//!
//! 统一消息序列化、错误映射和优雅关闭语义，避免各服务重复编写样板代码。

use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::StorefrontError;

/// broker 就绪探测的固定退避间隔
const BROKER_POLL_INTERVAL: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, StorefrontError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| StorefrontError::Kafka(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// EventProducer
// ---------------------------------------------------------------------------

/// 生产者连接状态
///
/// 显式状态机取代布尔标志：连接路径由 Mutex 串行化，
/// 并发调用方不会竞争重复建立连接。
enum ProducerState {
    Disconnected,
    Connected(FutureProducer),
}

/// 面向业务的 Kafka 生产者
///
/// connect/disconnect 均为幂等操作；send 在未连接时自动连接。
/// 上游 HTTP 处理器以 fire-and-forget 方式调用 send——发布失败
/// 返回给调用方自行记录，不阻塞面向用户的响应。
pub struct EventProducer {
    brokers: String,
    state: Mutex<ProducerState>,
}

impl EventProducer {
    /// 创建生产者（尚未连接，首次 send 或显式 connect 时才建立连接）
    pub fn new(config: &KafkaConfig) -> Self {
        Self {
            brokers: config.brokers.clone(),
            state: Mutex::new(ProducerState::Disconnected),
        }
    }

    /// 幂等连接：已连接时直接返回
    pub async fn connect(&self) -> Result<(), StorefrontError> {
        self.ensure_connected().await.map(|_| ())
    }

    /// 保证连接已建立并返回底层生产者的克隆
    ///
    /// `FutureProducer` 内部是 Arc 包装的，克隆后在锁外发送，
    /// 避免长时间持有状态锁。
    async fn ensure_connected(&self) -> Result<FutureProducer, StorefrontError> {
        let mut state = self.state.lock().await;

        if let ProducerState::Connected(producer) = &*state {
            return Ok(producer.clone());
        }

        // message.timeout.ms 设为 5 秒——5 秒内仍无法投递时应由
        // 调用方按 best-effort 处理，而非无限等待。
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| StorefrontError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %self.brokers, "Kafka 生产者已连接");
        *state = ProducerState::Connected(producer.clone());
        Ok(producer)
    }

    /// 发送原始字节消息
    ///
    /// `key` 为分区键（如 user_id），同键事件保持发布顺序；
    /// 无键消息按轮询方式落入任意分区。
    pub async fn send(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(i32, i64), StorefrontError> {
        let producer = self.ensure_connected().await?;

        let delivery = match key {
            Some(k) => {
                producer
                    .send(
                        FutureRecord::to(topic).key(k).payload(payload),
                        Duration::from_secs(5),
                    )
                    .await
            }
            None => {
                producer
                    .send(
                        FutureRecord::<(), _>::to(topic).payload(payload),
                        Duration::from_secs(5),
                    )
                    .await
            }
        }
        .map_err(|(e, _)| StorefrontError::Kafka(format!("发送消息失败: {e}")))?;

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
        key: Option<&str>,
        value: &T,
    ) -> Result<(i32, i64), StorefrontError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| StorefrontError::Kafka(format!("序列化失败: {e}")))?;

        self.send(topic, key, &payload).await
    }

    /// 幂等断开：flush 未完成的投递后释放连接
    pub async fn disconnect(&self) -> Result<(), StorefrontError> {
        let mut state = self.state.lock().await;

        if let ProducerState::Connected(producer) =
            std::mem::replace(&mut *state, ProducerState::Disconnected)
        {
            // flush 是阻塞调用，移到阻塞线程池执行
            let result = tokio::task::spawn_blocking(move || {
                producer.flush(Duration::from_secs(5))
            })
            .await
            .map_err(|e| StorefrontError::Internal(format!("flush 任务失败: {e}")))?;

            result.map_err(|e| StorefrontError::Kafka(format!("flush 失败: {e}")))?;
            info!("Kafka 生产者已断开");
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 启动期：broker 就绪探测与 topic 声明
// ---------------------------------------------------------------------------

/// 阻塞等待 broker 可达
///
/// 以固定 3 秒间隔轮询元数据请求，不设重试上限——没有 broker 的
/// 消费服务毫无用处，在其就绪之前不应接收流量。
pub async fn wait_for_broker(config: &KafkaConfig) {
    let mut attempt: u32 = 0;

    loop {
        let brokers = config.brokers.clone();
        let probe = tokio::task::spawn_blocking(move || -> Result<(), rdkafka::error::KafkaError> {
            let consumer: BaseConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .create()?;
            // 元数据请求成功即认为 broker 就绪
            consumer.fetch_metadata(None, Duration::from_secs(5))?;
            Ok(())
        })
        .await;

        match probe {
            Ok(Ok(())) => {
                info!(brokers = %config.brokers, attempt, "Kafka broker 已就绪");
                return;
            }
            Ok(Err(e)) => {
                warn!(
                    brokers = %config.brokers,
                    attempt,
                    error = %e,
                    "Kafka broker 不可达，3 秒后重试"
                );
            }
            Err(e) => {
                warn!(attempt, error = %e, "就绪探测任务异常，3 秒后重试");
            }
        }

        attempt += 1;
        tokio::time::sleep(BROKER_POLL_INTERVAL).await;
    }
}

/// 幂等地声明 topic 列表
///
/// 使用配置的分区数和副本因子创建；topic 已存在不是错误。
/// 在 worker 订阅之前于启动期执行一次。
pub async fn ensure_topics(
    config: &KafkaConfig,
    topic_names: &[&str],
) -> Result<(), StorefrontError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .create()
        .map_err(|e| StorefrontError::Kafka(format!("创建 admin client 失败: {e}")))?;

    let new_topics: Vec<NewTopic<'_>> = topic_names
        .iter()
        .map(|name| {
            NewTopic::new(
                name,
                config.topic_partitions,
                TopicReplication::Fixed(config.replication_factor),
            )
        })
        .collect();

    let results = admin
        .create_topics(new_topics.iter(), &AdminOptions::new())
        .await
        .map_err(|e| StorefrontError::Kafka(format!("创建 topic 失败: {e}")))?;

    for result in results {
        match result {
            Ok(topic) => info!(topic, "topic 已创建"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic, "topic 已存在，跳过")
            }
            Err((topic, code)) => {
                return Err(StorefrontError::Kafka(format!(
                    "创建 topic {topic} 失败: {code}"
                )));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// 批处理协议（纯函数部分，不依赖 broker，便于单元测试）
// ---------------------------------------------------------------------------

/// 单条消息的处理判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// 已成功处理，resolve 该消息的位点
    Handled,
    /// 未知动作等可容忍情况：按已处理跳过，同样 resolve 位点
    Skipped,
}

/// 已 resolve 的消息位点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 批内首个失败的位置与原因
#[derive(Debug)]
pub struct BatchFailure {
    /// 失败消息在批内的下标
    pub index: usize,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub error: StorefrontError,
}

/// 一批消息的处理报告
#[derive(Debug)]
pub struct BatchReport {
    /// 按处理顺序 resolve 的位点（失败消息之前的前缀）
    pub resolved: Vec<ResolvedOffset>,
    /// 其中因未知动作等原因被跳过的条数
    pub skipped: usize,
    /// 首个失败；None 表示整批成功
    pub failure: Option<BatchFailure>,
}

impl BatchReport {
    /// 整批是否全部 resolve
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// 失败批次的分区回退目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekTarget {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// 计算失败批次中每个受影响分区的回退位点
///
/// 批次从消费流凑批，多个分区的消息在批内交错；失败下标之后的
/// 尾部可能包含其他分区已拉取但未处理的消息，而流的拉取位置已经
/// 越过它们。只回退失败消息所在的分区会把这些尾部消息永久丢掉——
/// 每个在尾部（含失败消息本身）出现的分区都必须回退。
///
/// 批内同分区消息保持拉取顺序，因此按分区取首个出现的位点即是
/// 该分区的首个未处理位点。
pub fn recovery_seeks(messages: &[ConsumerMessage], failure_index: usize) -> Vec<SeekTarget> {
    let mut targets: Vec<SeekTarget> = Vec::new();

    for msg in &messages[failure_index..] {
        let seen = targets
            .iter()
            .any(|t| t.topic == msg.topic && t.partition == msg.partition);
        if !seen {
            targets.push(SeekTarget {
                topic: msg.topic.clone(),
                partition: msg.partition,
                offset: msg.offset,
            });
        }
    }

    targets
}

/// 按序处理一批消息
///
/// 批处理协议的核心状态机，与 broker 完全解耦：
/// - 每条消息在 `handler_timeout` 的应用层死线内执行，超时视为失败，
///   避免慢 handler 拖垮消费组的 poll 间隔
/// - 成功或跳过都 resolve 位点；首个失败立即中止，
///   报告已 resolve 的前缀和失败位置
///
/// 调用方（`BatchConsumer::run`）负责把报告落实为 store/commit/seek。
pub async fn run_batch<F, Fut>(
    messages: &[ConsumerMessage],
    handler_timeout: Duration,
    handler: F,
) -> BatchReport
where
    F: Fn(&ConsumerMessage) -> Fut,
    Fut: std::future::Future<Output = Result<HandlerOutcome, StorefrontError>>,
{
    let mut resolved = Vec::with_capacity(messages.len());
    let mut skipped = 0usize;

    for (index, msg) in messages.iter().enumerate() {
        let outcome = match tokio::time::timeout(handler_timeout, handler(msg)).await {
            Ok(result) => result,
            Err(_) => Err(StorefrontError::Internal(format!(
                "消息处理超时 ({}s)",
                handler_timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(HandlerOutcome::Handled) => {
                resolved.push(ResolvedOffset {
                    topic: msg.topic.clone(),
                    partition: msg.partition,
                    offset: msg.offset,
                });
            }
            Ok(HandlerOutcome::Skipped) => {
                skipped += 1;
                resolved.push(ResolvedOffset {
                    topic: msg.topic.clone(),
                    partition: msg.partition,
                    offset: msg.offset,
                });
            }
            Err(error) => {
                return BatchReport {
                    resolved,
                    skipped,
                    failure: Some(BatchFailure {
                        index,
                        topic: msg.topic.clone(),
                        partition: msg.partition,
                        offset: msg.offset,
                        error,
                    }),
                };
            }
        }
    }

    BatchReport {
        resolved,
        skipped,
        failure: None,
    }
}

// ---------------------------------------------------------------------------
// BatchConsumer
// ---------------------------------------------------------------------------

/// 关闭自动提交的批量消费者
///
/// 自动提交与自动位点存储均被关闭：worker 逐条 resolve（store_offset），
/// 整批成功后才 commit。中途失败时同步提交已 resolve 的前缀，并把批
/// 尾涉及的每个分区 seek 回各自的首个未处理位点，使重投覆盖全部未
/// resolve 的消息。
pub struct BatchConsumer {
    consumer: StreamConsumer,
    max_batch: usize,
    batch_wait: Duration,
    handler_timeout: Duration,
}

impl BatchConsumer {
    /// 创建消费者
    ///
    /// `logical_group` 是逻辑消费组名（见 events::consumer_groups），
    /// 实际 group id 为 `{配置前缀}.{逻辑名}`，使多个逻辑消费者
    /// 可以按部署共享或隔离 offset 追踪。
    pub fn new(config: &KafkaConfig, logical_group: &str) -> Result<Self, StorefrontError> {
        let group_id = format!("{}.{}", config.consumer_group, logical_group);

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .map_err(|e| StorefrontError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 批量消费者已初始化");

        Ok(Self {
            consumer,
            max_batch: config.max_batch_messages,
            batch_wait: Duration::from_millis(config.batch_wait_ms),
            handler_timeout: Duration::from_secs(config.handler_timeout_seconds),
        })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), StorefrontError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| StorefrontError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动批量消费循环
    ///
    /// 循环结构：凑批 -> run_batch -> 落实位点。收到关闭信号时
    /// 在批边界退出，正在处理的批会自然完成。
    pub async fn run<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<HandlerOutcome, StorefrontError>>,
    {
        use futures::StreamExt;

        info!("批量消费循环已启动");

        loop {
            let batch = {
                let stream = self.consumer.stream();
                futures::pin_mut!(stream);

                let mut batch: Vec<ConsumerMessage> = Vec::with_capacity(self.max_batch);

                // 首条消息无限等待（同时监听关闭信号），后续消息只等凑批窗口
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("收到关闭信号，批量消费循环退出");
                            return;
                        }
                        continue;
                    }

                    first = stream.next() => {
                        match first {
                            Some(Ok(msg)) => batch.push(ConsumerMessage::from_borrowed(&msg)),
                            Some(Err(e)) => {
                                error!(error = %e, "接收 Kafka 消息出错");
                                continue;
                            }
                            None => {
                                warn!("Kafka 消息流意外结束");
                                return;
                            }
                        }
                    }
                }

                while batch.len() < self.max_batch {
                    match tokio::time::timeout(self.batch_wait, stream.next()).await {
                        Ok(Some(Ok(msg))) => batch.push(ConsumerMessage::from_borrowed(&msg)),
                        Ok(Some(Err(e))) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            break;
                        }
                        // 凑批窗口到期或流结束，按当前批处理
                        Ok(None) | Err(_) => break,
                    }
                }

                batch
            };

            debug!(batch_size = batch.len(), "开始处理批次");

            let report = run_batch(&batch, self.handler_timeout, |msg| handler(msg.clone())).await;
            self.apply_report(&batch, &report);
        }
    }

    /// 把批处理报告落实到 broker 位点
    ///
    /// 成功路径：store 全部 resolved 位点后异步 commit。
    /// 失败路径：同步 commit 已 resolve 的前缀（保证它们不被重投），
    /// 再把尾部涉及的每个分区 seek 回各自的首个未处理位点，下一批
    /// 从这些消息恢复。
    fn apply_report(&self, batch: &[ConsumerMessage], report: &BatchReport) {
        for r in &report.resolved {
            // store_offset 记录的是"下一条待消费"之前的已处理位点，
            // commit 时由 librdkafka 换算为提交位置
            if let Err(e) = self
                .consumer
                .store_offset(&r.topic, r.partition, r.offset)
            {
                warn!(
                    topic = %r.topic,
                    partition = r.partition,
                    offset = r.offset,
                    error = %e,
                    "store_offset 失败"
                );
            }
        }

        match &report.failure {
            None => {
                if !report.resolved.is_empty()
                    && let Err(e) = self.consumer.commit_consumer_state(CommitMode::Async)
                {
                    warn!(error = %e, "批次位点提交失败，将在下一批重试");
                }
                if report.skipped > 0 {
                    debug!(skipped = report.skipped, "批内存在被跳过的消息");
                }
            }
            Some(failure) => {
                error!(
                    index = failure.index,
                    topic = %failure.topic,
                    partition = failure.partition,
                    offset = failure.offset,
                    error = %failure.error,
                    "批次处理中止，提交已 resolve 前缀并回退未处理分区"
                );

                // 同步提交，确保已处理前缀的位点先于 seek 落盘
                if !report.resolved.is_empty()
                    && let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync)
                {
                    warn!(error = %e, "失败批次的前缀位点提交失败");
                }

                // 尾部可能交错着其他分区已拉取未处理的消息，逐分区回退
                for target in recovery_seeks(batch, failure.index) {
                    if let Err(e) = self.consumer.seek(
                        &target.topic,
                        target.partition,
                        rdkafka::Offset::Offset(target.offset),
                        Duration::from_secs(5),
                    ) {
                        // seek 失败时依赖消费组再均衡后的 committed 位点恢复
                        warn!(
                            topic = %target.topic,
                            partition = target.partition,
                            offset = target.offset,
                            error = %e,
                            "seek 回未处理位点失败"
                        );
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_message(offset: i64, payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: "storefront.user.events".to_string(),
            partition: 0,
            offset,
            key: Some("user-001".to_string()),
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_consumer_message_deserialize() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Event {
            action: String,
        }

        let msg = make_message(42, br#"{"action":"add-to-cart"}"#);
        let event: Event = msg.deserialize_payload().unwrap();
        assert_eq!(event.action, "add-to-cart");
    }

    #[test]
    fn test_consumer_message_deserialize_invalid_json() {
        let msg = make_message(0, b"not json");
        let result: Result<serde_json::Value, _> = msg.deserialize_payload();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_producer_connect_is_idempotent() {
        // 创建 FutureProducer 不触发网络 I/O，无 broker 也能验证状态机
        let producer = EventProducer::new(&KafkaConfig::default());

        producer.connect().await.unwrap();
        producer.connect().await.unwrap();

        // 已连接后 disconnect 再 disconnect 也应幂等
        producer.disconnect().await.unwrap();
        producer.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_batch_all_handled() {
        let messages: Vec<_> = (0..5).map(|i| make_message(i, b"{}")).collect();

        let report = run_batch(&messages, Duration::from_secs(1), |_msg| async {
            Ok(HandlerOutcome::Handled)
        })
        .await;

        assert!(report.is_complete());
        assert_eq!(report.resolved.len(), 5);
        assert_eq!(report.skipped, 0);
        // 位点按处理顺序 resolve
        let offsets: Vec<i64> = report.resolved.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_run_batch_failure_keeps_resolved_prefix() {
        // 第 N 条失败时：1..N-1 已 resolve，N..M 不被 resolve
        let messages: Vec<_> = (0..6).map(|i| make_message(i, b"{}")).collect();
        let fail_at = 3usize;

        let report = run_batch(&messages, Duration::from_secs(1), |msg| {
            let fail = msg.offset == fail_at as i64;
            async move {
                if fail {
                    Err(StorefrontError::Internal("模拟处理失败".to_string()))
                } else {
                    Ok(HandlerOutcome::Handled)
                }
            }
        })
        .await;

        assert!(!report.is_complete());
        // 只有失败之前的前缀被 resolve
        assert_eq!(report.resolved.len(), fail_at);
        let offsets: Vec<i64> = report.resolved.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);

        // 失败位置被准确报告，重投从这里恢复
        let failure = report.failure.unwrap();
        assert_eq!(failure.index, fail_at);
        assert_eq!(failure.offset, fail_at as i64);
    }

    #[tokio::test]
    async fn test_run_batch_skipped_still_resolves() {
        // 未知动作被跳过但位点照常 resolve，不阻塞后续提交
        let messages: Vec<_> = (0..4).map(|i| make_message(i, b"{}")).collect();

        let report = run_batch(&messages, Duration::from_secs(1), |msg| {
            let skip = msg.offset % 2 == 0;
            async move {
                if skip {
                    Ok(HandlerOutcome::Skipped)
                } else {
                    Ok(HandlerOutcome::Handled)
                }
            }
        })
        .await;

        assert!(report.is_complete());
        assert_eq!(report.resolved.len(), 4);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_run_batch_handler_timeout_counts_as_failure() {
        let messages = vec![make_message(0, b"{}")];

        let report = run_batch(&messages, Duration::from_millis(10), |_msg| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HandlerOutcome::Handled)
        })
        .await;

        assert!(!report.is_complete());
        assert!(report.resolved.is_empty());
        let failure = report.failure.unwrap();
        assert_eq!(failure.index, 0);
        assert!(failure.error.to_string().contains("超时"));
    }

    #[tokio::test]
    async fn test_run_batch_failure_count_invocations() {
        // 失败之后的消息不应被调用
        let messages: Vec<_> = (0..10).map(|i| make_message(i, b"{}")).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let report = run_batch(&messages, Duration::from_secs(1), |msg| {
            let counter = counter.clone();
            let fail = msg.offset == 4;
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(StorefrontError::Internal("boom".to_string()))
                } else {
                    Ok(HandlerOutcome::Handled)
                }
            }
        })
        .await;

        assert!(!report.is_complete());
        // 0..=4 共 5 次调用，5..10 未被触碰
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    fn make_partition_message(partition: i32, offset: i64) -> ConsumerMessage {
        ConsumerMessage {
            partition,
            ..make_message(offset, b"{}")
        }
    }

    #[test]
    fn test_recovery_seeks_rewinds_every_tail_partition() {
        // 两个分区交错：[P0:5, P1:9, P0:6, P1:10]，P0:6 处失败。
        // 前缀 [P0:5, P1:9] 已 resolve；P1:10 虽未处理但已被拉取，
        // 回退必须同时覆盖 P0 和 P1
        let batch = vec![
            make_partition_message(0, 5),
            make_partition_message(1, 9),
            make_partition_message(0, 6),
            make_partition_message(1, 10),
        ];

        let seeks = recovery_seeks(&batch, 2);

        assert_eq!(seeks.len(), 2);
        assert_eq!(
            seeks[0],
            SeekTarget {
                topic: "storefront.user.events".to_string(),
                partition: 0,
                offset: 6,
            }
        );
        assert_eq!(
            seeks[1],
            SeekTarget {
                topic: "storefront.user.events".to_string(),
                partition: 1,
                offset: 10,
            }
        );
    }

    #[test]
    fn test_recovery_seeks_single_partition_returns_failure_offset() {
        let batch: Vec<_> = (3..8).map(|o| make_partition_message(0, o)).collect();

        let seeks = recovery_seeks(&batch, 2);

        assert_eq!(seeks.len(), 1);
        assert_eq!(seeks[0].partition, 0);
        assert_eq!(seeks[0].offset, 5);
    }

    #[test]
    fn test_recovery_seeks_takes_first_unprocessed_offset_per_partition() {
        // 同一分区在尾部出现多次时取最早的位点
        let batch = vec![
            make_partition_message(2, 20),
            make_partition_message(1, 7),
            make_partition_message(1, 8),
            make_partition_message(2, 21),
        ];

        let seeks = recovery_seeks(&batch, 0);

        assert_eq!(seeks.len(), 2);
        assert_eq!((seeks[0].partition, seeks[0].offset), (2, 20));
        assert_eq!((seeks[1].partition, seeks[1].offset), (1, 7));
    }

    #[test]
    fn test_recovery_seeks_failure_at_last_message() {
        // 尾部只剩失败消息本身，只回退它所在的分区
        let batch = vec![
            make_partition_message(0, 5),
            make_partition_message(1, 9),
            make_partition_message(2, 30),
        ];

        let seeks = recovery_seeks(&batch, 2);

        assert_eq!(seeks.len(), 1);
        assert_eq!((seeks[0].partition, seeks[0].offset), (2, 30));
    }

    /// 需要本地 Kafka broker，`cargo test -- --ignored` 手动运行。
    ///
    /// 六条消息按 key 散列到多个分区；首次投递时 "m3" 失败一次，
    /// 失败批次尾部（含其他分区的消息）必须被完整重投，最终六条
    /// 全部处理成功。
    #[tokio::test]
    #[ignore]
    async fn test_failed_batch_redelivers_unprocessed_tail() {
        use std::sync::Mutex as StdMutex;
        use std::sync::atomic::AtomicBool;

        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let topic = format!("storefront.test.batch.{nonce}");

        let config = KafkaConfig {
            consumer_group: format!("storefront-test-{nonce}"),
            max_batch_messages: 10,
            batch_wait_ms: 200,
            ..KafkaConfig::default()
        };

        ensure_topics(&config, &[topic.as_str()]).await.unwrap();

        let producer = EventProducer::new(&config);
        for i in 0..6 {
            let key = format!("k{i}");
            let body = format!("m{i}");
            producer
                .send(&topic, Some(key.as_str()), body.as_bytes())
                .await
                .unwrap();
        }
        producer.disconnect().await.unwrap();

        let consumer = BatchConsumer::new(&config, "redelivery-it").unwrap();
        consumer.subscribe(&[topic.as_str()]).unwrap();

        let failed_once = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(StdMutex::new(Vec::<String>::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let failed_once = failed_once.clone();
            let seen = seen.clone();
            tokio::spawn(consumer.run(shutdown_rx, move |msg| {
                let failed_once = failed_once.clone();
                let seen = seen.clone();
                async move {
                    let body = String::from_utf8_lossy(&msg.payload).to_string();
                    if body == "m3" && !failed_once.swap(true, Ordering::SeqCst) {
                        return Err(StorefrontError::Internal("一次性故障".to_string()));
                    }
                    seen.lock().unwrap().push(body);
                    Ok(HandlerOutcome::Handled)
                }
            }))
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            if seen.lock().unwrap().len() >= 6 || tokio::time::Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        for i in 0..6 {
            assert!(
                seen.contains(&format!("m{i}")),
                "消息 m{i} 未被处理，已处理: {seen:?}"
            );
        }
    }
}
