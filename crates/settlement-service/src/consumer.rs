//! 支付事件消费与结算分发
//!
//! 网关把原始 webhook 投递（签名头 + 原始负载）转发到支付 topic，
//! 本消费者完成签名校验、事件解析与结算。错误按两类处理：
//! - 永久性错误（签名非法、负载畸形、会话过期）重投递不会成功，
//!   记日志后按已处理跳过，避免毒消息永久阻塞分区；
//! - 瞬时错误（数据库/Redis/Kafka）中断批次等待重投递，
//!   已提交的店铺组由订单唯一键保护。

use std::sync::Arc;

use storefront_shared::config::AppConfig;
use storefront_shared::error::StorefrontError;
use storefront_shared::events::{consumer_groups, topics};
use storefront_shared::kafka::{BatchConsumer, ConsumerMessage, HandlerOutcome};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::SettlementError;
use crate::settlement::SettlementService;
use crate::webhook::{WebhookDelivery, WebhookVerifier};

/// 支付事件消费者
pub struct PaymentEventsConsumer {
    consumer: BatchConsumer,
    verifier: WebhookVerifier,
    settlement: Arc<SettlementService>,
}

impl PaymentEventsConsumer {
    pub fn new(
        config: &AppConfig,
        settlement: Arc<SettlementService>,
    ) -> Result<Self, StorefrontError> {
        let consumer = BatchConsumer::new(&config.kafka, consumer_groups::PAYMENT_EVENTS_GROUP)?;
        Ok(Self {
            consumer,
            verifier: WebhookVerifier::new(&config.webhook),
            settlement,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), StorefrontError> {
        self.consumer.subscribe(&[topics::PAYMENT_COMPLETED])?;

        info!(topic = topics::PAYMENT_COMPLETED, "支付事件消费者已启动");

        let verifier = self.verifier;
        let settlement = self.settlement;

        self.consumer
            .run(shutdown, |msg| {
                let verifier = &verifier;
                let settlement = &settlement;
                async move { handle_message(verifier, settlement, &msg).await }
            })
            .await;

        info!("支付事件消费者已停止");
        Ok(())
    }
}

/// 处理单条支付投递
///
/// 校验 -> 解析 -> 结算。永久性失败 Skipped，瞬时失败向上传播
/// 中断批次（transactional 策略——与分析侧的 best-effort 相反）。
pub async fn handle_message(
    verifier: &WebhookVerifier,
    settlement: &SettlementService,
    msg: &ConsumerMessage,
) -> Result<HandlerOutcome, StorefrontError> {
    let delivery: WebhookDelivery = match msg.deserialize_payload() {
        Ok(delivery) => delivery,
        Err(e) => {
            warn!(
                offset = msg.offset,
                partition = msg.partition,
                error = %e,
                "投递信封反序列化失败，按已处理跳过"
            );
            return Ok(HandlerOutcome::Skipped);
        }
    };

    let event = match verifier.verify(&delivery) {
        Ok(event) => event,
        Err(e) => {
            // 校验/解析错误全部是永久性的，不触碰数据库
            warn!(offset = msg.offset, error = %e, "webhook 校验失败，按已处理跳过");
            return Ok(HandlerOutcome::Skipped);
        }
    };

    match settlement.settle(&event).await {
        Ok(_) => Ok(HandlerOutcome::Handled),
        Err(e) if e.is_permanent() => {
            warn!(
                payment_intent_id = %event.payment_intent_id,
                error = %e,
                "结算遇到永久性错误，按已处理跳过"
            );
            Ok(HandlerOutcome::Skipped)
        }
        Err(SettlementError::Shared(inner)) => Err(inner),
        // is_permanent 已覆盖全部非 Shared 变体，此分支仅为穷尽性
        Err(e) => Err(StorefrontError::Internal(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storefront_shared::config::WebhookConfig;

    fn make_message(payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::PAYMENT_COMPLETED.to_string(),
            partition: 0,
            offset: 7,
            key: Some("pi_123".to_string()),
            payload: payload.to_vec(),
            timestamp: None,
        }
    }

    #[test]
    fn test_delivery_envelope_roundtrip() {
        let verifier = WebhookVerifier::new(&WebhookConfig::default());
        let body = r#"{"type":"payment_intent.succeeded","data":{"object":{"id":"pi_123","metadata":{"sessionId":"s-1","userId":"u-1"}}}}"#;
        let delivery = WebhookDelivery {
            signature: verifier.sign(chrono::Utc::now().timestamp(), body),
            body: body.to_string(),
        };

        let msg = make_message(&serde_json::to_vec(&delivery).unwrap());
        let decoded: WebhookDelivery = msg.deserialize_payload().unwrap();

        let event = verifier.verify(&decoded).unwrap();
        assert_eq!(event.payment_intent_id, "pi_123");
        assert_eq!(event.session_id, "s-1");
        assert_eq!(event.user_id, "u-1");
    }

    #[test]
    fn test_malformed_envelope_fails_deserialization() {
        let msg = make_message(b"\x00\x01 not an envelope");
        let result: Result<WebhookDelivery, _> = msg.deserialize_payload();
        assert!(result.is_err());
    }
}
