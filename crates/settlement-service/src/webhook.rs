//! Webhook 签名校验与支付事件解析
//!
//! 支付网关对每次投递签名：`HMAC-SHA256(secret, "{timestamp}.{raw_body}")`，
//! 签名头格式 `t=<unix>,v1=<hex>`。校验必须在解析负载之前进行，
//! 失败属于客户端错误——不重试、不产生任何数据库变更。
//! 时间戳容差用于抵御重放攻击，HMAC 比较通过 `verify_slice` 以常数时间完成。

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use storefront_shared::config::WebhookConfig;

use crate::error::SettlementError;

type HmacSha256 = Hmac<Sha256>;

/// 支付成功事件类型，其余类型在网关侧路由过滤
pub const PAYMENT_SUCCEEDED: &str = "payment_intent.succeeded";

// ---------------------------------------------------------------------------
// WebhookDelivery — 网关转发的原始投递
// ---------------------------------------------------------------------------

/// 网关原样转发到 Kafka 的一次 webhook 投递
///
/// body 保持为原始字符串：签名是对原始字节计算的，
/// 任何先解析再重序列化的做法都会破坏校验。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    /// 签名头原文（`t=<unix>,v1=<hex>`）
    pub signature: String,
    /// 负载原始字节（UTF-8 JSON）
    pub body: String,
}

// ---------------------------------------------------------------------------
// PaymentEvent — 校验通过后解析出的结构
// ---------------------------------------------------------------------------

/// 支付事件负载（网关 JSON 的相关切片）
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEventPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: PaymentEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEventData {
    pub object: PaymentIntent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    /// 支付单号，结算幂等键的一半
    pub id: String,
    #[serde(default)]
    pub metadata: PaymentMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMetadata {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// 结算输入：校验与解析全部通过后的强类型事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub payment_intent_id: String,
    pub session_id: String,
    pub user_id: String,
}

impl PaymentEvent {
    /// 从已校验的负载提取结算所需字段
    ///
    /// metadata 缺失 sessionId / userId 说明结账侧写入有误，
    /// 属于永久性客户端错误。
    pub fn from_payload(payload: &PaymentEventPayload) -> Result<Self, SettlementError> {
        if payload.event_type != PAYMENT_SUCCEEDED {
            return Err(SettlementError::UnsupportedEventType {
                event_type: payload.event_type.clone(),
            });
        }

        let intent = &payload.data.object;
        let session_id = intent.metadata.session_id.clone().ok_or_else(|| {
            SettlementError::MalformedEvent("metadata 缺少 sessionId".to_string())
        })?;
        let user_id = intent
            .metadata
            .user_id
            .clone()
            .ok_or_else(|| SettlementError::MalformedEvent("metadata 缺少 userId".to_string()))?;

        Ok(Self {
            payment_intent_id: intent.id.clone(),
            session_id,
            user_id,
        })
    }
}

// ---------------------------------------------------------------------------
// WebhookVerifier — 签名校验器
// ---------------------------------------------------------------------------

/// HMAC-SHA256 签名校验器
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance_seconds: i64,
}

impl WebhookVerifier {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            secret: config.signing_secret.as_bytes().to_vec(),
            tolerance_seconds: config.tolerance_seconds,
        }
    }

    /// 校验一次投递并解析出支付事件
    ///
    /// 顺序固定：解析签名头 -> 时间戳容差 -> HMAC 比对 -> JSON 解析。
    /// 任何一步失败都不触碰数据库。
    pub fn verify(&self, delivery: &WebhookDelivery) -> Result<PaymentEvent, SettlementError> {
        let (timestamp, signature_hex) = parse_signature_header(&delivery.signature)?;

        let now = Utc::now().timestamp();
        if (now - timestamp).abs() > self.tolerance_seconds {
            return Err(SettlementError::InvalidSignature(format!(
                "时间戳超出容差: 事件 {timestamp}, 当前 {now}"
            )));
        }

        self.verify_hmac(timestamp, &delivery.body, &signature_hex)?;

        let payload: PaymentEventPayload = serde_json::from_str(&delivery.body)
            .map_err(|e| SettlementError::MalformedEvent(e.to_string()))?;
        PaymentEvent::from_payload(&payload)
    }

    /// 常数时间 HMAC 比对
    fn verify_hmac(
        &self,
        timestamp: i64,
        body: &str,
        signature_hex: &str,
    ) -> Result<(), SettlementError> {
        let expected = hex::decode(signature_hex)
            .map_err(|_| SettlementError::InvalidSignature("签名不是合法的 hex".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| SettlementError::InvalidSignature(e.to_string()))?;
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body.as_bytes());

        mac.verify_slice(&expected)
            .map_err(|_| SettlementError::InvalidSignature("HMAC 不匹配".to_string()))
    }

    /// 按网关格式对负载签名（测试与本地网关模拟用）
    pub fn sign(&self, timestamp: i64, body: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC 接受任意长度密钥");
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={digest}")
    }
}

/// 解析签名头 `t=<unix>,v1=<hex>`
fn parse_signature_header(header: &str) -> Result<(i64, String), SettlementError> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| {
                    SettlementError::InvalidSignature(format!("时间戳非法: {value}"))
                })?);
            }
            Some(("v1", value)) => signature = Some(value.to_string()),
            // 未知键忽略，网关可能追加新的签名版本
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) => Ok((t, s)),
        _ => Err(SettlementError::InvalidSignature(format!(
            "签名头缺少 t 或 v1: {header}"
        ))),
    }
}
