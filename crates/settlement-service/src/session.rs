//! 支付会话存储
//!
//! 结账时前端把购物车快照写入 Redis（带 TTL），webhook 负载只携带
//! (user_id, session_id) 标识——会话快照是订单内容的唯一事实来源。
//! 通过 trait 抽象存储后端，测试用内存假实现替换 Redis。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use storefront_shared::cache::{Cache, CacheKey};
use storefront_shared::error::StorefrontError;

/// 结账会话的默认 TTL，过期后 webhook 无法再结算
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(900);

// ---------------------------------------------------------------------------
// PaymentSession — 结账会话快照
// ---------------------------------------------------------------------------

/// 购物车行项目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    pub shop_id: String,
    /// 单价（最小货币单位）
    pub sale_price: i64,
    pub quantity: i32,
    /// 规格选择（颜色、尺码等），原样透传到订单明细
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_options: Option<Value>,
}

/// 优惠券快照
///
/// 整个会话最多作用于一个行项目（discounted_product_id 指定），
/// 百分比与固定金额二选一。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CouponSnapshot {
    pub code: String,
    pub discounted_product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_off: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_off: Option<i64>,
}

/// 结账会话快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub session_id: String,
    pub user_id: String,
    pub lines: Vec<CartLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon: Option<CouponSnapshot>,
}

// ---------------------------------------------------------------------------
// SessionStore — 存储抽象
// ---------------------------------------------------------------------------

/// 支付会话存储接口
///
/// 使用 trait object 注入结算服务，测试以内存实现替换。
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, StorefrontError>;

    async fn put(&self, session: &PaymentSession, ttl: Duration) -> Result<(), StorefrontError>;

    async fn delete(&self, user_id: &str, session_id: &str) -> Result<(), StorefrontError>;
}

/// Redis 实现，键格式 `payment-session:{user_id}:{session_id}`
pub struct RedisSessionStore {
    cache: Cache,
}

impl RedisSessionStore {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<PaymentSession>, StorefrontError> {
        self.cache
            .get(&CacheKey::payment_session(user_id, session_id))
            .await
    }

    async fn put(&self, session: &PaymentSession, ttl: Duration) -> Result<(), StorefrontError> {
        self.cache
            .set(
                &CacheKey::payment_session(&session.user_id, &session.session_id),
                session,
                ttl,
            )
            .await
    }

    async fn delete(&self, user_id: &str, session_id: &str) -> Result<(), StorefrontError> {
        self.cache
            .delete(&CacheKey::payment_session(user_id, session_id))
            .await
    }
}

pub mod testing {
    //! 测试用内存会话存储（集成测试以此替换 Redis）

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// 内存实现，忽略 TTL（过期用显式 delete 模拟）
    #[derive(Default)]
    pub struct InMemorySessionStore {
        sessions: Mutex<HashMap<String, PaymentSession>>,
    }

    impl InMemorySessionStore {
        fn key(user_id: &str, session_id: &str) -> String {
            CacheKey::payment_session(user_id, session_id)
        }
    }

    #[async_trait]
    impl SessionStore for InMemorySessionStore {
        async fn get(
            &self,
            user_id: &str,
            session_id: &str,
        ) -> Result<Option<PaymentSession>, StorefrontError> {
            let sessions = self.sessions.lock().unwrap();
            Ok(sessions.get(&Self::key(user_id, session_id)).cloned())
        }

        async fn put(
            &self,
            session: &PaymentSession,
            _ttl: Duration,
        ) -> Result<(), StorefrontError> {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.insert(
                Self::key(&session.user_id, &session.session_id),
                session.clone(),
            );
            Ok(())
        }

        async fn delete(&self, user_id: &str, session_id: &str) -> Result<(), StorefrontError> {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.remove(&Self::key(user_id, session_id));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::InMemorySessionStore;
    use super::*;

    fn sample_session() -> PaymentSession {
        PaymentSession {
            session_id: "sess-1".to_string(),
            user_id: "user-1".to_string(),
            lines: vec![CartLine {
                product_id: "prod-1".to_string(),
                shop_id: "shop-1".to_string(),
                sale_price: 2_500,
                quantity: 2,
                selected_options: Some(serde_json::json!({"color": "black"})),
            }],
            shipping_address_id: Some("addr-1".to_string()),
            coupon: None,
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemorySessionStore::default();
        let session = sample_session();

        store.put(&session, DEFAULT_SESSION_TTL).await.unwrap();
        let loaded = store.get("user-1", "sess-1").await.unwrap();
        assert_eq!(loaded, Some(session));

        store.delete("user-1", "sess-1").await.unwrap();
        assert_eq!(store.get("user-1", "sess-1").await.unwrap(), None);
    }

    #[test]
    fn test_session_wire_format() {
        let session = sample_session();
        let json = serde_json::to_string(&session).unwrap();

        // 前端写入的是 camelCase JSON
        assert!(json.contains("sessionId"));
        assert!(json.contains("salePrice"));
        assert!(json.contains("selectedOptions"));

        let decoded: PaymentSession = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn test_coupon_snapshot_optional_fields() {
        let json = r#"{"code":"SAVE10","discountedProductId":"prod-1","percentOff":10}"#;
        let coupon: CouponSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(coupon.percent_off, Some(10));
        assert_eq!(coupon.amount_off, None);
    }
}
