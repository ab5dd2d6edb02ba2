//! 事件模型与动作分类
//!
//! 定义用户行为事件的统一信封格式和七种可追踪动作的封闭枚举。
//! 动作在处理侧始终通过穷尽 match 分发——新增动作类型是编译错误而非运行时跳过；
//! 唯一允许未知动作存活的位置是线缆反序列化边界（`UserAction::from_wire`），
//! 以容忍生产者先于消费者升级的版本偏移。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有 Kafka topic 名称，防止字符串散落在各服务中导致拼写不一致
pub mod topics {
    pub const USER_EVENTS: &str = "storefront.user.events";
    pub const ORDER_CREATED: &str = "storefront.order.created";
    pub const PAYMENT_COMPLETED: &str = "storefront.payment.completed";

    /// 启动时需要声明的全部 topic
    pub const ALL: &[&str] = &[USER_EVENTS, ORDER_CREATED, PAYMENT_COMPLETED];
}

/// 逻辑消费组名称
///
/// 实际的 group id 由部署前缀与逻辑名拼接而成（`{prefix}.{logical}`），
/// 使多个逻辑消费者可以按部署共享或隔离 offset 追踪。
pub mod consumer_groups {
    pub const USER_EVENTS_GROUP: &str = "user-events";
    pub const PAYMENT_EVENTS_GROUP: &str = "payment-settlement";
}

// ---------------------------------------------------------------------------
// UserAction — 可追踪动作枚举
// ---------------------------------------------------------------------------

/// 用户行为动作的封闭集合
///
/// 线缆名称为 kebab-case（`"add-to-cart"` 等）。`AddToCart` / `AddToWishlist` /
/// `Purchase` 是粘性动作：以去重集合而非追加日志的语义记录；
/// `ProductView` 永不去重，每次浏览都是一条新记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserAction {
    ShopVisit,
    AddToWishlist,
    AddToCart,
    ProductView,
    RemoveFromWishlist,
    RemoveFromCart,
    Purchase,
}

impl UserAction {
    /// 从线缆字符串解析动作
    ///
    /// 未知字符串返回 None——消费侧对未知动作记日志并按已处理跳过，
    /// 而非崩溃，以容忍新版生产者发布尚未认识的动作类型。
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "shop-visit" => Some(Self::ShopVisit),
            "add-to-wishlist" => Some(Self::AddToWishlist),
            "add-to-cart" => Some(Self::AddToCart),
            "product-view" => Some(Self::ProductView),
            "remove-from-wishlist" => Some(Self::RemoveFromWishlist),
            "remove-from-cart" => Some(Self::RemoveFromCart),
            "purchase" => Some(Self::Purchase),
            _ => None,
        }
    }

    /// 线缆名称（与数据库 action 列的取值一致）
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::ShopVisit => "shop-visit",
            Self::AddToWishlist => "add-to-wishlist",
            Self::AddToCart => "add-to-cart",
            Self::ProductView => "product-view",
            Self::RemoveFromWishlist => "remove-from-wishlist",
            Self::RemoveFromCart => "remove-from-cart",
            Self::Purchase => "purchase",
        }
    }

    /// 粘性动作以去重集合语义记录，重复投递是免费的
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::AddToCart | Self::AddToWishlist | Self::Purchase)
    }

    /// 移除动作对应的添加动作（删除动作日志行时按此匹配）
    pub fn counterpart_add(&self) -> Option<Self> {
        match self {
            Self::RemoveFromCart => Some(Self::AddToCart),
            Self::RemoveFromWishlist => Some(Self::AddToWishlist),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

// ---------------------------------------------------------------------------
// UserEvent — 行为事件信封
// ---------------------------------------------------------------------------

/// 用户行为事件的线缆信封
///
/// `action` 保持为原始字符串而非枚举：反序列化边界是唯一允许未知动作
/// 存活的位置，解析推迟到分发时通过 `UserAction::from_wire` 完成。
/// 除 action 外所有字段均可选——匿名事件（无 user_id）在聚合时整体跳过。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEvent {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl UserEvent {
    /// 构建新事件，记录当前时间
    pub fn new(action: UserAction, user_id: impl Into<String>) -> Self {
        Self {
            action: action.as_wire().to_string(),
            user_id: Some(user_id.into()),
            product_id: None,
            shop_id: None,
            timestamp: Some(Utc::now()),
            country: None,
            city: None,
            device: None,
        }
    }

    /// 解析动作字段，未知动作返回 None
    pub fn parsed_action(&self) -> Option<UserAction> {
        UserAction::from_wire(&self.action)
    }
}

// ---------------------------------------------------------------------------
// OrderCreatedEvent — 订单创建事件
// ---------------------------------------------------------------------------

/// 结算完成后按店铺发布的订单创建事件
///
/// 下游（邮件、卖家通知等）异步消费；发布失败不影响结算结果，
/// 仅记录警告（best-effort 语义）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    pub order_id: i64,
    pub user_id: String,
    pub shop_id: String,
    /// 订单总额（最小货币单位）
    pub total: i64,
    pub payment_intent_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_constants() {
        assert_eq!(topics::USER_EVENTS, "storefront.user.events");
        assert_eq!(topics::ORDER_CREATED, "storefront.order.created");
        assert_eq!(topics::PAYMENT_COMPLETED, "storefront.payment.completed");
        assert_eq!(topics::ALL.len(), 3);
    }

    #[test]
    fn test_action_wire_roundtrip() {
        let all = [
            UserAction::ShopVisit,
            UserAction::AddToWishlist,
            UserAction::AddToCart,
            UserAction::ProductView,
            UserAction::RemoveFromWishlist,
            UserAction::RemoveFromCart,
            UserAction::Purchase,
        ];
        for action in all {
            assert_eq!(UserAction::from_wire(action.as_wire()), Some(action));
        }
    }

    #[test]
    fn test_unknown_action_returns_none() {
        assert_eq!(UserAction::from_wire("start-livestream"), None);
        assert_eq!(UserAction::from_wire(""), None);
        // 大小写不匹配也视为未知，线缆格式是严格的 kebab-case
        assert_eq!(UserAction::from_wire("ADD-TO-CART"), None);
    }

    #[test]
    fn test_sticky_classification() {
        assert!(UserAction::AddToCart.is_sticky());
        assert!(UserAction::AddToWishlist.is_sticky());
        assert!(UserAction::Purchase.is_sticky());
        assert!(!UserAction::ProductView.is_sticky());
        assert!(!UserAction::ShopVisit.is_sticky());
        assert!(!UserAction::RemoveFromCart.is_sticky());
    }

    #[test]
    fn test_counterpart_add() {
        assert_eq!(
            UserAction::RemoveFromCart.counterpart_add(),
            Some(UserAction::AddToCart)
        );
        assert_eq!(
            UserAction::RemoveFromWishlist.counterpart_add(),
            Some(UserAction::AddToWishlist)
        );
        assert_eq!(UserAction::Purchase.counterpart_add(), None);
        assert_eq!(UserAction::ProductView.counterpart_add(), None);
    }

    #[test]
    fn test_user_event_serialization() {
        let mut event = UserEvent::new(UserAction::AddToCart, "user-001");
        event.product_id = Some("prod-42".to_string());
        event.country = Some("FR".to_string());

        let json = serde_json::to_string(&event).unwrap();

        // 验证 camelCase 与 kebab-case 动作名
        assert!(json.contains(r#""action":"add-to-cart""#));
        assert!(json.contains("userId"));
        assert!(json.contains("productId"));
        // 未设置的可选字段不应出现
        assert!(!json.contains("shopId"));

        let deserialized: UserEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.parsed_action(), Some(UserAction::AddToCart));
        assert_eq!(deserialized.user_id.as_deref(), Some("user-001"));
        assert_eq!(deserialized.product_id.as_deref(), Some("prod-42"));
    }

    #[test]
    fn test_user_event_unknown_action_still_deserializes() {
        // 新版生产者发布的未知动作必须能通过反序列化，由分发层决定跳过
        let json = r#"{"action":"follow-shop","userId":"user-001"}"#;
        let event: UserEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.parsed_action(), None);
        assert_eq!(event.user_id.as_deref(), Some("user-001"));
    }

    #[test]
    fn test_order_created_event_serialization() {
        let event = OrderCreatedEvent {
            order_id: 1001,
            user_id: "user-001".to_string(),
            shop_id: "shop-7".to_string(),
            total: 18_000,
            payment_intent_id: "pi_abc123".to_string(),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("orderId"));
        assert!(json.contains("paymentIntentId"));

        let deserialized: OrderCreatedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.order_id, 1001);
        assert_eq!(deserialized.total, 18_000);
    }
}
