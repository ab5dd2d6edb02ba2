//! 聚合表行模型

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// 用户聚合画像（每用户一行）
///
/// 首个事件 upsert 创建，之后每个事件刷新 last-seen 地理/设备信息。
/// 本子系统永不删除该表的行。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserAnalytics {
    pub id: i64,
    pub user_id: String,
    pub country: Option<String>,
    pub city: Option<String>,
    pub device: Option<String>,
    pub last_visited_at: DateTime<Utc>,
}

/// 用户动作日志行
///
/// 粘性动作每 (analytics_id, product_id, action) 至多一行；
/// product-view 不去重，每次浏览一行。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserAnalyticsAction {
    pub id: i64,
    pub analytics_id: i64,
    pub product_id: String,
    pub action: String,
    pub created_at: DateTime<Utc>,
}

/// 商品滚动计数器（每商品一行，product_id 唯一）
///
/// 不变式：所有计数器恒 >= 0。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ProductAnalytics {
    pub id: i64,
    pub product_id: String,
    pub views: i32,
    pub cart_adds: i32,
    pub wishlist_adds: i32,
    pub purchases: i32,
    pub last_visited_at: DateTime<Utc>,
}
