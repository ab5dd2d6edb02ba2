//! 分析聚合库
//!
//! 给定单个用户行为事件，幂等地维护三张聚合表：
//! 用户画像（user_analytics）、用户动作日志（user_analytics_actions）
//! 和商品滚动计数器（product_analytics）。
//! 被 analytics-worker（事件消费路径）和 settlement-service
//! （结算事务内的 purchase 记录）共同使用。

pub mod models;
pub mod service;

pub use service::AnalyticsService;
