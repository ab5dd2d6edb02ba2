//! 共享库
//!
//! 包含分析/结算管道各服务共用的配置、错误处理、数据库连接、缓存、
//! Kafka 生产/消费、重试策略与错误处理策略等基础设施代码。

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod policy;
pub mod retry;
