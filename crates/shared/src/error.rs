//! 统一错误处理模块
//!
//! 定义管道中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 错误分为两大处理路径：分析类错误被 best_effort 策略吞掉，
//! 结算类错误向上传播触发支付方重试（见 policy 模块）。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum StorefrontError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    // ==================== 缓存错误 ====================
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 结算业务错误 ====================
    #[error("支付会话未找到或已过期: user_id={user_id} session_id={session_id}")]
    SessionNotFound { user_id: String, session_id: String },

    #[error("用户未找到: user_id={user_id}")]
    UserNotFound { user_id: String },

    #[error("webhook 签名校验失败: {0}")]
    InvalidSignature(String),

    #[error("webhook 元数据缺失: {field}")]
    MissingMetadata { field: String },

    #[error("库存不足: product_id={product_id} 请求 {requested}, 剩余 {available}")]
    InsufficientStock {
        product_id: String,
        requested: i32,
        available: i32,
    },

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, StorefrontError>;

impl StorefrontError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            Self::UserNotFound { .. } => "USER_NOT_FOUND",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::MissingMetadata { .. } => "MISSING_METADATA",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 仅基础设施层的瞬时故障可重试；签名失败、会话缺失等
    /// 客户端错误重试只会得到相同结果。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Redis(_) | Self::Kafka(_))
    }

    /// 是否为客户端错误（webhook 入口应返回 4xx，支付方不再重投）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSignature(_) | Self::MissingMetadata { .. } | Self::Validation(_)
        )
    }
}
