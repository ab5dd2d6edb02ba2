//! 结算服务专用错误类型
//!
//! 在共享库 StorefrontError 基础上定义本服务特有的错误变体。
//! 关键区分是"客户端错误"（签名非法、会话缺失等，重试永远不会成功，
//! 消费侧按已处理跳过）与"瞬时错误"（数据库/Redis/Kafka 故障，
//! 中断批次等待重投递）。

use storefront_shared::error::StorefrontError;

/// 支付结算错误
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// webhook 签名头缺失、格式非法、超出时间容差或 HMAC 不匹配
    #[error("签名校验失败: {0}")]
    InvalidSignature(String),

    /// webhook 负载不是期望的事件结构
    #[error("支付事件解析失败: {0}")]
    MalformedEvent(String),

    /// 本服务只处理支付成功事件，其他类型由路由配置排除
    #[error("不支持的事件类型: {event_type}")]
    UnsupportedEventType { event_type: String },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] StorefrontError),
}

impl SettlementError {
    /// 永久性错误：重投递不会改变结果，消费侧记日志后跳过
    ///
    /// 会话缺失（已过期）与用户缺失也归入此类——支付会话的 TTL
    /// 已经过去，任何次数的重试都无法恢复快照。
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::InvalidSignature(_) | Self::MalformedEvent(_) => true,
            Self::UnsupportedEventType { .. } => true,
            Self::Shared(e) => matches!(
                e,
                StorefrontError::SessionNotFound { .. }
                    | StorefrontError::UserNotFound { .. }
                    | StorefrontError::InvalidSignature(_)
                    | StorefrontError::MissingMetadata { .. }
                    | StorefrontError::Validation(_)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SettlementError::InvalidSignature("HMAC 不匹配".to_string());
        assert_eq!(err.to_string(), "签名校验失败: HMAC 不匹配");

        let err = SettlementError::UnsupportedEventType {
            event_type: "payment_intent.created".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "不支持的事件类型: payment_intent.created"
        );
    }

    #[test]
    fn test_permanent_classification() {
        assert!(SettlementError::InvalidSignature("x".into()).is_permanent());
        assert!(SettlementError::MalformedEvent("x".into()).is_permanent());
        assert!(
            SettlementError::Shared(StorefrontError::SessionNotFound {
                user_id: "u1".into(),
                session_id: "s1".into(),
            })
            .is_permanent()
        );
        // 数据库故障是瞬时的，必须触发重投递
        assert!(
            !SettlementError::Shared(StorefrontError::Database(sqlx::Error::PoolClosed))
                .is_permanent()
        );
    }
}
