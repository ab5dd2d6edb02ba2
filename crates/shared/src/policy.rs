//! 错误处理策略
//!
//! 管道中存在两条明确区分的错误处理路径：
//! - **best-effort**：分析聚合属于非权威的次级数据，失败只记日志并吞掉，
//!   绝不影响批次位点提交——由 `best_effort` 统一实现，瞬时故障先按
//!   重试策略恢复，仍失败才放弃。
//! - **transactional**：结算错误通过 `?` 向上传播，使 webhook 入口返回
//!   非 2xx 触发支付方重投——不需要包装器，普通的 Result 传播即是策略。
//!
//! 集中在此而非散落的 try/catch，保证两种语义的边界清晰可审计。

use std::future::Future;

use tracing::warn;

use crate::error::StorefrontError;
use crate::retry::{RetryPolicy, retry_with_policy};

/// best-effort 执行：瞬时故障重试，最终失败记日志并吞掉
///
/// 返回值指示操作最终是否成功，调用方可据此打点但不应据此失败。
pub async fn best_effort<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, operation: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorefrontError>>,
{
    match retry_with_policy(policy, operation_name, StorefrontError::is_retryable, operation).await
    {
        Ok(_) => true,
        Err(e) => {
            warn!(
                operation = operation_name,
                error = %e,
                "best-effort 操作最终失败，已吞掉错误"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_best_effort_success() {
        let ok = best_effort(&fast_policy(), "op", || async { Ok::<_, StorefrontError>(()) }).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_final_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let ok = best_effort(&fast_policy(), "op", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorefrontError::Kafka("持续故障".to_string()))
            }
        })
        .await;

        // 错误被吞掉而非传播，重试次数符合策略
        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_best_effort_does_not_retry_client_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let ok = best_effort(&fast_policy(), "op", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StorefrontError::Validation("参数无效".to_string()))
            }
        })
        .await;

        assert!(!ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
