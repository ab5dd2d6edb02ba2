//! 日志初始化
//!
//! 统一各服务的 tracing-subscriber 配置：RUST_LOG 环境变量优先，
//! 其次使用配置文件的 log_level；输出格式按配置在 json（结构化）
//! 与 pretty（人类可读）之间切换。

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// 初始化全局日志订阅器
///
/// 重复初始化（如测试中）被静默忽略。
pub fn init(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("日志订阅器已初始化，跳过重复初始化");
    }
}
