//! 行为事件批量消费 worker
//!
//! 从 USER_EVENTS topic 批量拉取行为事件，按动作穷尽分发到分析聚合服务。
//! 自动提交已关闭：逐条 resolve、整批 commit，处理失败只重投未 resolve
//! 的尾部。未知动作记日志后按已处理跳过，以容忍生产者先升级的版本偏移。

pub mod consumer;
