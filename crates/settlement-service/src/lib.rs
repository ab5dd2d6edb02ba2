//! 支付结算服务
//!
//! 消费支付网关转发的 webhook 投递，完成签名校验后把结账会话
//! 快照落地为按店铺拆分的订单。每个店铺组在独立事务内写入订单、
//! 订单明细、守护式扣减库存并记录购买分析；订单表上的
//! (payment_intent_id, shop_id) 唯一键保证同一支付事件的重复投递
//! 不会产生重复订单。

pub mod consumer;
pub mod error;
pub mod session;
pub mod settlement;
pub mod webhook;

pub use error::SettlementError;
pub use settlement::SettlementService;
