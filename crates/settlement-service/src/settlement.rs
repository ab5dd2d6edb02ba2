//! 订单结算引擎
//!
//! 把结账会话快照落地为按店铺拆分的订单。每个店铺组在独立事务内
//! 完成订单写入、明细写入、守护式库存扣减与购买分析记录；
//! (payment_intent_id, shop_id) 唯一键使整个结算对重复投递幂等——
//! 冲突意味着该组在先前的投递中已结算，静默跳过。
//!
//! 纯计算部分（分组、合计、优惠券）抽为独立函数，无需数据库即可测试。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use storefront_analytics::AnalyticsService;
use storefront_shared::error::StorefrontError;
use storefront_shared::events::{OrderCreatedEvent, topics};
use storefront_shared::kafka::EventProducer;
use storefront_shared::policy::best_effort;
use storefront_shared::retry::RetryPolicy;
use tracing::{info, instrument, warn};

use crate::error::SettlementError;
use crate::session::{CartLine, CouponSnapshot, PaymentSession, SessionStore};
use crate::webhook::PaymentEvent;

// ---------------------------------------------------------------------------
// 纯计算：分组与金额
// ---------------------------------------------------------------------------

/// 按店铺拆分购物车行项目
///
/// BTreeMap 保证组的遍历顺序确定（按 shop_id 字典序），
/// 使同一会话的多次结算尝试以相同顺序写库。
pub fn group_by_shop(lines: &[CartLine]) -> BTreeMap<String, Vec<&CartLine>> {
    let mut groups: BTreeMap<String, Vec<&CartLine>> = BTreeMap::new();
    for line in lines {
        groups.entry(line.shop_id.clone()).or_default().push(line);
    }
    groups
}

/// 组内原始合计：Σ 单价 × 数量
pub fn raw_total(lines: &[&CartLine]) -> i64 {
    lines
        .iter()
        .map(|line| line.sale_price * i64::from(line.quantity))
        .sum()
}

/// 优惠券在本组的折扣金额
///
/// 优惠券整个会话只作用于一个行项目：仅包含 discounted_product_id
/// 的组产生折扣，百分比按行合计计算，固定金额以行合计封顶。
pub fn coupon_discount(coupon: Option<&CouponSnapshot>, lines: &[&CartLine]) -> i64 {
    let Some(coupon) = coupon else {
        return 0;
    };

    let Some(line) = lines
        .iter()
        .find(|l| l.product_id == coupon.discounted_product_id)
    else {
        return 0;
    };

    let line_total = line.sale_price * i64::from(line.quantity);

    if let Some(percent) = coupon.percent_off {
        line_total * percent / 100
    } else if let Some(amount) = coupon.amount_off {
        amount.min(line_total)
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// SettlementService
// ---------------------------------------------------------------------------

/// 已结算订单（settle 的返回单元）
#[derive(Debug, Clone)]
pub struct SettledOrder {
    pub order_id: i64,
    pub shop_id: String,
    pub total: i64,
    pub created_at: DateTime<Utc>,
}

/// 订单结算服务
///
/// 会话存储以 trait object 注入，测试用内存实现替换 Redis。
pub struct SettlementService {
    pool: PgPool,
    sessions: Arc<dyn SessionStore>,
    producer: Arc<EventProducer>,
    retry: RetryPolicy,
}

impl SettlementService {
    pub fn new(
        pool: PgPool,
        sessions: Arc<dyn SessionStore>,
        producer: Arc<EventProducer>,
    ) -> Self {
        Self {
            pool,
            sessions,
            producer,
            retry: RetryPolicy::default(),
        }
    }

    /// 结算一次支付成功事件
    ///
    /// 错误通过 `?` 传播（transactional 策略）：任何未完成的组保持
    /// 未写入状态，重投递时由唯一键跳过已提交的组、续写剩余的组。
    /// 返回本次实际新建的订单（已结算跳过的组不在其中）。
    #[instrument(skip(self), fields(payment_intent_id = %event.payment_intent_id, user_id = %event.user_id))]
    pub async fn settle(&self, event: &PaymentEvent) -> Result<Vec<SettledOrder>, SettlementError> {
        // 1. 加载会话快照：缺失（已过期）时无任何数据库变更
        let session = self
            .sessions
            .get(&event.user_id, &event.session_id)
            .await?
            .ok_or_else(|| StorefrontError::SessionNotFound {
                user_id: event.user_id.clone(),
                session_id: event.session_id.clone(),
            })?;

        // 2. 解析用户
        self.resolve_user(&event.user_id).await?;

        // 3. 按店铺分组，逐组在独立事务内结算
        let groups = group_by_shop(&session.lines);
        let mut settled = Vec::with_capacity(groups.len());

        for (shop_id, lines) in &groups {
            if let Some(order) = self.settle_group(event, &session, shop_id, lines).await? {
                settled.push(order);
            }
        }

        // 4. 全部组落地后：发布订单事件并清理会话，均为 best-effort
        self.publish_order_events(event, &settled).await;
        self.cleanup_session(event).await;

        info!(
            orders = settled.len(),
            shops = groups.len(),
            "结算完成"
        );
        Ok(settled)
    }

    async fn resolve_user(&self, user_id: &str) -> Result<(), StorefrontError> {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Ok(()),
            None => Err(StorefrontError::UserNotFound {
                user_id: user_id.to_string(),
            }),
        }
    }

    /// 结算单个店铺组（一个事务）
    ///
    /// 返回 None 表示该组已在先前的投递中结算（唯一键冲突），静默跳过。
    async fn settle_group(
        &self,
        event: &PaymentEvent,
        session: &PaymentSession,
        shop_id: &str,
        lines: &[&CartLine],
    ) -> Result<Option<SettledOrder>, StorefrontError> {
        let raw = raw_total(lines);
        let discount = coupon_discount(session.coupon.as_ref(), lines);
        let total = raw - discount;
        // 折扣为 0 时不在订单上留优惠券快照（优惠券作用于别的组）
        let coupon_code = if discount > 0 {
            session.coupon.as_ref().map(|c| c.code.as_str())
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;

        let inserted: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            r#"
            INSERT INTO orders
                (payment_intent_id, shop_id, user_id, status, total,
                 shipping_address_id, coupon_code, discount)
            VALUES ($1, $2, $3, 'paid', $4, $5, $6, $7)
            ON CONFLICT (payment_intent_id, shop_id) DO NOTHING
            RETURNING id, created_at
            "#,
        )
        .bind(&event.payment_intent_id)
        .bind(shop_id)
        .bind(&event.user_id)
        .bind(total)
        .bind(session.shipping_address_id.as_deref())
        .bind(coupon_code)
        .bind(discount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((order_id, created_at)) = inserted else {
            warn!(
                payment_intent_id = %event.payment_intent_id,
                shop_id,
                "店铺组已结算（重复投递），跳过"
            );
            return Ok(None);
        };

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO order_items
                    (order_id, product_id, quantity, unit_price, selected_options)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(order_id)
            .bind(&line.product_id)
            .bind(line.quantity)
            .bind(line.sale_price)
            .bind(&line.selected_options)
            .execute(&mut *tx)
            .await?;

            // 守护式扣减：库存不足时不扣减，订单保持已支付状态，
            // 留给人工对账处理（超卖以警告而非失败呈现）
            let updated = sqlx::query(
                r#"
                UPDATE products
                SET stock = stock - $2, total_sales = total_sales + $2
                WHERE id = $1 AND stock >= $2
                "#,
            )
            .bind(&line.product_id)
            .bind(line.quantity)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                let available: Option<i32> =
                    sqlx::query_scalar("SELECT stock FROM products WHERE id = $1")
                        .bind(&line.product_id)
                        .fetch_optional(&mut *tx)
                        .await?;

                match available {
                    Some(available) => {
                        let shortfall = StorefrontError::InsufficientStock {
                            product_id: line.product_id.clone(),
                            requested: line.quantity,
                            available,
                        };
                        warn!(order_id, code = shortfall.code(), error = %shortfall, "未扣减库存");
                    }
                    None => {
                        warn!(
                            product_id = %line.product_id,
                            order_id,
                            "商品不存在，未扣减库存"
                        );
                    }
                }
            }

            // 购买分析与订单同事务：订单提交则购买计数一定提交
            AnalyticsService::record_purchase(
                &mut tx,
                &event.user_id,
                &line.product_id,
                line.quantity,
            )
            .await?;
        }

        tx.commit().await?;

        info!(order_id, shop_id, total, discount, "订单已创建");
        Ok(Some(SettledOrder {
            order_id,
            shop_id: shop_id.to_string(),
            total,
            created_at,
        }))
    }

    /// 按订单发布 OrderCreatedEvent（best-effort，失败只记日志）
    async fn publish_order_events(&self, payment: &PaymentEvent, settled: &[SettledOrder]) {
        for order in settled {
            let event = OrderCreatedEvent {
                order_id: order.order_id,
                user_id: payment.user_id.clone(),
                shop_id: order.shop_id.clone(),
                total: order.total,
                payment_intent_id: payment.payment_intent_id.clone(),
                created_at: order.created_at,
            };

            best_effort(&self.retry, "producer.order_created", || async {
                self.producer
                    .send_json(topics::ORDER_CREATED, Some(&order.shop_id), &event)
                    .await
                    .map(|_| ())
            })
            .await;
        }
    }

    /// 结算成功后删除会话，失败只记警告（TTL 最终会清理）
    async fn cleanup_session(&self, event: &PaymentEvent) {
        if let Err(e) = self
            .sessions
            .delete(&event.user_id, &event.session_id)
            .await
        {
            warn!(
                session_id = %event.session_id,
                error = %e,
                "会话清理失败，等待 TTL 过期"
            );
        }
    }
}
