//! 分析聚合服务
//!
//! 单事件算法（每个事件一个事务）：
//! 1. 按 user_id upsert 用户画像；无 user_id 的匿名事件整体跳过
//! 2. 按动作分支维护动作日志：粘性动作 conflict-do-nothing 幂等插入，
//!    浏览动作无条件追加，移除动作删除对应的添加行（0 行不算错）
//! 3. 按 product_id upsert 商品计数器，相对增减并以 GREATEST 垫底
//!
//! 商品计数器的增减以动作日志的实际变更为条件：粘性插入没有插到行、
//! 或移除没有删到行时，计数器不动。这使得 at-least-once 重投在
//! 用户日志和商品计数器两个层面都是完全的 no-op，弥合了原始实现中
//! 两层幂等性不对称的缺口。

use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument, warn};

use storefront_shared::error::Result;
use storefront_shared::events::{UserAction, UserEvent};

use crate::models::{ProductAnalytics, UserAnalytics, UserAnalyticsAction};

// ---------------------------------------------------------------------------
// CounterDeltas — 商品计数器增量
// ---------------------------------------------------------------------------

/// 一次事件对商品计数器各列的相对增量
///
/// 纯数据结构，便于在不依赖数据库的情况下测试动作到增量的映射。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDeltas {
    pub views: i32,
    pub cart_adds: i32,
    pub wishlist_adds: i32,
    pub purchases: i32,
}

impl CounterDeltas {
    /// 动作对应的计数器增量
    ///
    /// `logged` 表示本次投递是否真正变更了动作日志（插入了新行 /
    /// 删除了已有行）。未变更时返回零增量——重投不会二次累加。
    pub fn for_action(action: UserAction, logged: bool) -> Self {
        if !logged {
            return Self::default();
        }

        match action {
            UserAction::ProductView => Self {
                views: 1,
                ..Self::default()
            },
            UserAction::AddToCart => Self {
                cart_adds: 1,
                ..Self::default()
            },
            UserAction::RemoveFromCart => Self {
                cart_adds: -1,
                ..Self::default()
            },
            UserAction::AddToWishlist => Self {
                wishlist_adds: 1,
                ..Self::default()
            },
            UserAction::RemoveFromWishlist => Self {
                wishlist_adds: -1,
                ..Self::default()
            },
            UserAction::Purchase => Self {
                purchases: 1,
                ..Self::default()
            },
            // 店铺访问不触碰商品计数器
            UserAction::ShopVisit => Self::default(),
        }
    }

    /// 是否为零增量（零增量时跳过计数器 upsert）
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

// ---------------------------------------------------------------------------
// AnalyticsService
// ---------------------------------------------------------------------------

/// 分析聚合服务
///
/// 事件消费路径通过 `record_event` 进入（自带事务）；
/// 结算路径通过 `record_purchase` 在订单事务内调用。
#[derive(Clone)]
pub struct AnalyticsService {
    pool: PgPool,
}

impl AnalyticsService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 处理单个行为事件，整个更新在一个事务内完成
    ///
    /// 调用方（worker）以 best-effort 策略包裹本方法——分析失败
    /// 只记日志，绝不阻塞批次位点提交。
    #[instrument(skip(self, event), fields(action = %action, user_id = event.user_id.as_deref().unwrap_or("-")))]
    pub async fn record_event(&self, event: &UserEvent, action: UserAction) -> Result<()> {
        // 匿名事件不追踪
        let Some(user_id) = event.user_id.as_deref() else {
            debug!("事件无 user_id，跳过聚合");
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;

        let analytics_id = upsert_profile(
            &mut tx,
            user_id,
            event.country.as_deref(),
            event.city.as_deref(),
            event.device.as_deref(),
        )
        .await?;

        // 动作日志分支；logged 表示日志层是否发生了实际变更
        let logged = match action {
            UserAction::ShopVisit => false,

            UserAction::ProductView => match event.product_id.as_deref() {
                Some(product_id) => {
                    // 浏览历史不去重，每次浏览追加一行
                    insert_view(&mut tx, analytics_id, product_id).await?;
                    true
                }
                None => {
                    warn!("product-view 事件缺少 product_id，跳过");
                    false
                }
            },

            UserAction::AddToCart | UserAction::AddToWishlist | UserAction::Purchase => {
                match event.product_id.as_deref() {
                    // 粘性动作：首次投递插入，重投 conflict-do-nothing
                    Some(product_id) => {
                        insert_sticky(&mut tx, analytics_id, product_id, action).await?
                    }
                    None => {
                        warn!(%action, "粘性动作缺少 product_id，跳过");
                        false
                    }
                }
            }

            UserAction::RemoveFromCart => {
                self.remove_action(&mut tx, analytics_id, event, UserAction::AddToCart)
                    .await?
            }
            UserAction::RemoveFromWishlist => {
                self.remove_action(&mut tx, analytics_id, event, UserAction::AddToWishlist)
                    .await?
            }
        };

        // 商品计数器：增减以日志层的实际变更为条件
        if let Some(product_id) = event.product_id.as_deref() {
            let deltas = CounterDeltas::for_action(action, logged);
            if !deltas.is_zero() {
                bump_product_counters(&mut tx, product_id, deltas).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// 移除动作：删除对应的添加行，删没删到都不是错误
    async fn remove_action(
        &self,
        tx: &mut PgConnection,
        analytics_id: i64,
        event: &UserEvent,
        counterpart: UserAction,
    ) -> Result<bool> {
        let Some(product_id) = event.product_id.as_deref() else {
            warn!("移除动作缺少 product_id，跳过");
            return Ok(false);
        };

        delete_action(tx, analytics_id, product_id, counterpart).await
    }

    /// 在结算事务内记录一次购买
    ///
    /// 画像 upsert + 幂等的 purchase 动作行 + purchases 计数器按购买
    /// 数量累加。计数器累加以动作行实际插入为条件，webhook 重投下
    /// 整个调用是 no-op。
    pub async fn record_purchase(
        conn: &mut PgConnection,
        user_id: &str,
        product_id: &str,
        quantity: i32,
    ) -> Result<()> {
        let analytics_id = upsert_profile(conn, user_id, None, None, None).await?;

        let inserted = insert_sticky(conn, analytics_id, product_id, UserAction::Purchase).await?;

        if inserted {
            let deltas = CounterDeltas {
                purchases: quantity,
                ..CounterDeltas::default()
            };
            bump_product_counters(conn, product_id, deltas).await?;
        } else {
            debug!(user_id, product_id, "purchase 动作行已存在，跳过计数器累加");
        }

        Ok(())
    }

    /// 查询用户聚合画像（从未产生过事件的用户返回 None）
    pub async fn user_profile(&self, user_id: &str) -> Result<Option<UserAnalytics>> {
        let row = sqlx::query_as::<_, UserAnalytics>(
            r#"
            SELECT id, user_id, country, city, device, last_visited_at
            FROM user_analytics
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// 查询用户的动作日志（新的在前）
    pub async fn user_actions(&self, user_id: &str) -> Result<Vec<UserAnalyticsAction>> {
        let rows = sqlx::query_as::<_, UserAnalyticsAction>(
            r#"
            SELECT a.id, a.analytics_id, a.product_id, a.action, a.created_at
            FROM user_analytics_actions a
            JOIN user_analytics u ON u.id = a.analytics_id
            WHERE u.user_id = $1
            ORDER BY a.created_at DESC, a.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// 查询商品计数器（不存在返回 None）
    pub async fn product_stats(&self, product_id: &str) -> Result<Option<ProductAnalytics>> {
        let row = sqlx::query_as::<_, ProductAnalytics>(
            r#"
            SELECT id, product_id, views, cart_adds, wishlist_adds, purchases, last_visited_at
            FROM product_analytics
            WHERE product_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// SQL 操作（均以 &mut PgConnection 为执行器，可在任意事务内复用）
// ---------------------------------------------------------------------------

/// upsert 用户画像，返回画像行 id
///
/// COALESCE 保证事件缺失的地理/设备字段不会抹掉已知值。
async fn upsert_profile(
    conn: &mut PgConnection,
    user_id: &str,
    country: Option<&str>,
    city: Option<&str>,
    device: Option<&str>,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO user_analytics (user_id, country, city, device, last_visited_at)
        VALUES ($1, $2, $3, $4, NOW())
        ON CONFLICT (user_id) DO UPDATE SET
            country = COALESCE(EXCLUDED.country, user_analytics.country),
            city = COALESCE(EXCLUDED.city, user_analytics.city),
            device = COALESCE(EXCLUDED.device, user_analytics.device),
            last_visited_at = NOW()
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(country)
    .bind(city)
    .bind(device)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

/// 追加一条浏览记录（无去重）
async fn insert_view(conn: &mut PgConnection, analytics_id: i64, product_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_analytics_actions (analytics_id, product_id, action)
        VALUES ($1, $2, $3)
        "#,
    )
    .bind(analytics_id)
    .bind(product_id)
    .bind(UserAction::ProductView.as_wire())
    .execute(conn)
    .await?;

    Ok(())
}

/// 幂等插入粘性动作行
///
/// conflict-do-nothing 依赖部分唯一索引 uniq_user_actions_sticky；
/// 返回本次是否真正插入了新行。
async fn insert_sticky(
    conn: &mut PgConnection,
    analytics_id: i64,
    product_id: &str,
    action: UserAction,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO user_analytics_actions (analytics_id, product_id, action)
        VALUES ($1, $2, $3)
        ON CONFLICT (analytics_id, product_id, action) WHERE action <> 'product-view'
        DO NOTHING
        "#,
    )
    .bind(analytics_id)
    .bind(product_id)
    .bind(action.as_wire())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// 删除动作行，返回是否删到了行
async fn delete_action(
    conn: &mut PgConnection,
    analytics_id: i64,
    product_id: &str,
    action: UserAction,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        DELETE FROM user_analytics_actions
        WHERE analytics_id = $1 AND product_id = $2 AND action = $3
        "#,
    )
    .bind(analytics_id)
    .bind(product_id)
    .bind(action.as_wire())
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// upsert 商品计数器并应用相对增量
///
/// 插入路径和更新路径都用 GREATEST 垫底，保证计数器恒 >= 0
/// （移除多于添加的序列不会把计数器打成负数）。
async fn bump_product_counters(
    conn: &mut PgConnection,
    product_id: &str,
    deltas: CounterDeltas,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO product_analytics
            (product_id, views, cart_adds, wishlist_adds, purchases, last_visited_at)
        VALUES ($1, GREATEST($2, 0), GREATEST($3, 0), GREATEST($4, 0), GREATEST($5, 0), NOW())
        ON CONFLICT (product_id) DO UPDATE SET
            views = GREATEST(product_analytics.views + $2, 0),
            cart_adds = GREATEST(product_analytics.cart_adds + $3, 0),
            wishlist_adds = GREATEST(product_analytics.wishlist_adds + $4, 0),
            purchases = GREATEST(product_analytics.purchases + $5, 0),
            last_visited_at = NOW()
        "#,
    )
    .bind(product_id)
    .bind(deltas.views)
    .bind(deltas.cart_adds)
    .bind(deltas.wishlist_adds)
    .bind(deltas.purchases)
    .execute(conn)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_for_view_always_increments() {
        let deltas = CounterDeltas::for_action(UserAction::ProductView, true);
        assert_eq!(deltas.views, 1);
        assert_eq!(deltas.cart_adds, 0);
        assert_eq!(deltas.wishlist_adds, 0);
        assert_eq!(deltas.purchases, 0);
    }

    #[test]
    fn test_deltas_for_sticky_actions() {
        assert_eq!(
            CounterDeltas::for_action(UserAction::AddToCart, true).cart_adds,
            1
        );
        assert_eq!(
            CounterDeltas::for_action(UserAction::AddToWishlist, true).wishlist_adds,
            1
        );
        assert_eq!(
            CounterDeltas::for_action(UserAction::Purchase, true).purchases,
            1
        );
    }

    #[test]
    fn test_deltas_for_removals_decrement() {
        assert_eq!(
            CounterDeltas::for_action(UserAction::RemoveFromCart, true).cart_adds,
            -1
        );
        assert_eq!(
            CounterDeltas::for_action(UserAction::RemoveFromWishlist, true).wishlist_adds,
            -1
        );
    }

    #[test]
    fn test_deltas_zero_when_log_unchanged() {
        // 重投下日志层 no-op 时计数器必须零增量，这是两层幂等一致的关键
        for action in [
            UserAction::AddToCart,
            UserAction::AddToWishlist,
            UserAction::Purchase,
            UserAction::RemoveFromCart,
            UserAction::RemoveFromWishlist,
        ] {
            assert!(CounterDeltas::for_action(action, false).is_zero());
        }
    }

    #[test]
    fn test_deltas_shop_visit_never_touches_counters() {
        assert!(CounterDeltas::for_action(UserAction::ShopVisit, true).is_zero());
        assert!(CounterDeltas::for_action(UserAction::ShopVisit, false).is_zero());
    }
}
