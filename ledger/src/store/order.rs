//! Service order lifecycle.
//!
//! The status machine decides when settlement fires and prevents it from
//! firing twice: entering `completed` (by client confirmation, dispute
//! resolution, or the auto-confirm timeout) triggers the deferred
//! commission settlement inside the same transaction as the status write.
//!
//! ```text
//! paid -> in_progress -> pending_completion -> completed
//!  |          |                                   |
//!  |          +----------> disputed <-------------+
//!  |                          |
//!  |                          +--> completed (resolution)
//!  +--> cancelled (refund, cashback clawback)
//! ```

use derive_more::Display;
use jiff::{SignedDuration, Timestamp};
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use super::settlement::{SettlementReceipt, settle_order_commission_tx};
use super::{
    AccountId, BalanceType, Correlation, LedgerEntryType, OrderId, RevenueRecordId, StoreError,
    account,
};
use crate::commission::{CommissionConfig, calculate_commission};
use crate::time::TimeSource;

/// How long a non-responding client has before completion is implied.
pub const AUTO_CONFIRM_WINDOW: SignedDuration = SignedDuration::from_hours(72);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
pub enum OrderStatus {
    Paid,
    InProgress,
    PendingCompletion,
    Completed,
    Disputed,
    Cancelled,
}

impl OrderStatus {
    /// Legal lifecycle moves. Settlement-adjacent rules (refunds, clawback,
    /// payout) are enforced by the transition functions, not here.
    pub fn can_transition_to(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, to),
            (Paid, InProgress)
                | (Paid, Disputed)
                | (Paid, Cancelled)
                | (InProgress, PendingCompletion)
                | (InProgress, Disputed)
                | (PendingCompletion, Completed)
                | (Completed, Disputed)
                | (Disputed, Completed)
        )
    }
}

/// A paid service engagement between a client and a specialist.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub client_account_id: AccountId,
    pub specialist_account_id: AccountId,
    pub gross_amount: Decimal,
    pub status: OrderStatus,
    pub commission_processed: bool,
    pub cashback_processed: bool,
    pub platform_revenue_id: Option<RevenueRecordId>,
    pub auto_confirm_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Database-level order row matching the orders table schema.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct DbOrder {
    id: OrderId,
    client_account_id: AccountId,
    specialist_account_id: AccountId,
    gross_amount: Decimal,
    status: OrderStatus,
    commission_processed: bool,
    cashback_processed: bool,
    platform_revenue_id: Option<RevenueRecordId>,
    auto_confirm_at: Option<SqlxTs>,
    #[sqlx(try_from = "SqlxTs")]
    created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    updated_at: Timestamp,
}

impl From<DbOrder> for Order {
    fn from(db: DbOrder) -> Self {
        Order {
            id: db.id,
            client_account_id: db.client_account_id,
            specialist_account_id: db.specialist_account_id,
            gross_amount: db.gross_amount,
            status: db.status,
            commission_processed: db.commission_processed,
            cashback_processed: db.cashback_processed,
            platform_revenue_id: db.platform_revenue_id,
            auto_confirm_at: db.auto_confirm_at.map(SqlxTs::to_jiff),
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

/// Create an order in `paid`, debiting the client's points for the gross
/// amount in the same transaction. The gross amount is validated against the
/// commission policy so the eventual settlement cannot hit the floor error.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn create_order(
    client_account_id: &AccountId,
    specialist_account_id: &AccountId,
    gross_amount: Decimal,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Order, StoreError> {
    calculate_commission(gross_amount, config)?;

    let mut tx = pool.begin().await?;

    let order: Order = sqlx::query_as::<_, DbOrder>(
        r#"
        INSERT INTO orders (
            client_account_id,
            specialist_account_id,
            gross_amount,
            created_at,
            updated_at
        )
        VALUES ($1, $2, $3, $4, $4)
        RETURNING *
        "#,
    )
    .bind(client_account_id)
    .bind(specialist_account_id)
    .bind(gross_amount)
    .bind(time_source.now().to_sqlx())
    .fetch_one(&mut *tx)
    .await?
    .into();

    account::debit_tx(
        client_account_id,
        gross_amount,
        LedgerEntryType::Purchase,
        "Order payment",
        &Correlation::OrderPayment { order_id: order.id },
        time_source,
        &mut tx,
    )
    .await?;

    tx.commit().await?;

    Ok(order)
}

pub async fn get_order(order_id: &OrderId, pool: &PgPool) -> Result<Order, StoreError> {
    Ok(sqlx::query_as::<_, DbOrder>("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::OrderNotFound)?
        .into())
}

/// Conditionally move an order between statuses.
///
/// The `status = ANY(from)` predicate makes the check-and-set atomic: a
/// concurrent transition serializes on the row and the loser sees zero
/// affected rows, surfacing as [`StoreError::InvalidStatusTransition`].
async fn transition_tx(
    order_id: &OrderId,
    from: &[OrderStatus],
    to: OrderStatus,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<Order, StoreError> {
    // Callers narrow the graph per operation but must stay inside it.
    for status in from {
        debug_assert!(
            status.can_transition_to(to),
            "transition {status} -> {to} is not in the lifecycle graph"
        );
    }

    let moved = sqlx::query_as::<_, DbOrder>(
        r#"
        UPDATE orders
        SET status = $2, updated_at = $3
        WHERE id = $1 AND status = ANY($4)
        RETURNING *
        "#,
    )
    .bind(order_id)
    .bind(to)
    .bind(time_source.now().to_sqlx())
    .bind(from)
    .fetch_optional(&mut **tx)
    .await?;

    match moved {
        Some(db) => Ok(db.into()),
        None => {
            let current = sqlx::query_scalar::<_, OrderStatus>(
                "SELECT status FROM orders WHERE id = $1",
            )
            .bind(order_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::OrderNotFound)?;

            Err(StoreError::InvalidStatusTransition {
                from: current,
                to,
            })
        }
    }
}

/// `paid -> in_progress`: the specialist has started on the order.
pub async fn start_work(
    order_id: &OrderId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Order, StoreError> {
    let mut tx = pool.begin().await?;
    let order = transition_tx(
        order_id,
        &[OrderStatus::Paid],
        OrderStatus::InProgress,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;
    Ok(order)
}

/// `in_progress -> pending_completion`: the specialist reports the work
/// done. Starts the auto-confirm clock; non-response past the deadline is
/// treated as implicit confirmation by the scheduler.
pub async fn request_completion(
    order_id: &OrderId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Order, StoreError> {
    let mut tx = pool.begin().await?;
    let order = transition_tx(
        order_id,
        &[OrderStatus::InProgress],
        OrderStatus::PendingCompletion,
        time_source,
        &mut tx,
    )
    .await?;

    let deadline = time_source.now() + AUTO_CONFIRM_WINDOW;
    sqlx::query("UPDATE orders SET auto_confirm_at = $2 WHERE id = $1")
        .bind(order_id)
        .bind(deadline.to_sqlx())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Order {
        auto_confirm_at: Some(deadline),
        ..order
    })
}

/// `pending_completion -> completed` by explicit client confirmation.
/// The status write and the deferred commission settlement commit together.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn confirm_completion(
    order_id: &OrderId,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<SettlementReceipt, StoreError> {
    let mut tx = pool.begin().await?;
    transition_tx(
        order_id,
        &[OrderStatus::PendingCompletion],
        OrderStatus::Completed,
        time_source,
        &mut tx,
    )
    .await?;
    let receipt = settle_order_commission_tx(order_id, config, time_source, &mut tx).await?;
    tx.commit().await?;
    Ok(receipt)
}

/// Freeze settlement by moving the order to `disputed`. Allowed from
/// `paid`, `in_progress`, and `completed`.
pub async fn dispute_order(
    order_id: &OrderId,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Order, StoreError> {
    let mut tx = pool.begin().await?;
    let order = transition_tx(
        order_id,
        &[
            OrderStatus::Paid,
            OrderStatus::InProgress,
            OrderStatus::Completed,
        ],
        OrderStatus::Disputed,
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;
    Ok(order)
}

/// Resolve a dispute in the specialist's favor: `disputed -> completed`,
/// settling the commission unless it was already paid out before the
/// dispute was raised.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn resolve_dispute_completed(
    order_id: &OrderId,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Option<SettlementReceipt>, StoreError> {
    let mut tx = pool.begin().await?;
    let order = transition_tx(
        order_id,
        &[OrderStatus::Disputed],
        OrderStatus::Completed,
        time_source,
        &mut tx,
    )
    .await?;

    let receipt = if order.commission_processed {
        None
    } else {
        Some(settle_order_commission_tx(order_id, config, time_source, &mut tx).await?)
    };

    tx.commit().await?;
    Ok(receipt)
}

/// `paid -> cancelled`: no specialist payout. Refunds the client's debited
/// points to the durable balance, and claws back any cashback that was
/// already paid early, capped at what is left in the bonus pool.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn cancel_order(
    order_id: &OrderId,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Order, StoreError> {
    let mut tx = pool.begin().await?;
    let order = transition_tx(
        order_id,
        &[OrderStatus::Paid],
        OrderStatus::Cancelled,
        time_source,
        &mut tx,
    )
    .await?;

    let correlation = Correlation::OrderRefund { order_id: order.id };

    account::credit_tx(
        &order.client_account_id,
        BalanceType::Balance,
        order.gross_amount,
        LedgerEntryType::Refund,
        "Order cancelled, points refunded",
        &correlation,
        time_source,
        &mut tx,
    )
    .await?;

    if order.cashback_processed {
        let breakdown = calculate_commission(order.gross_amount, config)?;
        if breakdown.cashback > Decimal::ZERO {
            let clawed = account::claw_back_bonus_tx(
                &order.client_account_id,
                breakdown.cashback,
                "Cashback clawed back on cancellation",
                &correlation,
                time_source,
                &mut tx,
            )
            .await?;

            // Return whatever could be recovered to the platform account;
            // spent bonus points are absorbed.
            if let Some(entry) = clawed {
                let platform_id = super::platform_account_id_tx(&mut tx).await?;
                account::credit_tx(
                    &platform_id,
                    BalanceType::Balance,
                    -entry.amount_delta,
                    LedgerEntryType::CashbackClawback,
                    "Cashback recovered from cancelled order",
                    &correlation,
                    time_source,
                    &mut tx,
                )
                .await?;
            }
        }
    }

    tx.commit().await?;
    Ok(order)
}

/// Treat overdue `pending_completion` orders as implicitly confirmed,
/// settling each inside its own transaction. Uses `FOR UPDATE SKIP LOCKED`
/// so concurrent scheduler instances never double-settle an order.
///
/// Returns the number of orders confirmed. A failing order is logged and
/// left for the next sweep.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn auto_confirm_due_orders(
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<u64, StoreError> {
    let mut confirmed = 0;
    loop {
        let now = time_source.now();
        let mut tx = pool.begin().await?;

        let due = sqlx::query_as::<_, DbOrder>(
            r#"
            SELECT * FROM orders
            WHERE status = 'pending_completion' AND auto_confirm_at <= $1
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now.to_sqlx())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(due) = due else {
            break;
        };
        let order: Order = due.into();

        sqlx::query("UPDATE orders SET status = 'completed', updated_at = $2 WHERE id = $1")
            .bind(order.id)
            .bind(now.to_sqlx())
            .execute(&mut *tx)
            .await?;

        match settle_order_commission_tx(&order.id, config, time_source, &mut tx).await {
            Ok(_) => {
                tx.commit().await?;
                confirmed += 1;
                tracing::info!("Auto-confirmed order {}", order.id);
            }
            Err(e) => {
                // Roll back and leave the order due; the next tick retries.
                tracing::error!("Failed to settle auto-confirmed order {}: {e}", order.id);
                break;
            }
        }
    }

    Ok(confirmed)
}
