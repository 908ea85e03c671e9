//! Settlement recipes.
//!
//! Each recipe is a fixed sequence of ledger writes executed inside a single
//! transaction: all of it applies or none of it does. Idempotency is
//! enforced by the processed-flag check-and-set performed as one conditional
//! `UPDATE` inside that same transaction, so two concurrent attempts against
//! the same subject serialize on the row and exactly one proceeds.
//!
//! Within a recipe, accounts are locked in a fixed role order (specialist,
//! platform, client). Concurrent recipes whose participants hold swapped
//! roles can still deadlock on account rows; Postgres aborts one of the
//! transactions, and the aborted call is safe to retry because the
//! check-and-set runs again from scratch.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

use super::{
    AccountId, BalanceType, Correlation, LedgerEntryType, PurchaseId, RevenueRecordId,
    StoreError, account, platform_account_id_tx,
};
use crate::commission::{CommissionBreakdown, CommissionConfig, calculate_commission};
use crate::time::TimeSource;

/// A client's one-off purchase of a specialist's lead magnet.
#[derive(Debug, Clone, FromRow)]
pub struct LeadMagnetPurchase {
    pub id: PurchaseId,
    pub client_account_id: AccountId,
    pub specialist_account_id: AccountId,
    pub gross_amount: Decimal,
    pub commission_processed: bool,
    pub cashback_processed: bool,
    pub platform_revenue_id: Option<RevenueRecordId>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

/// Immutable record of the platform's take from one settlement.
#[derive(Debug, Clone, FromRow)]
pub struct PlatformRevenueRecord {
    pub id: RevenueRecordId,
    pub client_account_id: AccountId,
    pub specialist_account_id: AccountId,
    pub commission_amount: Decimal,
    pub cashback_amount: Decimal,
    pub net_revenue: Decimal,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

/// What a settlement call distributed.
///
/// `revenue_record_id` is `None` for the cashback-only half of an order
/// settlement; the revenue record is created by the commission half.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReceipt {
    pub breakdown: CommissionBreakdown,
    pub revenue_record_id: Option<RevenueRecordId>,
}

/// Create a lead-magnet purchase, debiting the client's points.
///
/// The gross amount is validated against the commission policy up front so a
/// purchase that could never settle is rejected at creation.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn create_lead_magnet_purchase(
    client_account_id: &AccountId,
    specialist_account_id: &AccountId,
    gross_amount: Decimal,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LeadMagnetPurchase, StoreError> {
    calculate_commission(gross_amount, config)?;

    let mut tx = pool.begin().await?;

    let purchase = sqlx::query_as::<_, LeadMagnetPurchase>(
        r#"
        INSERT INTO lead_magnet_purchases (
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
    .await?;

    account::debit_tx(
        client_account_id,
        gross_amount,
        LedgerEntryType::Purchase,
        "Lead magnet purchase",
        &Correlation::LeadMagnetPurchase {
            purchase_id: purchase.id,
        },
        time_source,
        &mut tx,
    )
    .await?;

    tx.commit().await?;

    Ok(purchase)
}

/// Recipe A: settle a finalized lead-magnet purchase.
///
/// Pays the specialist, books the commission, pays the client's cashback
/// from the platform account, records platform revenue, and marks both
/// processed flags, all in one transaction. A second call returns
/// [`StoreError::AlreadySettled`], which callers treat as a no-op success.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn settle_lead_magnet_purchase(
    purchase_id: &PurchaseId,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<SettlementReceipt, StoreError> {
    let mut tx = pool.begin().await?;
    let now = time_source.now();

    let purchase = sqlx::query_as::<_, LeadMagnetPurchase>(
        r#"
        UPDATE lead_magnet_purchases
        SET commission_processed = true, cashback_processed = true, updated_at = $2
        WHERE id = $1
          AND NOT commission_processed
          AND NOT cashback_processed
        RETURNING *
        "#,
    )
    .bind(purchase_id)
    .bind(now.to_sqlx())
    .fetch_optional(&mut *tx)
    .await?;

    let Some(purchase) = purchase else {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM lead_magnet_purchases WHERE id = $1)",
        )
        .bind(purchase_id)
        .fetch_one(&mut *tx)
        .await?;
        return Err(if exists {
            StoreError::AlreadySettled
        } else {
            StoreError::PurchaseNotFound
        });
    };

    let breakdown = calculate_commission(purchase.gross_amount, config)?;
    let platform_id = platform_account_id_tx(&mut tx).await?;
    let correlation = Correlation::LeadMagnetPurchase {
        purchase_id: purchase.id,
    };

    if breakdown.specialist_amount > Decimal::ZERO {
        account::credit_tx(
            &purchase.specialist_account_id,
            BalanceType::Balance,
            breakdown.specialist_amount,
            LedgerEntryType::SaleProceeds,
            "Lead magnet sale proceeds",
            &correlation,
            time_source,
            &mut tx,
        )
        .await?;
    }

    account::credit_tx(
        &platform_id,
        BalanceType::Balance,
        breakdown.commission,
        LedgerEntryType::Commission,
        "Lead magnet commission",
        &correlation,
        time_source,
        &mut tx,
    )
    .await?;

    if breakdown.cashback > Decimal::ZERO {
        account::credit_tx(
            &purchase.client_account_id,
            BalanceType::BonusBalance,
            breakdown.cashback,
            LedgerEntryType::Cashback,
            "Lead magnet cashback",
            &correlation,
            time_source,
            &mut tx,
        )
        .await?;

        // The platform funds the cashback it just paid out, from durable
        // balance only; a resulting deficit is tolerated and logged.
        account::debit_durable_tx(
            &platform_id,
            breakdown.cashback,
            LedgerEntryType::CashbackFunding,
            "Cashback funding for lead magnet purchase",
            &correlation,
            true,
            time_source,
            &mut tx,
        )
        .await?;
    }

    let record = create_revenue_record_tx(
        &purchase.client_account_id,
        &purchase.specialist_account_id,
        &breakdown,
        time_source,
        &mut tx,
    )
    .await?;

    sqlx::query("UPDATE lead_magnet_purchases SET platform_revenue_id = $2 WHERE id = $1")
        .bind(purchase.id)
        .bind(record.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(SettlementReceipt {
        breakdown,
        revenue_record_id: Some(record.id),
    })
}

/// Recipe B, early half: pay the client's cashback for an order.
///
/// Invoked at order payment time; the commission/specialist payout is
/// deferred to completion. Carries its own idempotency flag so it can be
/// retried independently of the commission half.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn settle_order_cashback(
    order_id: &super::OrderId,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<SettlementReceipt, StoreError> {
    let mut tx = pool.begin().await?;
    let now = time_source.now();

    let order = sqlx::query_as::<_, super::order::DbOrder>(
        r#"
        UPDATE orders
        SET cashback_processed = true, updated_at = $2
        WHERE id = $1
          AND NOT cashback_processed
          AND status NOT IN ('cancelled', 'disputed')
        RETURNING *
        "#,
    )
    .bind(order_id)
    .bind(now.to_sqlx())
    .fetch_optional(&mut *tx)
    .await?;

    let Some(order) = order else {
        return Err(order_settlement_refusal(order_id, SettlementHalf::Cashback, &mut tx).await?);
    };
    let order: super::order::Order = order.into();

    let breakdown = calculate_commission(order.gross_amount, config)?;

    if breakdown.cashback > Decimal::ZERO {
        let platform_id = platform_account_id_tx(&mut tx).await?;
        let correlation = Correlation::OrderCashback {
            order_id: order.id,
            client_account_id: order.client_account_id,
        };

        account::credit_tx(
            &order.client_account_id,
            BalanceType::BonusBalance,
            breakdown.cashback,
            LedgerEntryType::Cashback,
            "Order cashback",
            &correlation,
            time_source,
            &mut tx,
        )
        .await?;

        account::debit_durable_tx(
            &platform_id,
            breakdown.cashback,
            LedgerEntryType::CashbackFunding,
            "Cashback funding for order",
            &correlation,
            true,
            time_source,
            &mut tx,
        )
        .await?;
    }

    tx.commit().await?;

    Ok(SettlementReceipt {
        breakdown,
        revenue_record_id: None,
    })
}

/// Recipe B, deferred half: pay the specialist and book the commission once
/// an order is completed. Opens its own transaction; state-machine
/// transitions that settle atomically use [`settle_order_commission_tx`].
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn settle_order_commission(
    order_id: &super::OrderId,
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<SettlementReceipt, StoreError> {
    let mut tx = pool.begin().await?;
    let receipt = settle_order_commission_tx(order_id, config, time_source, &mut tx).await?;
    tx.commit().await?;
    Ok(receipt)
}

/// Transaction-scoped body of the deferred commission settlement, so a
/// status transition into `completed` and the payout commit together.
pub(crate) async fn settle_order_commission_tx(
    order_id: &super::OrderId,
    config: &CommissionConfig,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<SettlementReceipt, StoreError> {
    let now = time_source.now();

    let order = sqlx::query_as::<_, super::order::DbOrder>(
        r#"
        UPDATE orders
        SET commission_processed = true, updated_at = $2
        WHERE id = $1
          AND NOT commission_processed
          AND status = 'completed'
        RETURNING *
        "#,
    )
    .bind(order_id)
    .bind(now.to_sqlx())
    .fetch_optional(&mut **tx)
    .await?;

    let Some(order) = order else {
        return Err(order_settlement_refusal(order_id, SettlementHalf::Commission, tx).await?);
    };
    let order: super::order::Order = order.into();

    let breakdown = calculate_commission(order.gross_amount, config)?;
    let platform_id = platform_account_id_tx(tx).await?;
    let correlation = Correlation::OrderCommission { order_id: order.id };

    if breakdown.specialist_amount > Decimal::ZERO {
        account::credit_tx(
            &order.specialist_account_id,
            BalanceType::Balance,
            breakdown.specialist_amount,
            LedgerEntryType::SaleProceeds,
            "Order completion proceeds",
            &correlation,
            time_source,
            tx,
        )
        .await?;
    }

    account::credit_tx(
        &platform_id,
        BalanceType::Balance,
        breakdown.commission,
        LedgerEntryType::Commission,
        "Order commission",
        &correlation,
        time_source,
        tx,
    )
    .await?;

    let record = create_revenue_record_tx(
        &order.client_account_id,
        &order.specialist_account_id,
        &breakdown,
        time_source,
        tx,
    )
    .await?;

    sqlx::query("UPDATE orders SET platform_revenue_id = $2 WHERE id = $1")
        .bind(order.id)
        .bind(record.id)
        .execute(&mut **tx)
        .await?;

    Ok(SettlementReceipt {
        breakdown,
        revenue_record_id: Some(record.id),
    })
}

enum SettlementHalf {
    Cashback,
    Commission,
}

/// Work out why a conditional settlement update matched no row.
async fn order_settlement_refusal(
    order_id: &super::OrderId,
    half: SettlementHalf,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<StoreError, StoreError> {
    let order = sqlx::query_as::<_, super::order::DbOrder>("SELECT * FROM orders WHERE id = $1")
        .bind(order_id)
        .fetch_optional(&mut **tx)
        .await?;

    let Some(order) = order else {
        return Ok(StoreError::OrderNotFound);
    };
    let order: super::order::Order = order.into();

    let processed = match half {
        SettlementHalf::Cashback => order.cashback_processed,
        SettlementHalf::Commission => order.commission_processed,
    };

    Ok(if processed {
        StoreError::AlreadySettled
    } else {
        StoreError::OrderNotSettleable {
            status: order.status,
        }
    })
}

/// Insert the immutable platform revenue record for a settlement.
async fn create_revenue_record_tx(
    client_account_id: &AccountId,
    specialist_account_id: &AccountId,
    breakdown: &CommissionBreakdown,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<PlatformRevenueRecord, StoreError> {
    Ok(sqlx::query_as::<_, PlatformRevenueRecord>(
        r#"
        INSERT INTO platform_revenue_records (
            client_account_id,
            specialist_account_id,
            commission_amount,
            cashback_amount,
            net_revenue,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(client_account_id)
    .bind(specialist_account_id)
    .bind(breakdown.commission)
    .bind(breakdown.cashback)
    .bind(breakdown.net_revenue)
    .bind(time_source.now().to_sqlx())
    .fetch_one(&mut **tx)
    .await?)
}

/// Look up a revenue record (audit views, tests).
pub async fn get_revenue_record(
    id: &RevenueRecordId,
    pool: &PgPool,
) -> Result<PlatformRevenueRecord, StoreError> {
    sqlx::query_as::<_, PlatformRevenueRecord>(
        "SELECT * FROM platform_revenue_records WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::RevenueRecordNotFound)
}

/// Fetch a purchase row (audit views, tests).
pub async fn get_lead_magnet_purchase(
    id: &PurchaseId,
    pool: &PgPool,
) -> Result<LeadMagnetPurchase, StoreError> {
    sqlx::query_as::<_, LeadMagnetPurchase>("SELECT * FROM lead_magnet_purchases WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::PurchaseNotFound)
}
