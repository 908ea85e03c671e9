//! Account balance primitives.
//!
//! Credit and debit are the only paths that mutate balances. Both run inside
//! a caller-supplied transaction, lock the account row first, and append one
//! ledger entry per pool touched, so the entry stream replays to the stored
//! balance at every prefix.
//!
//! Debits draw from `bonus_balance` before `balance`: promotional points are
//! time-limited, so they are consumed first.

use jiff::SignedDuration;
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::types::Json;

use super::{
    AccountId, BalanceType, Correlation, LedgerEntry, LedgerEntryType, StoreError,
    get_account_for_update_tx,
};
use crate::time::TimeSource;

/// Grace period granted when a zero bonus balance becomes positive.
pub const BONUS_GRACE: SignedDuration = SignedDuration::from_hours(7 * 24);

/// Append a ledger entry row. `balance_after` is derived here so the
/// database check constraint and the replay chain always agree.
async fn append_entry_tx(
    account_id: &AccountId,
    entry_type: LedgerEntryType,
    balance_type: BalanceType,
    amount_delta: Decimal,
    balance_before: Decimal,
    description: &str,
    correlation: &Correlation,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<LedgerEntry, StoreError> {
    use jiff_sqlx::ToSqlx;

    Ok(sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO ledger_entries (
            account_id,
            entry_type,
            balance_type,
            amount_delta,
            balance_before,
            balance_after,
            description,
            correlation,
            created_at
        )
        VALUES ($1, $2, $3, $4, $5, $5 + $4, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(account_id)
    .bind(entry_type)
    .bind(balance_type)
    .bind(amount_delta)
    .bind(balance_before)
    .bind(description)
    .bind(Json(correlation))
    .bind(time_source.now().to_sqlx())
    .fetch_one(&mut **tx)
    .await?)
}

/// Credit an account pool.
///
/// Requires `amount > 0`. When crediting `bonus_balance` and the prior bonus
/// balance was zero, stamps `bonus_expires_at` with now + [`BONUS_GRACE`].
pub async fn credit_tx(
    account_id: &AccountId,
    balance_type: BalanceType,
    amount: Decimal,
    entry_type: LedgerEntryType,
    description: &str,
    correlation: &Correlation,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<LedgerEntry, StoreError> {
    use jiff_sqlx::ToSqlx;

    if amount <= Decimal::ZERO {
        return Err(StoreError::AmountMustBePositive);
    }

    let account = get_account_for_update_tx(account_id, tx).await?;
    let now = time_source.now();

    match balance_type {
        BalanceType::Balance => {
            sqlx::query("UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1")
                .bind(account_id)
                .bind(account.balance + amount)
                .bind(now.to_sqlx())
                .execute(&mut **tx)
                .await?;

            append_entry_tx(
                account_id,
                entry_type,
                balance_type,
                amount,
                account.balance,
                description,
                correlation,
                time_source,
                tx,
            )
            .await
        }
        BalanceType::BonusBalance => {
            // A zero-to-positive transition starts the expiry clock; further
            // credits while the pool is non-empty do not extend it.
            let expires_at = if account.bonus_balance == Decimal::ZERO {
                Some(now + BONUS_GRACE)
            } else {
                account.bonus_expires_at
            };

            sqlx::query(
                "UPDATE accounts
                SET bonus_balance = $2, bonus_expires_at = $3, updated_at = $4
                WHERE id = $1",
            )
            .bind(account_id)
            .bind(account.bonus_balance + amount)
            .bind(expires_at.map(|t| t.to_sqlx()))
            .bind(now.to_sqlx())
            .execute(&mut **tx)
            .await?;

            append_entry_tx(
                account_id,
                entry_type,
                balance_type,
                amount,
                account.bonus_balance,
                description,
                correlation,
                time_source,
                tx,
            )
            .await
        }
    }
}

/// Top up an account's durable balance from an external payment.
pub async fn deposit(
    account_id: &AccountId,
    amount: Decimal,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<LedgerEntry, StoreError> {
    let mut tx = pool.begin().await?;
    let entry = credit_tx(
        account_id,
        BalanceType::Balance,
        amount,
        LedgerEntryType::Deposit,
        "Points deposit",
        &Correlation::Deposit {
            account_id: *account_id,
        },
        time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;
    Ok(entry)
}

/// Debit an account, drawing from the bonus pool first.
///
/// Requires `amount > 0`. Fails with [`StoreError::InsufficientFunds`] when
/// `balance + bonus_balance < amount`. Produces one ledger entry when a
/// single pool covers the amount, two when both pools are touched; all
/// entries carry the caller's correlation payload.
pub async fn debit_tx(
    account_id: &AccountId,
    amount: Decimal,
    entry_type: LedgerEntryType,
    description: &str,
    correlation: &Correlation,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<Vec<LedgerEntry>, StoreError> {
    use jiff_sqlx::ToSqlx;

    if amount <= Decimal::ZERO {
        return Err(StoreError::AmountMustBePositive);
    }

    let account = get_account_for_update_tx(account_id, tx).await?;
    if account.balance + account.bonus_balance < amount {
        return Err(StoreError::InsufficientFunds);
    }

    let now = time_source.now();
    let mut entries = Vec::with_capacity(2);

    let bonus_draw = account.bonus_balance.min(amount);
    if bonus_draw > Decimal::ZERO {
        let bonus_after = account.bonus_balance - bonus_draw;
        let expires_at = if bonus_after == Decimal::ZERO {
            None
        } else {
            account.bonus_expires_at
        };

        sqlx::query(
            "UPDATE accounts
            SET bonus_balance = $2, bonus_expires_at = $3, updated_at = $4
            WHERE id = $1",
        )
        .bind(account_id)
        .bind(bonus_after)
        .bind(expires_at.map(|t| t.to_sqlx()))
        .bind(now.to_sqlx())
        .execute(&mut **tx)
        .await?;

        entries.push(
            append_entry_tx(
                account_id,
                entry_type,
                BalanceType::BonusBalance,
                -bonus_draw,
                account.bonus_balance,
                description,
                correlation,
                time_source,
                tx,
            )
            .await?,
        );
    }

    let remainder = amount - bonus_draw;
    if remainder > Decimal::ZERO {
        sqlx::query("UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1")
            .bind(account_id)
            .bind(account.balance - remainder)
            .bind(now.to_sqlx())
            .execute(&mut **tx)
            .await?;

        entries.push(
            append_entry_tx(
                account_id,
                entry_type,
                BalanceType::Balance,
                -remainder,
                account.balance,
                description,
                correlation,
                time_source,
                tx,
            )
            .await?,
        );
    }

    Ok(entries)
}

/// Debit the durable balance only, never the bonus pool.
///
/// Used for the platform account, which funds cashback from durable points.
/// With `allow_negative` the debit proceeds even when it pushes the balance
/// below zero; the resulting deficit is logged for operators.
pub(crate) async fn debit_durable_tx(
    account_id: &AccountId,
    amount: Decimal,
    entry_type: LedgerEntryType,
    description: &str,
    correlation: &Correlation,
    allow_negative: bool,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<LedgerEntry, StoreError> {
    use jiff_sqlx::ToSqlx;

    if amount <= Decimal::ZERO {
        return Err(StoreError::AmountMustBePositive);
    }

    let account = get_account_for_update_tx(account_id, tx).await?;
    let after = account.balance - amount;

    if after < Decimal::ZERO {
        if !allow_negative {
            return Err(StoreError::InsufficientFunds);
        }
        tracing::warn!(
            "account {} balance going negative: {after} after debit of {amount}",
            account.id
        );
    }

    sqlx::query("UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1")
        .bind(account_id)
        .bind(after)
        .bind(time_source.now().to_sqlx())
        .execute(&mut **tx)
        .await?;

    append_entry_tx(
        account_id,
        entry_type,
        BalanceType::Balance,
        -amount,
        account.balance,
        description,
        correlation,
        time_source,
        tx,
    )
    .await
}

/// Claw back up to `cap` points from the bonus pool.
///
/// Draws `min(bonus_balance, cap)`; already-spent bonus points are absorbed
/// by the platform. Returns `None` when there is nothing left to claw back.
pub(crate) async fn claw_back_bonus_tx(
    account_id: &AccountId,
    cap: Decimal,
    description: &str,
    correlation: &Correlation,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<Option<LedgerEntry>, StoreError> {
    use jiff_sqlx::ToSqlx;

    if cap <= Decimal::ZERO {
        return Err(StoreError::AmountMustBePositive);
    }

    let account = get_account_for_update_tx(account_id, tx).await?;
    let draw = account.bonus_balance.min(cap);
    if draw == Decimal::ZERO {
        return Ok(None);
    }

    let bonus_after = account.bonus_balance - draw;
    let expires_at = if bonus_after == Decimal::ZERO {
        None
    } else {
        account.bonus_expires_at
    };

    sqlx::query(
        "UPDATE accounts
        SET bonus_balance = $2, bonus_expires_at = $3, updated_at = $4
        WHERE id = $1",
    )
    .bind(account_id)
    .bind(bonus_after)
    .bind(expires_at.map(|t| t.to_sqlx()))
    .bind(time_source.now().to_sqlx())
    .execute(&mut **tx)
    .await?;

    Ok(Some(
        append_entry_tx(
            account_id,
            LedgerEntryType::CashbackClawback,
            BalanceType::BonusBalance,
            -draw,
            account.bonus_balance,
            description,
            correlation,
            time_source,
            tx,
        )
        .await?,
    ))
}

/// Zero out bonus balances whose expiry has passed.
///
/// Processes one account per transaction with `FOR UPDATE SKIP LOCKED` so
/// concurrent sweeps never double-expire a pool. Returns the number of
/// accounts expired.
#[tracing::instrument(skip(pool, time_source))]
pub async fn expire_due_bonuses(
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<u64, StoreError> {
    use jiff_sqlx::ToSqlx;

    let mut expired = 0;
    loop {
        let now = time_source.now();
        let mut tx = pool.begin().await?;

        let account = sqlx::query_as::<_, super::DbAccount>(
            r#"
            SELECT * FROM accounts
            WHERE bonus_expires_at <= $1 AND bonus_balance > 0
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now.to_sqlx())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(account) = account else {
            break;
        };
        let account: super::Account = account.try_into()?;

        sqlx::query(
            "UPDATE accounts
            SET bonus_balance = 0, bonus_expires_at = NULL, updated_at = $2
            WHERE id = $1",
        )
        .bind(account.id)
        .bind(now.to_sqlx())
        .execute(&mut *tx)
        .await?;

        append_entry_tx(
            &account.id,
            LedgerEntryType::BonusExpiry,
            BalanceType::BonusBalance,
            -account.bonus_balance,
            account.bonus_balance,
            "Bonus points expired",
            &Correlation::BonusExpiry {
                account_id: account.id,
            },
            time_source,
            &mut tx,
        )
        .await?;

        tx.commit().await?;
        expired += 1;
    }

    if expired > 0 {
        tracing::info!("Expired bonus balances on {expired} accounts");
    }
    Ok(expired)
}
