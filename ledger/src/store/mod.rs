//! Database store for the points ledger.
//!
//! ## Design Decisions
//!
//! ### Transaction-scoped primitives
//! - Every balance-mutating primitive takes an active
//!   `sqlx::Transaction<'_, Postgres>` so the settlement orchestrator can
//!   compose several primitives into one atomic unit. Functions that open
//!   their own transaction are thin wrappers over the `_tx` variants.
//! - Account rows are locked with `SELECT ... FOR UPDATE` before any
//!   read-then-write, so concurrent debits against the same account cannot
//!   observe the same stale balance.
//!
//! ### Idempotency markers
//! - Settlement subjects carry `commission_processed` / `cashback_processed`
//!   flags. Recipes check-and-set them with a single conditional `UPDATE`
//!   whose affected-row count gates the recipe, closing the race window
//!   between two concurrent settlement attempts.
//!
//! ### Time Source Dependency
//! - Functions that need current time accept a `TimeSource` parameter
//!   instead of creating their own, so time can be mocked during tests.
//!
//! ### Type Safety
//! - All row identifiers are uuid newtypes implementing `sqlx::Type`, so
//!   they bind directly in queries without unwrapping the inner value.
//! - Ledger correlation payloads are a closed enum serialized to `jsonb`,
//!   not an untyped map.

use derive_more::Display;
use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::time::TimeSource;

pub mod account;
pub mod order;
pub mod settlement;

pub use order::{Order, OrderStatus};
pub use settlement::{LeadMagnetPurchase, PlatformRevenueRecord, SettlementReceipt};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type, FromRow,
)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type, FromRow,
)]
#[sqlx(transparent)]
pub struct AccountId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type, FromRow,
)]
#[sqlx(transparent)]
pub struct LedgerEntryId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type, FromRow,
)]
#[sqlx(transparent)]
pub struct PurchaseId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type, FromRow,
)]
#[sqlx(transparent)]
pub struct OrderId(pub Uuid);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize, sqlx::Type, FromRow,
)]
#[sqlx(transparent)]
pub struct RevenueRecordId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_owner_type", rename_all = "snake_case")]
pub enum AccountOwnerType {
    User,
    Platform,
}

/// Which of the two point pools a ledger entry touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "balance_type", rename_all = "snake_case")]
pub enum BalanceType {
    Balance,
    BonusBalance,
}

/// Business reason for a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ledger_entry_type", rename_all = "snake_case")]
pub enum LedgerEntryType {
    Deposit,
    SaleProceeds,
    Commission,
    Cashback,
    CashbackFunding,
    CashbackClawback,
    Purchase,
    Refund,
    BonusExpiry,
}

/// Who owns an account: a marketplace user (client or specialist) or the
/// single pre-provisioned platform system account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOwner {
    User(UserId),
    Platform,
}

impl AccountOwner {
    pub fn owner_type(&self) -> AccountOwnerType {
        match self {
            AccountOwner::User(_) => AccountOwnerType::User,
            AccountOwner::Platform => AccountOwnerType::Platform,
        }
    }

    pub fn owner_id(&self) -> Option<UserId> {
        match self {
            AccountOwner::User(user_id) => Some(*user_id),
            AccountOwner::Platform => None,
        }
    }

    pub fn from_parts(owner_type: AccountOwnerType, owner_id: Option<UserId>) -> Option<Self> {
        match (owner_type, owner_id) {
            (AccountOwnerType::User, Some(user_id)) => Some(AccountOwner::User(user_id)),
            (AccountOwnerType::Platform, None) => Some(AccountOwner::Platform),
            _ => None,
        }
    }
}

/// Structured correlation payload attached to every ledger entry, linking it
/// to the triggering business event. One closed variant per settlement
/// recipe rather than an untyped map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum Correlation {
    Deposit { account_id: AccountId },
    LeadMagnetPurchase { purchase_id: PurchaseId },
    OrderPayment { order_id: OrderId },
    OrderCashback { order_id: OrderId, client_account_id: AccountId },
    OrderCommission { order_id: OrderId },
    OrderRefund { order_id: OrderId },
    BonusExpiry { account_id: AccountId },
}

/// A user or platform account holding the two point pools.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub owner: AccountOwner,
    /// Durable points. Negative values represent debt; only the platform
    /// account is expected to ever go negative.
    pub balance: Decimal,
    /// Promotional points, always consumed before `balance`.
    pub bonus_balance: Decimal,
    /// Set when `bonus_balance` transitions from zero to positive, cleared
    /// when it returns to zero.
    pub bonus_expires_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Database-level account row matching the accounts table schema.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct DbAccount {
    id: AccountId,
    owner_type: AccountOwnerType,
    owner_id: Option<UserId>,
    balance: Decimal,
    bonus_balance: Decimal,
    bonus_expires_at: Option<SqlxTs>,
    #[sqlx(try_from = "SqlxTs")]
    created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    updated_at: Timestamp,
}

impl TryFrom<DbAccount> for Account {
    type Error = StoreError;

    fn try_from(db: DbAccount) -> Result<Self, Self::Error> {
        let owner = AccountOwner::from_parts(db.owner_type, db.owner_id)
            .ok_or(StoreError::InvalidAccountOwnership)?;

        Ok(Account {
            id: db.id,
            owner,
            balance: db.balance,
            bonus_balance: db.bonus_balance,
            bonus_expires_at: db.bonus_expires_at.map(SqlxTs::to_jiff),
            created_at: db.created_at,
            updated_at: db.updated_at,
        })
    }
}

/// Immutable, append-only record of a single balance mutation.
#[derive(Debug, Clone, FromRow)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub seq: i64,
    pub account_id: AccountId,
    pub entry_type: LedgerEntryType,
    pub balance_type: BalanceType,
    pub amount_delta: Decimal,
    pub balance_before: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub correlation: Json<Correlation>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Amount must be positive")]
    AmountMustBePositive,
    #[error("Gross amount {gross} cannot fund the minimum commission (minimum gross {min_gross})")]
    AmountTooSmall { gross: Decimal, min_gross: Decimal },
    #[error("Insufficient funds")]
    InsufficientFunds,
    #[error("Settlement already processed")]
    AlreadySettled,
    #[error("Balance invariant violation: {0}")]
    BalanceInvariantViolation(String),
    #[error("Account not found")]
    AccountNotFound,
    #[error("Platform account is not provisioned")]
    PlatformAccountMissing,
    #[error("Purchase not found")]
    PurchaseNotFound,
    #[error("Revenue record not found")]
    RevenueRecordNotFound,
    #[error("Order not found")]
    OrderNotFound,
    #[error("Invalid order status transition: {from} -> {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },
    #[error("Order cannot be settled in status {status}")]
    OrderNotSettleable { status: OrderStatus },
    #[error("Database invariant violation: invalid account ownership")]
    InvalidAccountOwnership,
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e
            && db_err.is_unique_violation()
        {
            return StoreError::NotUnique(e);
        }
        StoreError::Database(e)
    }
}

/// Create an account (transaction version).
pub async fn create_account_tx(
    owner: AccountOwner,
    time_source: &TimeSource,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<Account, StoreError> {
    let now = time_source.now();

    let db_account = sqlx::query_as::<_, DbAccount>(
        r#"
        INSERT INTO accounts (owner_type, owner_id, created_at, updated_at)
        VALUES ($1, $2, $3, $3)
        RETURNING *
        "#,
    )
    .bind(owner.owner_type())
    .bind(owner.owner_id())
    .bind(now.to_sqlx())
    .fetch_one(&mut **tx)
    .await?;

    db_account.try_into()
}

/// Create an account in its own transaction.
pub async fn create_account(
    owner: AccountOwner,
    pool: &PgPool,
    time_source: &TimeSource,
) -> Result<Account, StoreError> {
    let mut tx = pool.begin().await?;
    let account = create_account_tx(owner, time_source, &mut tx).await?;
    tx.commit().await?;
    Ok(account)
}

/// Get account by id.
pub async fn get_account_by_id(
    account_id: &AccountId,
    pool: &PgPool,
) -> Result<Account, StoreError> {
    let db_account = sqlx::query_as::<_, DbAccount>("SELECT * FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_optional(pool)
        .await?
        .ok_or(StoreError::AccountNotFound)?;

    db_account.try_into()
}

/// Get account by owner.
pub async fn get_account(owner: AccountOwner, pool: &PgPool) -> Result<Account, StoreError> {
    let db_account = sqlx::query_as::<_, DbAccount>(
        r#"
        SELECT * FROM accounts
        WHERE owner_type = $1
          AND owner_id IS NOT DISTINCT FROM $2
        "#,
    )
    .bind(owner.owner_type())
    .bind(owner.owner_id())
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::AccountNotFound)?;

    db_account.try_into()
}

/// Get account by id and lock its row for update.
///
/// Locks the account using SELECT FOR UPDATE, preventing concurrent
/// modifications until the transaction commits. Must be called inside a
/// transaction; every read-then-write balance mutation goes through this.
pub(crate) async fn get_account_for_update_tx(
    account_id: &AccountId,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<Account, StoreError> {
    let db_account =
        sqlx::query_as::<_, DbAccount>("SELECT * FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(account_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(StoreError::AccountNotFound)?;

    db_account.try_into()
}

/// Get the platform system account.
///
/// The platform account is pre-provisioned; its absence is a configuration
/// error surfaced at startup, not a per-request condition.
pub async fn platform_account(pool: &PgPool) -> Result<Account, StoreError> {
    let db_account = sqlx::query_as::<_, DbAccount>(
        "SELECT * FROM accounts WHERE owner_type = 'platform'",
    )
    .fetch_optional(pool)
    .await?
    .ok_or(StoreError::PlatformAccountMissing)?;

    db_account.try_into()
}

/// Get the platform account id within a transaction, without locking it.
/// The row is locked later by the credit/debit primitive that touches it.
pub(crate) async fn platform_account_id_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<AccountId, StoreError> {
    sqlx::query_scalar::<_, AccountId>("SELECT id FROM accounts WHERE owner_type = 'platform'")
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StoreError::PlatformAccountMissing)
}

/// List ledger entries for an account, newest first.
pub async fn account_entries(
    account_id: &AccountId,
    limit: i64,
    offset: i64,
    pool: &PgPool,
) -> Result<Vec<LedgerEntry>, StoreError> {
    Ok(sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE account_id = $1
        ORDER BY seq DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(account_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?)
}

/// Recompute an account balance by replaying its ledger entries in order.
///
/// Verifies the before/after chain at every prefix: each entry's
/// `balance_before` must equal the running sum so far and its
/// `balance_after` must equal the running sum plus its delta. Returns the
/// final replayed balance; a broken chain is a
/// [`StoreError::BalanceInvariantViolation`].
pub async fn replay_balance(
    account_id: &AccountId,
    balance_type: BalanceType,
    pool: &PgPool,
) -> Result<Decimal, StoreError> {
    let entries = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE account_id = $1 AND balance_type = $2
        ORDER BY seq
        "#,
    )
    .bind(account_id)
    .bind(balance_type)
    .fetch_all(pool)
    .await?;

    let mut running = Decimal::ZERO;
    for entry in entries {
        if entry.balance_before != running {
            return Err(StoreError::BalanceInvariantViolation(format!(
                "entry {} expected balance_before {running}, found {}",
                entry.id, entry.balance_before
            )));
        }
        running += entry.amount_delta;
        if entry.balance_after != running {
            return Err(StoreError::BalanceInvariantViolation(format!(
                "entry {} expected balance_after {running}, found {}",
                entry.id, entry.balance_after
            )));
        }
    }

    Ok(running)
}
