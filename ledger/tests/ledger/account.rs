//! Account primitives: bonus-first debits, expiry handling, and ledger
//! replayability.

use jiff::SignedDuration;
use ledger::store::{
    self, BalanceType, Correlation, LedgerEntryType, StoreError, account,
};
use rust_decimal::dec;
use test_helpers::spawn_ledger;

#[tokio::test]
async fn debit_draws_bonus_before_balance() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_funded_account(dec!(100)).await?;

    let mut tx = app.db_pool.begin().await?;
    account::credit_tx(
        &acct.id,
        BalanceType::BonusBalance,
        dec!(30),
        LedgerEntryType::Cashback,
        "test bonus",
        &Correlation::Deposit {
            account_id: acct.id,
        },
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    let mut tx = app.db_pool.begin().await?;
    let entries = account::debit_tx(
        &acct.id,
        dec!(50),
        LedgerEntryType::Purchase,
        "test debit",
        &Correlation::Deposit {
            account_id: acct.id,
        },
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    let acct = app.account(&acct.id).await?;
    assert_eq!(acct.bonus_balance, dec!(0));
    assert_eq!(acct.balance, dec!(80));

    // Bonus pool emptied first, remainder from the durable balance.
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].balance_type, BalanceType::BonusBalance);
    assert_eq!(entries[0].amount_delta, dec!(-30));
    assert_eq!(entries[1].balance_type, BalanceType::Balance);
    assert_eq!(entries[1].amount_delta, dec!(-20));
    Ok(())
}

#[tokio::test]
async fn debit_covered_by_one_pool_writes_one_entry() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_funded_account(dec!(100)).await?;

    let mut tx = app.db_pool.begin().await?;
    let entries = account::debit_tx(
        &acct.id,
        dec!(40),
        LedgerEntryType::Purchase,
        "test debit",
        &Correlation::Deposit {
            account_id: acct.id,
        },
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].balance_type, BalanceType::Balance);
    assert_eq!(entries[0].amount_delta, dec!(-40));
    Ok(())
}

#[tokio::test]
async fn debit_beyond_combined_balance_is_rejected() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_funded_account(dec!(10)).await?;

    let mut tx = app.db_pool.begin().await?;
    let result = account::debit_tx(
        &acct.id,
        dec!(10.01),
        LedgerEntryType::Purchase,
        "test debit",
        &Correlation::Deposit {
            account_id: acct.id,
        },
        &app.time_source,
        &mut tx,
    )
    .await;
    tx.rollback().await?;

    assert!(matches!(result, Err(StoreError::InsufficientFunds)));

    let acct = app.account(&acct.id).await?;
    assert_eq!(acct.balance, dec!(10));
    Ok(())
}

#[tokio::test]
async fn zero_and_negative_amounts_are_rejected() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_funded_account(dec!(10)).await?;

    let mut tx = app.db_pool.begin().await?;
    let correlation = Correlation::Deposit {
        account_id: acct.id,
    };
    let credit = account::credit_tx(
        &acct.id,
        BalanceType::Balance,
        dec!(0),
        LedgerEntryType::Deposit,
        "zero credit",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await;
    assert!(matches!(credit, Err(StoreError::AmountMustBePositive)));

    let debit = account::debit_tx(
        &acct.id,
        dec!(-5),
        LedgerEntryType::Purchase,
        "negative debit",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await;
    assert!(matches!(debit, Err(StoreError::AmountMustBePositive)));
    tx.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn bonus_credit_stamps_expiry_only_from_zero() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_user_account().await?;
    let correlation = Correlation::Deposit {
        account_id: acct.id,
    };

    let mut tx = app.db_pool.begin().await?;
    account::credit_tx(
        &acct.id,
        BalanceType::BonusBalance,
        dec!(5),
        LedgerEntryType::Cashback,
        "first bonus",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    let first_expiry = app.account(&acct.id).await?.bonus_expires_at;
    assert_eq!(
        first_expiry,
        Some(app.time_source.now() + account::BONUS_GRACE)
    );

    // A later credit while the pool is non-empty keeps the original clock.
    app.time_source.advance(SignedDuration::from_hours(24));
    let mut tx = app.db_pool.begin().await?;
    account::credit_tx(
        &acct.id,
        BalanceType::BonusBalance,
        dec!(5),
        LedgerEntryType::Cashback,
        "second bonus",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    assert_eq!(app.account(&acct.id).await?.bonus_expires_at, first_expiry);
    Ok(())
}

#[tokio::test]
async fn spending_bonus_to_zero_clears_expiry() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_user_account().await?;
    let correlation = Correlation::Deposit {
        account_id: acct.id,
    };

    let mut tx = app.db_pool.begin().await?;
    account::credit_tx(
        &acct.id,
        BalanceType::BonusBalance,
        dec!(5),
        LedgerEntryType::Cashback,
        "bonus",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await?;
    account::debit_tx(
        &acct.id,
        dec!(5),
        LedgerEntryType::Purchase,
        "spend bonus",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    let acct = app.account(&acct.id).await?;
    assert_eq!(acct.bonus_balance, dec!(0));
    assert_eq!(acct.bonus_expires_at, None);
    Ok(())
}

#[tokio::test]
async fn expiry_sweep_zeroes_overdue_bonus_pools() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_funded_account(dec!(20)).await?;
    let correlation = Correlation::Deposit {
        account_id: acct.id,
    };

    let mut tx = app.db_pool.begin().await?;
    account::credit_tx(
        &acct.id,
        BalanceType::BonusBalance,
        dec!(7.5),
        LedgerEntryType::Cashback,
        "bonus",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    // Not yet due.
    app.time_source.advance(SignedDuration::from_hours(6 * 24));
    assert_eq!(
        account::expire_due_bonuses(&app.db_pool, &app.time_source).await?,
        0
    );

    app.time_source.advance(SignedDuration::from_hours(25));
    assert_eq!(
        account::expire_due_bonuses(&app.db_pool, &app.time_source).await?,
        1
    );

    let acct = app.account(&acct.id).await?;
    assert_eq!(acct.bonus_balance, dec!(0));
    assert_eq!(acct.bonus_expires_at, None);
    // Durable points are untouched by expiry.
    assert_eq!(acct.balance, dec!(20));

    let entries = store::account_entries(&acct.id, 10, 0, &app.db_pool).await?;
    assert_eq!(entries[0].entry_type, LedgerEntryType::BonusExpiry);
    assert_eq!(entries[0].amount_delta, dec!(-7.5));

    // Sweep is idempotent.
    assert_eq!(
        account::expire_due_bonuses(&app.db_pool, &app.time_source).await?,
        0
    );
    Ok(())
}

#[tokio::test]
async fn ledger_replays_to_stored_balances() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let acct = app.create_funded_account(dec!(100)).await?;
    let correlation = Correlation::Deposit {
        account_id: acct.id,
    };

    let mut tx = app.db_pool.begin().await?;
    account::credit_tx(
        &acct.id,
        BalanceType::BonusBalance,
        dec!(12.5),
        LedgerEntryType::Cashback,
        "bonus",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await?;
    account::debit_tx(
        &acct.id,
        dec!(40),
        LedgerEntryType::Purchase,
        "spend",
        &correlation,
        &app.time_source,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    let acct = app.account(&acct.id).await?;
    let replayed_balance =
        store::replay_balance(&acct.id, BalanceType::Balance, &app.db_pool).await?;
    let replayed_bonus =
        store::replay_balance(&acct.id, BalanceType::BonusBalance, &app.db_pool).await?;
    assert_eq!(replayed_balance, acct.balance);
    assert_eq!(replayed_bonus, acct.bonus_balance);
    Ok(())
}
