//! Lead-magnet purchase settlement: the single-transaction recipe that pays
//! the specialist, books the commission, and pays cashback.

use ledger::store::{
    StoreError,
    settlement::{
        create_lead_magnet_purchase, get_lead_magnet_purchase, get_revenue_record,
        settle_lead_magnet_purchase,
    },
};
use rust_decimal::dec;
use test_helpers::spawn_ledger;

#[tokio::test]
async fn purchase_debits_client_up_front() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let client = app.create_funded_account(dec!(150)).await?;
    let specialist = app.create_user_account().await?;

    let purchase = create_lead_magnet_purchase(
        &client.id,
        &specialist.id,
        dec!(100),
        &app.config,
        &app.db_pool,
        &app.time_source,
    )
    .await?;

    assert!(!purchase.commission_processed);
    assert!(!purchase.cashback_processed);
    assert_eq!(app.account(&client.id).await?.balance, dec!(50));
    // Nothing is paid out until settlement.
    assert_eq!(app.account(&specialist.id).await?.balance, dec!(0));
    Ok(())
}

#[tokio::test]
async fn purchase_below_minimum_gross_is_rejected() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let client = app.create_funded_account(dec!(10)).await?;
    let specialist = app.create_user_account().await?;

    let result = create_lead_magnet_purchase(
        &client.id,
        &specialist.id,
        dec!(0.1),
        &app.config,
        &app.db_pool,
        &app.time_source,
    )
    .await;

    assert!(matches!(result, Err(StoreError::AmountTooSmall { .. })));
    assert_eq!(app.account(&client.id).await?.balance, dec!(10));
    Ok(())
}

#[tokio::test]
async fn settlement_distributes_all_components() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.fund_platform(dec!(10)).await?;
    let client = app.create_funded_account(dec!(100)).await?;
    let specialist = app.create_user_account().await?;

    let purchase = create_lead_magnet_purchase(
        &client.id,
        &specialist.id,
        dec!(100),
        &app.config,
        &app.db_pool,
        &app.time_source,
    )
    .await?;

    let receipt = settle_lead_magnet_purchase(
        &purchase.id,
        &app.config,
        &app.db_pool,
        &app.time_source,
    )
    .await?;

    assert_eq!(receipt.breakdown.commission, dec!(5.00));
    assert_eq!(receipt.breakdown.cashback, dec!(2.500));
    assert_eq!(receipt.breakdown.specialist_amount, dec!(95.00));

    let specialist = app.account(&specialist.id).await?;
    assert_eq!(specialist.balance, dec!(95.00));

    // Commission in, cashback funding out.
    let platform = app.platform_account().await?;
    assert_eq!(platform.balance, dec!(12.500));

    let client = app.account(&client.id).await?;
    assert_eq!(client.balance, dec!(0));
    assert_eq!(client.bonus_balance, dec!(2.500));
    assert!(client.bonus_expires_at.is_some());

    let record =
        get_revenue_record(&receipt.revenue_record_id.unwrap(), &app.db_pool).await?;
    assert_eq!(record.commission_amount, dec!(5.00));
    assert_eq!(record.cashback_amount, dec!(2.500));
    assert_eq!(record.net_revenue, dec!(2.500));

    let purchase = get_lead_magnet_purchase(&purchase.id, &app.db_pool).await?;
    assert!(purchase.commission_processed);
    assert!(purchase.cashback_processed);
    assert_eq!(purchase.platform_revenue_id, receipt.revenue_record_id);
    Ok(())
}

#[tokio::test]
async fn settlement_is_idempotent() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.fund_platform(dec!(10)).await?;
    let client = app.create_funded_account(dec!(100)).await?;
    let specialist = app.create_user_account().await?;

    let purchase = create_lead_magnet_purchase(
        &client.id,
        &specialist.id,
        dec!(100),
        &app.config,
        &app.db_pool,
        &app.time_source,
    )
    .await?;

    settle_lead_magnet_purchase(&purchase.id, &app.config, &app.db_pool, &app.time_source)
        .await?;
    let second =
        settle_lead_magnet_purchase(&purchase.id, &app.config, &app.db_pool, &app.time_source)
            .await;

    assert!(matches!(second, Err(StoreError::AlreadySettled)));
    assert_eq!(app.account(&specialist.id).await?.balance, dec!(95.00));
    assert_eq!(app.account(&client.id).await?.bonus_balance, dec!(2.500));
    Ok(())
}

#[tokio::test]
async fn concurrent_settlement_attempts_pay_once() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.fund_platform(dec!(10)).await?;
    let client = app.create_funded_account(dec!(100)).await?;
    let specialist = app.create_user_account().await?;

    let purchase = create_lead_magnet_purchase(
        &client.id,
        &specialist.id,
        dec!(100),
        &app.config,
        &app.db_pool,
        &app.time_source,
    )
    .await?;

    let (a, b) = tokio::join!(
        settle_lead_magnet_purchase(
            &purchase.id,
            &app.config,
            &app.db_pool,
            &app.time_source
        ),
        settle_lead_magnet_purchase(
            &purchase.id,
            &app.config,
            &app.db_pool,
            &app.time_source
        ),
    );

    // Exactly one attempt wins; the other sees the processed flags.
    let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(successes, 1);
    assert_eq!(app.account(&specialist.id).await?.balance, dec!(95.00));
    assert_eq!(app.account(&client.id).await?.bonus_balance, dec!(2.500));
    Ok(())
}

#[tokio::test]
async fn settling_missing_purchase_is_not_found() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    let result = settle_lead_magnet_purchase(
        &ledger::store::PurchaseId(uuid::Uuid::new_v4()),
        &app.config,
        &app.db_pool,
        &app.time_source,
    )
    .await;

    assert!(matches!(result, Err(StoreError::PurchaseNotFound)));
    Ok(())
}
