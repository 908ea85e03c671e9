//! Top-level orchestration of time-based triggers.
//!
//! Two deadlines drive background work:
//!
//! ```text
//! order reported done          auto_confirm_at
//!        v                           v
//! |------|---------------------------| orders still in pending_completion
//!                                      past the deadline are treated as
//!                                      confirmed and their commission
//!                                      half settles
//!
//! bonus credited               bonus_expires_at
//!        v                           v
//! |------|---------------------------| unspent bonus balances past the
//!                                      deadline are zeroed out
//! ```
//!
//! Each tick processes due rows one per transaction with
//! `FOR UPDATE SKIP LOCKED`, so multiple scheduler instances can run
//! concurrently without double-processing.

use sqlx::PgPool;
use std::time::Duration;
use tokio::time;

use crate::commission::CommissionConfig;
use crate::store;
use crate::telemetry::log_error;
use crate::time::TimeSource;

pub struct Scheduler {
    pool: PgPool,
    time_source: TimeSource,
    config: CommissionConfig,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        time_source: TimeSource,
        config: CommissionConfig,
        tick_interval: Duration,
    ) -> Self {
        Self {
            pool,
            time_source,
            config,
            tick_interval,
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            let _ = schedule_tick(&self.config, &self.pool, &self.time_source)
                .await
                .map_err(log_error);
        }
    }
}

/// Process all due deadlines once right now.
#[tracing::instrument(skip(config, pool, time_source))]
pub async fn schedule_tick(
    config: &CommissionConfig,
    pool: &PgPool,
    time_source: &TimeSource,
) -> anyhow::Result<()> {
    store::order::auto_confirm_due_orders(config, pool, time_source).await?;
    store::account::expire_due_bonuses(pool, time_source).await?;
    Ok(())
}
