//! Commission and cashback calculation.
//!
//! Pure arithmetic over [`rust_decimal::Decimal`] with no rounding of
//! intermediate results. Chained settlements only stay balance-preserving if
//! every derived amount is exact, so nothing here rounds; display rounding
//! is a concern for callers.

use rust_decimal::{Decimal, dec};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Commission policy constants.
///
/// The defaults carry the platform policy: 5% commission with a 0.01-point
/// floor, half of the commission returned to the client as bonus-point
/// cashback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionConfig {
    /// Fraction of the gross amount taken as commission.
    pub commission_rate: Decimal,
    /// Fraction of the commission returned to the client as cashback.
    pub cashback_share: Decimal,
    /// Smallest commission the platform will accept.
    pub min_commission: Decimal,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            commission_rate: dec!(0.05),
            cashback_share: dec!(0.5),
            min_commission: dec!(0.01),
        }
    }
}

impl CommissionConfig {
    /// Smallest gross amount for which the floor commission is achievable.
    pub fn min_gross(&self) -> Decimal {
        self.min_commission / self.commission_rate
    }
}

/// How a gross amount splits between specialist, platform, and client.
///
/// Guarantees `specialist_amount + commission == gross` and
/// `commission - cashback == net_revenue`, both in exact decimal equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionBreakdown {
    pub commission: Decimal,
    pub cashback: Decimal,
    pub specialist_amount: Decimal,
    pub net_revenue: Decimal,
}

/// Split a gross amount into its settlement components.
///
/// Pure and deterministic; usable any number of times without side effects,
/// e.g. for price previews. Rejects amounts that cannot fund the minimum
/// commission with [`StoreError::AmountTooSmall`].
pub fn calculate_commission(
    gross: Decimal,
    config: &CommissionConfig,
) -> Result<CommissionBreakdown, StoreError> {
    let min_gross = config.min_gross();
    if gross < min_gross {
        return Err(StoreError::AmountTooSmall { gross, min_gross });
    }

    let commission = (gross * config.commission_rate).max(config.min_commission);
    let cashback = commission * config.cashback_share;
    let specialist_amount = gross - commission;
    let net_revenue = commission - cashback;

    // These hold for any valid config; a failure means corrupted constants
    // or an arithmetic bug, and must abort the enclosing settlement.
    if specialist_amount + commission != gross {
        return Err(StoreError::BalanceInvariantViolation(format!(
            "specialist_amount {specialist_amount} + commission {commission} != gross {gross}"
        )));
    }
    if commission - cashback != net_revenue {
        return Err(StoreError::BalanceInvariantViolation(format!(
            "commission {commission} - cashback {cashback} != net_revenue {net_revenue}"
        )));
    }

    Ok(CommissionBreakdown {
        commission,
        cashback,
        specialist_amount,
        net_revenue,
    })
}
