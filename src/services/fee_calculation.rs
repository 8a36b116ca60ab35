//! Platform fee arithmetic.
//!
//! The platform fee is added on top of the contract amount and billed to the
//! payer. The payee always receives the full base amount.

use bigdecimal::{BigDecimal, RoundingMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Money is kept to two decimal places.
pub const MONEY_SCALE: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeeBreakdown {
    pub base_amount: BigDecimal,
    pub fee_percentage: BigDecimal,
    pub platform_fee: BigDecimal,
    /// What the payer is billed
    pub total_charge: BigDecimal,
    /// What the payee is credited
    pub payee_amount: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeeError {
    #[error("amount must be greater than zero, got {0}")]
    NonPositiveAmount(BigDecimal),

    #[error("fee percentage must be between 0 and 100, got {0}")]
    PercentageOutOfRange(BigDecimal),
}

/// Stored fee fields that no longer match a fresh calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeMismatch {
    pub expected: FeeBreakdown,
    pub recorded_fee: BigDecimal,
    pub recorded_total: BigDecimal,
}

pub fn round_money(value: &BigDecimal) -> BigDecimal {
    value.with_scale_round(MONEY_SCALE, RoundingMode::HalfUp)
}

/// `platform_fee = round_half_up(base * pct / 100, 2)`,
/// `total_charge = base + platform_fee`, `payee_amount = base`.
pub fn calculate_fees(
    base_amount: &BigDecimal,
    fee_percentage: &BigDecimal,
) -> Result<FeeBreakdown, FeeError> {
    let zero = BigDecimal::from(0);
    let base = round_money(base_amount);
    // Sub-cent amounts round to nothing chargeable.
    if base <= zero {
        return Err(FeeError::NonPositiveAmount(base_amount.clone()));
    }
    if *fee_percentage < zero || *fee_percentage > BigDecimal::from(100) {
        return Err(FeeError::PercentageOutOfRange(fee_percentage.clone()));
    }

    let platform_fee = round_money(&(&base * fee_percentage / BigDecimal::from(100)));
    let total_charge = &base + &platform_fee;

    Ok(FeeBreakdown {
        base_amount: base.clone(),
        fee_percentage: fee_percentage.clone(),
        platform_fee,
        total_charge,
        payee_amount: base,
    })
}

/// Recomputes the fee for an existing payment; `Ok(None)` when the recorded
/// fields agree.
pub fn verify_recorded_fees(
    amount: &BigDecimal,
    fee_percentage: &BigDecimal,
    recorded_fee: &BigDecimal,
    recorded_total: &BigDecimal,
) -> Result<Option<FeeMismatch>, FeeError> {
    let expected = calculate_fees(amount, fee_percentage)?;
    if expected.platform_fee == *recorded_fee && expected.total_charge == *recorded_total {
        return Ok(None);
    }
    Ok(Some(FeeMismatch {
        expected,
        recorded_fee: recorded_fee.clone(),
        recorded_total: recorded_total.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn ten_percent_of_a_thousand() {
        let fees = calculate_fees(&dec("1000"), &dec("10")).unwrap();
        assert_eq!(fees.platform_fee, dec("100"));
        assert_eq!(fees.total_charge, dec("1100"));
        assert_eq!(fees.payee_amount, dec("1000"));
    }

    #[test]
    fn fee_rounds_half_up_to_cents() {
        // 10.05 * 2.5% = 0.25125
        let fees = calculate_fees(&dec("10.05"), &dec("2.5")).unwrap();
        assert_eq!(fees.platform_fee, dec("0.25"));
        // 0.30 * 2.5% = 0.0075
        let fees = calculate_fees(&dec("0.30"), &dec("2.5")).unwrap();
        assert_eq!(fees.platform_fee, dec("0.01"));
    }

    #[test]
    fn zero_percent_is_allowed() {
        let fees = calculate_fees(&dec("50"), &dec("0")).unwrap();
        assert_eq!(fees.platform_fee, dec("0"));
        assert_eq!(fees.total_charge, dec("50"));
    }

    #[test]
    fn rejects_non_positive_amounts() {
        assert!(matches!(
            calculate_fees(&dec("0"), &dec("10")),
            Err(FeeError::NonPositiveAmount(_))
        ));
        assert!(calculate_fees(&dec("-5"), &dec("10")).is_err());
    }

    #[test]
    fn rejects_amounts_that_round_to_zero() {
        assert!(matches!(
            calculate_fees(&dec("0.004"), &dec("10")),
            Err(FeeError::NonPositiveAmount(_))
        ));
        let fees = calculate_fees(&dec("0.005"), &dec("0")).unwrap();
        assert_eq!(fees.base_amount, dec("0.01"));
    }

    #[test]
    fn rejects_out_of_range_percentages() {
        assert!(calculate_fees(&dec("100"), &dec("100.01")).is_err());
        assert!(calculate_fees(&dec("100"), &dec("-1")).is_err());
        assert!(calculate_fees(&dec("100"), &dec("100")).is_ok());
    }

    #[test]
    fn audit_flags_tampered_fee() {
        let mismatch =
            verify_recorded_fees(&dec("1000"), &dec("10"), &dec("90"), &dec("1090")).unwrap();
        assert!(mismatch.is_some());
        let clean =
            verify_recorded_fees(&dec("1000"), &dec("10"), &dec("100.00"), &dec("1100.00"))
                .unwrap();
        assert!(clean.is_none());
    }

    #[test]
    fn breakdown_serializes_amounts_as_strings() {
        let fees = calculate_fees(&dec("1000"), &dec("10")).unwrap();
        let json = serde_json::to_value(&fees).unwrap();
        assert_eq!(json["total_charge"], "1100.00");
        let back: FeeBreakdown = serde_json::from_value(json).unwrap();
        assert_eq!(back, fees);
    }
}
