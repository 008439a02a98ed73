//! Exact-decimal money helpers. Every rounding is half-to-even at the
//! currency's minor unit.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::{AffiliateError, AffiliateResult};

/// Scale used when an attribution weight enters a money computation.
pub const WEIGHT_SCALE: u32 = 10;

/// Number of decimal places in the currency's minor unit.
pub fn minor_unit_scale(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
        "KWD" | "BHD" | "OMR" | "JOD" | "TND" => 3,
        _ => 2,
    }
}

/// Round to the currency's minor unit with banker's rounding.
pub fn round_minor(amount: Decimal, currency: &str) -> Decimal {
    amount.round_dp_with_strategy(
        minor_unit_scale(currency),
        RoundingStrategy::MidpointNearestEven,
    )
}

/// Convert an attribution weight into a `Decimal` factor.
pub fn weight_to_decimal(weight: f64) -> AffiliateResult<Decimal> {
    if !weight.is_finite() || !(0.0..=1.0 + 1e-9).contains(&weight) {
        return Err(AffiliateError::Integrity(format!(
            "attribution weight {weight} outside [0, 1]"
        )));
    }
    let d = Decimal::from_f64(weight)
        .ok_or_else(|| AffiliateError::Integrity(format!("unrepresentable weight {weight}")))?;
    Ok(d.round_dp_with_strategy(WEIGHT_SCALE, RoundingStrategy::MidpointNearestEven))
}

/// `value * rate * weight`, rounded once at the end.
pub fn percentage_of(
    value: Decimal,
    rate: Decimal,
    weight: f64,
    currency: &str,
) -> AffiliateResult<Decimal> {
    let w = weight_to_decimal(weight)?;
    let raw = value
        .checked_mul(rate)
        .and_then(|v| v.checked_mul(w))
        .ok_or_else(|| AffiliateError::Integrity("commission multiplication overflow".into()))?;
    Ok(round_minor(raw, currency))
}
