//! Fixed-Point Arithmetic and Time Utilities
//!
//! Token amounts are integers scaled by the token's decimals. These helpers
//! move between human decimals (`rust_decimal::Decimal`) and on-chain
//! integers (`U256` / `I256`) without going through floats.

use crate::error::{ArbError, Result};
use alloy::primitives::{Sign, I256, U256};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// 1 ether (10^18 wei)
pub const ETHER: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Gas limit used when no estimate is available
pub const DEFAULT_GAS_LIMIT: u64 = 250_000;

/// Largest scale `rust_decimal` can represent
const MAX_DECIMAL_SCALE: u32 = 28;

/// Parts-per-million denominator for fractional fees/rewards
pub const PPM: u64 = 1_000_000;

/// 10^exp as U256
pub fn pow10(exp: u32) -> U256 {
    U256::from(10u8).pow(U256::from(exp))
}

/// Expand a decimal amount into its fixed-point integer representation.
///
/// `expand_decimals(1.5, 18) == 1_500_000_000_000_000_000`. Digits below the
/// target precision are truncated toward zero; negative values keep their sign.
pub fn expand_decimals(value: Decimal, decimals: u32) -> Result<I256> {
    let mantissa = value.mantissa();
    let scale = value.scale();
    let abs = U256::from(mantissa.unsigned_abs());

    let scaled = if decimals >= scale {
        abs.checked_mul(pow10(decimals - scale))
            .ok_or_else(|| ArbError::Overflow(format!("{} x 10^{}", value, decimals)))?
    } else {
        abs / pow10(scale - decimals)
    };

    let sign = if mantissa < 0 { Sign::Negative } else { Sign::Positive };
    I256::checked_from_sign_and_abs(sign, scaled)
        .ok_or_else(|| ArbError::Overflow(format!("{} x 10^{}", value, decimals)))
}

/// Inverse of [`expand_decimals`]: reduce a fixed-point integer back to a decimal.
pub fn reduce_decimals(value: I256, decimals: u32) -> Result<Decimal> {
    let (sign, mut abs) = value.into_sign_and_abs();
    let mut scale = decimals;

    // rust_decimal tops out at 28 fractional digits
    if scale > MAX_DECIMAL_SCALE {
        abs /= pow10(scale - MAX_DECIMAL_SCALE);
        scale = MAX_DECIMAL_SCALE;
    }

    let abs = u128::try_from(abs)
        .map_err(|_| ArbError::Overflow(format!("{} does not fit a decimal", value)))?;
    let mut mantissa = i128::try_from(abs)
        .map_err(|_| ArbError::Overflow(format!("{} does not fit a decimal", value)))?;
    if sign == Sign::Negative {
        mantissa = -mantissa;
    }

    Decimal::try_from_i128_with_scale(mantissa, scale)
        .map(|d| d.normalize())
        .map_err(|e| ArbError::Overflow(e.to_string()))
}

/// Display helper: amount in whole units, truncated to 4 decimal places.
/// Saturates instead of failing, so it is only meant for logs and summaries.
pub fn to_display(amount: U256, decimals: u32) -> Decimal {
    let scaled = amount.saturating_mul(U256::from(10_000u32)) / pow10(decimals);
    let units = u64::try_from(scaled).unwrap_or(u64::MAX);
    Decimal::from_i128_with_scale(units as i128, 4).normalize()
}

/// Fraction (e.g. 0.003) to parts-per-million, clamped to [0, 1_000_000].
pub fn fraction_to_ppm(fraction: Decimal) -> u64 {
    let ppm = (fraction * Decimal::from(PPM)).trunc();
    ppm.to_u64().unwrap_or(0).min(PPM)
}

/// `amount * fraction`, rounded down.
pub fn apply_fraction(amount: U256, fraction: Decimal) -> U256 {
    amount * U256::from(fraction_to_ppm(fraction)) / U256::from(PPM)
}

/// Current unix time in seconds
pub fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
