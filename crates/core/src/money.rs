use rust_decimal::{Decimal, RoundingStrategy};

/// Largest difference accepted between a declared and a computed amount.
pub fn tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Half-up rounding to `dp` decimals.
pub fn round_to(value: Decimal, dp: u32) -> Decimal {
    value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
}

pub fn round_money(value: Decimal) -> Decimal {
    round_to(value, 2)
}

pub fn within_tolerance(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= tolerance()
}

/// `base * rate / 100`, rounded half-up to cents.
pub fn percentage_of(base: Decimal, rate: Decimal) -> Decimal {
    round_money(base * rate / Decimal::ONE_HUNDRED)
}

/// [`percentage_of`] returning `None` on overflow.
pub fn checked_percentage_of(base: Decimal, rate: Decimal) -> Option<Decimal> {
    base.checked_mul(rate)?
        .checked_div(Decimal::ONE_HUNDRED)
        .map(round_money)
}
