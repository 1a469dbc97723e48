//! Day-count proration
//!
//! A sub-range of a billing period is charged
//! `amount × sub_days / period_days`. The day-count factor is rounded at
//! twice the monetary scale before it is applied, and the product is then
//! rounded to the monetary scale; both use the configured rounding mode.
//!
//! When a period is split into contiguous sub-ranges, every sub-range except
//! the last is prorated as above and the last absorbs the residual, so the
//! slices always sum to the original amount exactly.

use rust_decimal::Decimal;

use rebill_shared::{DateRange, MoneyConfig};

/// Day-count factor `days / period_days`, carried at `2 × scale` decimals
pub fn proration_factor(config: &MoneyConfig, days: i64, period_days: i64) -> Decimal {
    if period_days <= 0 {
        return Decimal::ZERO;
    }
    config.round_at(
        Decimal::from(days) / Decimal::from(period_days),
        2 * config.scale,
    )
}

/// Prorated amount for `days` out of `period_days`
pub fn prorate(config: &MoneyConfig, amount: Decimal, days: i64, period_days: i64) -> Decimal {
    config.round(amount * proration_factor(config, days, period_days))
}

/// Split `amount` across contiguous sub-ranges of one period.
///
/// Returns one amount per sub-range, in order. The last sub-range takes
/// `amount − sum(previous)` so no cents leak across the split. Empty input
/// returns an empty vec.
pub fn split_preserving(config: &MoneyConfig, amount: Decimal, ranges: &[DateRange]) -> Vec<Decimal> {
    if ranges.is_empty() {
        return Vec::new();
    }
    let period_days: i64 = ranges.iter().map(DateRange::days).sum();
    let mut amounts = Vec::with_capacity(ranges.len());
    let mut allocated = Decimal::ZERO;
    for range in &ranges[..ranges.len() - 1] {
        let slice = prorate(config, amount, range.days(), period_days);
        allocated += slice;
        amounts.push(slice);
    }
    amounts.push(config.round(amount - allocated));
    amounts
}
