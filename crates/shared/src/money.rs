//! Monetary configuration
//!
//! All invoice and payment amounts are `rust_decimal::Decimal` values
//! normalized to a configured scale with a configured rounding mode.
//! The scale applies to stored amounts; intermediate proration factors
//! use twice the scale (see `rebill-billing::proration`).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Rounding mode for monetary amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    /// Round half away from zero (the accounting default)
    HalfUp,
    /// Round half to even (banker's rounding)
    HalfEven,
}

impl Rounding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rounding::HalfUp => "half_up",
            Rounding::HalfEven => "half_even",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "half_even" => Rounding::HalfEven,
            _ => Rounding::HalfUp,
        }
    }

    fn strategy(self) -> RoundingStrategy {
        match self {
            Rounding::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            Rounding::HalfEven => RoundingStrategy::MidpointNearestEven,
        }
    }
}

/// Number of decimal places and rounding mode for monetary math
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyConfig {
    pub scale: u32,
    pub rounding: Rounding,
}

impl Default for MoneyConfig {
    fn default() -> Self {
        Self {
            scale: 2,
            rounding: Rounding::HalfUp,
        }
    }
}

impl MoneyConfig {
    pub fn new(scale: u32, rounding: Rounding) -> Self {
        Self { scale, rounding }
    }

    /// Read `REBILL_MONEY_SCALE` / `REBILL_MONEY_ROUNDING`, falling back to
    /// 2 decimals half-up
    pub fn from_env() -> Self {
        let scale = std::env::var("REBILL_MONEY_SCALE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(2);
        let rounding = std::env::var("REBILL_MONEY_ROUNDING")
            .map(|v| Rounding::from_string(&v))
            .unwrap_or(Rounding::HalfUp);
        Self { scale, rounding }
    }

    /// Normalize an amount to the configured scale
    pub fn round(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.scale, self.rounding.strategy())
    }

    /// Round at an explicit scale with the configured mode (used for
    /// intermediate factors carried at higher precision)
    pub fn round_at(&self, amount: Decimal, scale: u32) -> Decimal {
        amount.round_dp_with_strategy(scale, self.rounding.strategy())
    }
}

/// Supported settlement currencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "EUR" => Currency::Eur,
            "GBP" => Currency::Gbp,
            _ => Currency::Usd,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_half_up_rounding() {
        let cfg = MoneyConfig::default();
        assert_eq!(cfg.round(dec!(231.885)), dec!(231.89));
        assert_eq!(cfg.round(dec!(231.884)), dec!(231.88));
        assert_eq!(cfg.round(dec!(-231.885)), dec!(-231.89));
    }

    #[test]
    fn test_half_even_rounding() {
        let cfg = MoneyConfig::new(2, Rounding::HalfEven);
        assert_eq!(cfg.round(dec!(0.125)), dec!(0.12));
        assert_eq!(cfg.round(dec!(0.135)), dec!(0.14));
    }

    #[test]
    fn test_round_at_higher_scale() {
        let cfg = MoneyConfig::default();
        let factor = rust_decimal::Decimal::from(30) / rust_decimal::Decimal::from(31);
        assert_eq!(cfg.round_at(factor, 4), dec!(0.9677));
    }

    #[test]
    fn test_currency_round_trip() {
        for c in [Currency::Usd, Currency::Eur, Currency::Gbp] {
            assert_eq!(Currency::from_string(c.as_str()), c);
        }
    }
}
