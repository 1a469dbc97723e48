//! Date-range and billing-period arithmetic
//!
//! Billing works on civil dates in the account's time zone. Ranges are
//! half-open `[start, end)` so adjacent periods tile without overlap.

use serde::{Deserialize, Serialize};
use time::{Date, Month};

/// Half-open date range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
}

impl DateRange {
    pub fn new(start: Date, end: Date) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Number of whole days covered by the range
    pub fn days(&self) -> i64 {
        (self.end - self.start).whole_days()
    }

    pub fn contains(&self, date: Date) -> bool {
        date >= self.start && date < self.end
    }

    /// Intersection, or `None` when the ranges do not overlap
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(DateRange { start, end })
        } else {
            None
        }
    }
}

impl std::fmt::Display for DateRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Recurring billing period length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Quarterly,
    Annual,
}

impl BillingPeriod {
    pub fn months(&self) -> u32 {
        match self {
            BillingPeriod::Monthly => 1,
            BillingPeriod::Quarterly => 3,
            BillingPeriod::Annual => 12,
        }
    }

    /// Start of the next period after `date`
    pub fn advance(&self, date: Date) -> Date {
        add_months(date, self.months())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Quarterly => "quarterly",
            BillingPeriod::Annual => "annual",
        }
    }
}

/// Add calendar months, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29)
#[allow(clippy::expect_used)] // month and day are clamped into range above
pub fn add_months(date: Date, months: u32) -> Date {
    let zero_based = date.year() * 12 + (date.month() as i32 - 1) + months as i32;
    let year = zero_based.div_euclid(12);
    let month_number = (zero_based.rem_euclid(12) + 1) as u8;
    let month = Month::try_from(month_number).expect("month in range");
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).expect("clamped day is valid")
}
