// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Rebill Shared Primitives
//!
//! Building blocks used by every Rebill crate:
//!
//! - **Money**: decimal amounts with a configurable scale and rounding mode
//! - **Dates**: half-open date ranges and billing-period arithmetic
//! - **Clock**: injectable time source so billing runs are reproducible

pub mod clock;
pub mod dates;
pub mod money;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dates::{add_months, BillingPeriod, DateRange};
pub use money::{Currency, MoneyConfig, Rounding};
