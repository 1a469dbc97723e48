//! Subscription billing timeline
//!
//! The entitlement side of the system hands the engine an ordered list of
//! billing intervals per subscription (plan, period, price, effective
//! range). From that the engine derives the charge periods owed up to a
//! target date; the repair engine then reconciles them against what was
//! already invoiced.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

use rebill_shared::{BillingPeriod, DateRange, MoneyConfig};

use crate::calculator;
use crate::items::{Invoice, InvoicePayment};
use crate::proration::prorate;

/// One plan configuration in effect over a date range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingInterval {
    pub plan: String,
    pub billing_period: BillingPeriod,
    /// Price per billing period; zero for trial-style phases
    pub recurring_price: Decimal,
    /// One-off charge at the interval start (setup fee, fixed phase)
    pub fixed_price: Option<Decimal>,
    pub range: OpenEndedRange,
}

/// `[start, end)` where `end = None` means "until further notice"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenEndedRange {
    pub start: Date,
    pub end: Option<Date>,
}

impl OpenEndedRange {
    pub fn from(start: Date) -> Self {
        Self { start, end: None }
    }

    pub fn between(start: Date, end: Date) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    fn clip(&self, range: DateRange) -> Option<DateRange> {
        let bounded = DateRange::new(
            range.start.max(self.start),
            match self.end {
                Some(end) => range.end.min(end),
                None => range.end,
            },
        );
        (!bounded.is_empty()).then_some(bounded)
    }
}

/// Ordered, non-overlapping billing intervals for one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionTimeline {
    pub subscription_id: Uuid,
    pub bundle_id: Uuid,
    /// Billing anchor: period boundaries step from this date
    pub anchor: Date,
    pub intervals: Vec<BillingInterval>,
}

/// Kind of charge a timeline proposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposedChargeKind {
    Fixed,
    Recurring,
}

/// A charge the timeline says is owed up to the target date
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedCharge {
    pub subscription_id: Uuid,
    pub plan: String,
    pub kind: ProposedChargeKind,
    /// The full billing period the charge belongs to
    pub period: DateRange,
    /// The (possibly clipped) span actually owed
    pub charged: DateRange,
    /// Price for the full billing period; `amount` is its prorated share
    pub period_price: Decimal,
    pub amount: Decimal,
}

impl SubscriptionTimeline {
    /// Charge periods owed up to and including the period containing
    /// `target_date` (recurring charges bill in advance at period start).
    /// Slices clipped by a plan change or cancellation are prorated.
    pub fn proposed_charges(&self, config: &MoneyConfig, target_date: Date) -> Vec<ProposedCharge> {
        let mut proposals = Vec::new();
        for interval in &self.intervals {
            if let Some(fixed_price) = interval.fixed_price {
                if interval.range.start <= target_date {
                    proposals.push(ProposedCharge {
                        subscription_id: self.subscription_id,
                        plan: interval.plan.clone(),
                        kind: ProposedChargeKind::Fixed,
                        period: DateRange::new(interval.range.start, interval.range.start),
                        charged: DateRange::new(interval.range.start, interval.range.start),
                        period_price: fixed_price,
                        amount: fixed_price,
                    });
                }
            }
            if interval.recurring_price > Decimal::ZERO {
                self.propose_recurring(config, interval, target_date, &mut proposals);
            }
        }
        proposals
    }

    fn propose_recurring(
        &self,
        config: &MoneyConfig,
        interval: &BillingInterval,
        target_date: Date,
        proposals: &mut Vec<ProposedCharge>,
    ) {
        let mut period_start = self.anchor;
        loop {
            if period_start > target_date {
                break;
            }
            if let Some(interval_end) = interval.range.end {
                if period_start >= interval_end {
                    break;
                }
            }
            let period_end = interval.billing_period.advance(period_start);
            let period = DateRange::new(period_start, period_end);
            if let Some(charged) = interval.range.clip(period) {
                let amount = if charged == period {
                    interval.recurring_price
                } else {
                    prorate(config, interval.recurring_price, charged.days(), period.days())
                };
                proposals.push(ProposedCharge {
                    subscription_id: self.subscription_id,
                    plan: interval.plan.clone(),
                    kind: ProposedChargeKind::Recurring,
                    period,
                    charged,
                    period_price: interval.recurring_price,
                    amount,
                });
            }
            period_start = period_end;
        }
    }
}

/// Per-account billing snapshot, recomputed on every evaluation; never
/// persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingState {
    pub account_id: Uuid,
    pub unpaid_invoice_count: usize,
    pub total_unpaid_balance: Decimal,
    pub date_of_earliest_unpaid_invoice: Option<Date>,
}

impl BillingState {
    pub fn compute(
        config: &MoneyConfig,
        account_id: Uuid,
        invoices: &[(Invoice, Vec<InvoicePayment>)],
    ) -> Self {
        let mut unpaid_invoice_count = 0;
        let mut total_unpaid_balance = Decimal::ZERO;
        let mut date_of_earliest_unpaid_invoice: Option<Date> = None;
        for (invoice, payments) in invoices {
            if invoice.migration {
                continue;
            }
            let balance = calculator::balance(config, &invoice.items, payments);
            if balance > Decimal::ZERO {
                unpaid_invoice_count += 1;
                total_unpaid_balance += balance;
                date_of_earliest_unpaid_invoice = Some(match date_of_earliest_unpaid_invoice {
                    Some(existing) => existing.min(invoice.invoice_date),
                    None => invoice.invoice_date,
                });
            }
        }
        Self {
            account_id,
            unpaid_invoice_count,
            total_unpaid_balance: config.round(total_unpaid_balance),
            date_of_earliest_unpaid_invoice,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::date;

    fn cfg() -> MoneyConfig {
        MoneyConfig::default()
    }

    fn monthly(plan: &str, price: Decimal, range: OpenEndedRange) -> BillingInterval {
        BillingInterval {
            plan: plan.to_string(),
            billing_period: BillingPeriod::Monthly,
            recurring_price: price,
            fixed_price: None,
            range,
        }
    }

    #[test]
    fn test_single_interval_full_periods() {
        let timeline = SubscriptionTimeline {
            subscription_id: Uuid::new_v4(),
            bundle_id: Uuid::new_v4(),
            anchor: date!(2012 - 05 - 01),
            intervals: vec![monthly(
                "shotgun-monthly",
                dec!(249.95),
                OpenEndedRange::from(date!(2012 - 05 - 01)),
            )],
        };
        let proposals = timeline.proposed_charges(&cfg(), date!(2012 - 06 - 01));
        assert_eq!(proposals.len(), 2);
        assert_eq!(proposals[0].amount, dec!(249.95));
        assert_eq!(
            proposals[0].charged,
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01))
        );
        assert_eq!(proposals[1].amount, dec!(249.95));
        assert_eq!(
            proposals[1].charged,
            DateRange::new(date!(2012 - 06 - 01), date!(2012 - 07 - 01))
        );
    }

    #[test]
    fn test_plan_change_mid_period_prorates_both_sides() {
        let subscription_id = Uuid::new_v4();
        let bundle_id = Uuid::new_v4();
        let timeline = SubscriptionTimeline {
            subscription_id,
            bundle_id,
            anchor: date!(2012 - 05 - 01),
            intervals: vec![
                monthly(
                    "shotgun-monthly",
                    dec!(249.95),
                    OpenEndedRange::between(date!(2012 - 05 - 01), date!(2012 - 05 - 02)),
                ),
                monthly(
                    "blowdart-monthly",
                    dec!(9.95),
                    OpenEndedRange::from(date!(2012 - 05 - 02)),
                ),
            ],
        };
        let proposals = timeline.proposed_charges(&cfg(), date!(2012 - 05 - 02));
        assert_eq!(proposals.len(), 2);
        // Old plan keeps one prorated day
        assert_eq!(proposals[0].plan, "shotgun-monthly");
        assert_eq!(
            proposals[0].charged,
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 05 - 02))
        );
        assert_eq!(proposals[0].amount, dec!(8.07));
        // New plan owes the rest of the month
        assert_eq!(proposals[1].plan, "blowdart-monthly");
        assert_eq!(
            proposals[1].charged,
            DateRange::new(date!(2012 - 05 - 02), date!(2012 - 06 - 01))
        );
        assert_eq!(proposals[1].amount, dec!(9.63));
    }

    #[test]
    fn test_cancellation_stops_future_periods() {
        let timeline = SubscriptionTimeline {
            subscription_id: Uuid::new_v4(),
            bundle_id: Uuid::new_v4(),
            anchor: date!(2012 - 05 - 01),
            intervals: vec![monthly(
                "shotgun-monthly",
                dec!(249.95),
                OpenEndedRange::between(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            )],
        };
        let proposals = timeline.proposed_charges(&cfg(), date!(2012 - 08 - 01));
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].amount, dec!(249.95));
    }

    #[test]
    fn test_trial_fixed_phase() {
        let timeline = SubscriptionTimeline {
            subscription_id: Uuid::new_v4(),
            bundle_id: Uuid::new_v4(),
            anchor: date!(2012 - 04 - 01),
            intervals: vec![BillingInterval {
                plan: "shotgun-monthly".to_string(),
                billing_period: BillingPeriod::Monthly,
                recurring_price: Decimal::ZERO,
                fixed_price: Some(Decimal::ZERO),
                range: OpenEndedRange::between(date!(2012 - 04 - 01), date!(2012 - 05 - 01)),
            }],
        };
        let proposals = timeline.proposed_charges(&cfg(), date!(2012 - 04 - 01));
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].kind, ProposedChargeKind::Fixed);
        assert_eq!(proposals[0].amount, Decimal::ZERO);
    }
}
