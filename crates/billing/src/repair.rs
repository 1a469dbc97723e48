//! Repair / reconciliation engine
//!
//! Given a subscription's billing timeline and the items already invoiced
//! for it, computes (a) the charges still owed up to the target date and
//! (b) the REPAIR_ADJ items that negate previously billed coverage a plan
//! change or cancellation invalidated. The engine is pure: it reads
//! snapshots and returns a proposal; the dispatcher persists it and derives
//! the CBA movements by rebalancing affected invoices.
//!
//! A repaired amount is always net of item adjustments already applied to
//! the repaired item: a 2399.95 charge carrying a -10.00 adjustment repairs
//! at most 2389.95. When adjustments consumed the item entirely, the repair
//! is skipped rather than driven negative.

use rust_decimal::Decimal;
use time::Date;
use uuid::Uuid;

use rebill_shared::{DateRange, MoneyConfig};

use crate::items::{InvoiceItem, InvoiceItemType};
use crate::proration::prorate;
use crate::timeline::{ProposedCharge, ProposedChargeKind, SubscriptionTimeline};

/// How invalidated coverage is repaired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepairStrategy {
    /// Repair only the invalidated slice of the item, prorated by day count
    #[default]
    PartialRepair,
    /// Repair the whole item and re-invoice the remaining valid coverage
    FullRepair,
}

impl RepairStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairStrategy::PartialRepair => "PARTIAL_REPAIR",
            RepairStrategy::FullRepair => "FULL_REPAIR",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "FULL_REPAIR" => RepairStrategy::FullRepair,
            _ => RepairStrategy::PartialRepair,
        }
    }
}

/// A repair to append to the invoice holding the repaired item;
/// `amount` is the positive magnitude of the REPAIR_ADJ to write
#[derive(Debug, Clone, PartialEq)]
pub struct RepairItem {
    pub invoice_id: Uuid,
    pub repaired_item_id: Uuid,
    pub subscription_id: Uuid,
    pub range: DateRange,
    pub amount: Decimal,
}

/// A charge to place on the new invoice
#[derive(Debug, Clone, PartialEq)]
pub struct NewCharge {
    pub subscription_id: Uuid,
    pub plan: String,
    pub kind: ProposedChargeKind,
    pub period: DateRange,
    pub charged: DateRange,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepairProposal {
    pub repairs: Vec<RepairItem>,
    pub new_charges: Vec<NewCharge>,
}

impl RepairProposal {
    pub fn is_empty(&self) -> bool {
        self.repairs.is_empty() && self.new_charges.is_empty()
    }
}

pub struct RepairEngine {
    money: MoneyConfig,
}

struct ExistingRecurring<'a> {
    item: &'a InvoiceItem,
    range: DateRange,
    /// Positive total of ITEM_ADJ magnitudes applied to the item
    adjusted: Decimal,
    /// Positive total already repaired
    repaired: Decimal,
    /// Earliest start among prior repairs (repairs cut tails)
    repaired_from: Option<Date>,
}

impl RepairEngine {
    pub fn new(money: MoneyConfig) -> Self {
        Self { money }
    }

    /// Reconcile one subscription: what to repair, what to newly charge.
    ///
    /// `existing` is every item on the account's invoices; the engine picks
    /// out this subscription's charges and the adjustments linked to them.
    pub fn reconcile(
        &self,
        timeline: &SubscriptionTimeline,
        existing: &[InvoiceItem],
        target_date: Date,
        strategy: RepairStrategy,
    ) -> RepairProposal {
        let proposals = timeline.proposed_charges(&self.money, target_date);
        let recurring = self.collect_recurring(timeline.subscription_id, existing);

        let mut repairs = Vec::new();
        // Coverage still provided by existing items, per plan
        let mut coverage: Vec<(String, DateRange)> = Vec::new();

        for entry in &recurring {
            self.reconcile_item(timeline, strategy, entry, &mut repairs, &mut coverage);
        }

        let mut new_charges = Vec::new();
        for proposal in &proposals {
            match proposal.kind {
                ProposedChargeKind::Fixed => {
                    let already_billed = existing.iter().any(|item| {
                        item.subscription_id == Some(timeline.subscription_id)
                            && item.item_type == InvoiceItemType::Fixed
                            && item.plan.as_deref() == Some(proposal.plan.as_str())
                            && item.start_date == proposal.charged.start
                    });
                    if !already_billed {
                        new_charges.push(NewCharge {
                            subscription_id: proposal.subscription_id,
                            plan: proposal.plan.clone(),
                            kind: ProposedChargeKind::Fixed,
                            period: proposal.period,
                            charged: proposal.charged,
                            amount: proposal.amount,
                        });
                    }
                }
                ProposedChargeKind::Recurring => {
                    let covered: Vec<DateRange> = coverage
                        .iter()
                        .filter(|(plan, _)| *plan == proposal.plan)
                        .map(|(_, range)| *range)
                        .collect();
                    for uncovered in subtract_ranges(proposal.charged, &covered) {
                        let amount = if uncovered == proposal.period {
                            proposal.period_price
                        } else {
                            prorate(
                                &self.money,
                                proposal.period_price,
                                uncovered.days(),
                                proposal.period.days(),
                            )
                        };
                        new_charges.push(NewCharge {
                            subscription_id: proposal.subscription_id,
                            plan: proposal.plan.clone(),
                            kind: ProposedChargeKind::Recurring,
                            period: proposal.period,
                            charged: uncovered,
                            amount,
                        });
                    }
                }
            }
        }

        RepairProposal {
            repairs,
            new_charges,
        }
    }

    fn reconcile_item(
        &self,
        timeline: &SubscriptionTimeline,
        strategy: RepairStrategy,
        entry: &ExistingRecurring<'_>,
        repairs: &mut Vec<RepairItem>,
        coverage: &mut Vec<(String, DateRange)>,
    ) {
        let item = entry.item;
        let Some(plan) = item.plan.as_deref() else {
            return;
        };
        let effective_end = entry.repaired_from.unwrap_or(entry.range.end).min(entry.range.end);
        let effective = DateRange::new(entry.range.start, effective_end);
        if effective.is_empty() {
            // Fully repaired already
            return;
        }

        // The item stays valid while an interval of the same plan covers it
        let valid_end = timeline
            .intervals
            .iter()
            .find(|interval| {
                interval.plan == plan
                    && interval.range.start <= effective.start
                    && interval.range.end.map_or(true, |end| end > effective.start)
            })
            .map(|interval| match interval.range.end {
                Some(end) => end.min(effective.end),
                None => effective.end,
            })
            .unwrap_or(effective.start);

        if valid_end >= effective.end {
            coverage.push((plan.to_string(), effective));
            return;
        }

        let invalid = DateRange::new(valid_end, effective.end);
        let (repair_range, base) = match strategy {
            RepairStrategy::PartialRepair => {
                let valid_days = (valid_end - entry.range.start).whole_days();
                let valid_value = if valid_days == 0 {
                    Decimal::ZERO
                } else {
                    prorate(&self.money, item.amount, valid_days, entry.range.days())
                };
                (invalid, item.amount - entry.repaired - valid_value)
            }
            // Everything still standing is repaired; the valid prefix gets
            // re-invoiced fresh from the timeline
            RepairStrategy::FullRepair => (effective, item.amount - entry.repaired),
        };

        let repair_amount = self.money.round(base - entry.adjusted);
        if repair_amount <= Decimal::ZERO {
            tracing::debug!(
                item_id = %item.id,
                adjusted = %entry.adjusted,
                "Skipping repair: item already consumed by adjustments"
            );
            // Nothing repairable; whatever the item still covers stands
            let kept = match strategy {
                RepairStrategy::PartialRepair => DateRange::new(entry.range.start, valid_end),
                RepairStrategy::FullRepair => effective,
            };
            if !kept.is_empty() {
                coverage.push((plan.to_string(), kept));
            }
            return;
        }

        repairs.push(RepairItem {
            invoice_id: item.invoice_id,
            repaired_item_id: item.id,
            subscription_id: timeline.subscription_id,
            range: repair_range,
            amount: repair_amount,
        });

        if strategy == RepairStrategy::PartialRepair && valid_end > entry.range.start {
            coverage.push((plan.to_string(), DateRange::new(entry.range.start, valid_end)));
        }
    }

    fn collect_recurring<'a>(
        &self,
        subscription_id: Uuid,
        existing: &'a [InvoiceItem],
    ) -> Vec<ExistingRecurring<'a>> {
        existing
            .iter()
            .filter(|item| {
                item.item_type == InvoiceItemType::Recurring
                    && item.subscription_id == Some(subscription_id)
            })
            .filter_map(|item| {
                let range = item.range()?;
                let mut adjusted = Decimal::ZERO;
                let mut repaired = Decimal::ZERO;
                let mut repaired_from: Option<Date> = None;
                for linked in existing.iter().filter(|i| i.linked_item_id == Some(item.id)) {
                    match linked.item_type {
                        InvoiceItemType::ItemAdj => adjusted -= linked.amount,
                        InvoiceItemType::RepairAdj => {
                            repaired -= linked.amount;
                            repaired_from = Some(match repaired_from {
                                Some(existing_start) => existing_start.min(linked.start_date),
                                None => linked.start_date,
                            });
                        }
                        _ => {}
                    }
                }
                Some(ExistingRecurring {
                    item,
                    range,
                    adjusted,
                    repaired,
                    repaired_from,
                })
            })
            .collect()
    }
}

/// `target` minus the union of `covered`, as ordered disjoint ranges
fn subtract_ranges(target: DateRange, covered: &[DateRange]) -> Vec<DateRange> {
    let mut overlaps: Vec<DateRange> = covered
        .iter()
        .filter_map(|range| range.intersect(&target))
        .collect();
    overlaps.sort_by_key(|range| range.start);

    let mut result = Vec::new();
    let mut cursor = target.start;
    for overlap in overlaps {
        if overlap.start > cursor {
            result.push(DateRange::new(cursor, overlap.start));
        }
        cursor = cursor.max(overlap.end);
    }
    if cursor < target.end {
        result.push(DateRange::new(cursor, target.end));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{BillingInterval, OpenEndedRange};
    use rebill_shared::{BillingPeriod, Currency};
    use rust_decimal_macros::dec;
    use time::macros::{date, datetime};

    fn engine() -> RepairEngine {
        RepairEngine::new(MoneyConfig::default())
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

    fn annual(plan: &str, price: Decimal, range: OpenEndedRange) -> BillingInterval {
        BillingInterval {
            plan: plan.to_string(),
            billing_period: BillingPeriod::Annual,
            recurring_price: price,
            fixed_price: None,
            range,
        }
    }

    fn timeline(anchor: Date, intervals: Vec<BillingInterval>) -> SubscriptionTimeline {
        SubscriptionTimeline {
            subscription_id: Uuid::new_v4(),
            bundle_id: Uuid::new_v4(),
            anchor,
            intervals,
        }
    }

    fn recurring_item(
        subscription_id: Uuid,
        plan: &str,
        range: DateRange,
        amount: Decimal,
    ) -> InvoiceItem {
        InvoiceItem::recurring(
            Uuid::new_v4(),
            Uuid::new_v4(),
            subscription_id,
            plan,
            range,
            amount,
            Currency::Usd,
            datetime!(2012-05-01 00:00 UTC),
        )
    }

    #[test]
    fn test_first_generation_charges_full_period() {
        let timeline = timeline(
            date!(2012 - 05 - 01),
            vec![monthly(
                "shotgun-monthly",
                dec!(249.95),
                OpenEndedRange::from(date!(2012 - 05 - 01)),
            )],
        );
        let proposal = engine().reconcile(
            &timeline,
            &[],
            date!(2012 - 05 - 01),
            RepairStrategy::PartialRepair,
        );
        assert!(proposal.repairs.is_empty());
        assert_eq!(proposal.new_charges.len(), 1);
        assert_eq!(proposal.new_charges[0].amount, dec!(249.95));
    }

    #[test]
    fn test_regeneration_is_idempotent() {
        let timeline = timeline(
            date!(2012 - 05 - 01),
            vec![monthly(
                "shotgun-monthly",
                dec!(249.95),
                OpenEndedRange::from(date!(2012 - 05 - 01)),
            )],
        );
        let billed = recurring_item(
            timeline.subscription_id,
            "shotgun-monthly",
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            dec!(249.95),
        );
        let proposal = engine().reconcile(
            &timeline,
            &[billed],
            date!(2012 - 05 - 15),
            RepairStrategy::PartialRepair,
        );
        assert!(proposal.is_empty());
    }

    #[test]
    fn test_partial_repair_on_plan_change() {
        // Billed 249.95 for [05-01, 06-01), plan change on 05-02 with a
        // prior -10 adjustment: repair the 30 invalidated days net of the
        // adjustment and charge the new plan for the rest of the month.
        let subscription = timeline(
            date!(2012 - 05 - 01),
            vec![
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
        );
        let billed = recurring_item(
            subscription.subscription_id,
            "shotgun-monthly",
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            dec!(249.95),
        );
        let adjustment = InvoiceItem::item_adj(
            billed.invoice_id,
            billed.account_id,
            billed.id,
            date!(2012 - 05 - 02),
            dec!(-10),
            Currency::Usd,
            datetime!(2012-05-02 00:00 UTC),
        );

        let proposal = engine().reconcile(
            &subscription,
            &[billed.clone(), adjustment],
            date!(2012 - 05 - 02),
            RepairStrategy::PartialRepair,
        );

        assert_eq!(proposal.repairs.len(), 1);
        let repair = &proposal.repairs[0];
        assert_eq!(repair.repaired_item_id, billed.id);
        assert_eq!(
            repair.range,
            DateRange::new(date!(2012 - 05 - 02), date!(2012 - 06 - 01))
        );
        assert_eq!(repair.amount, dec!(231.88));

        assert_eq!(proposal.new_charges.len(), 1);
        let new_charge = &proposal.new_charges[0];
        assert_eq!(new_charge.plan, "blowdart-monthly");
        assert_eq!(
            new_charge.charged,
            DateRange::new(date!(2012 - 05 - 02), date!(2012 - 06 - 01))
        );
        assert_eq!(new_charge.amount, dec!(9.63));
    }

    #[test]
    fn test_partial_repair_without_adjustment() {
        // Same change, no prior adjustment: repair is the prorated
        // invalidated slice, residual assigned to the repaired tail
        let subscription = timeline(
            date!(2012 - 05 - 01),
            vec![
                monthly(
                    "assault-rifle-monthly",
                    dec!(599.95),
                    OpenEndedRange::between(date!(2012 - 05 - 01), date!(2012 - 05 - 07)),
                ),
                monthly(
                    "blowdart-monthly",
                    dec!(9.95),
                    OpenEndedRange::from(date!(2012 - 05 - 07)),
                ),
            ],
        );
        let billed = recurring_item(
            subscription.subscription_id,
            "assault-rifle-monthly",
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            dec!(599.95),
        );
        let proposal = engine().reconcile(
            &subscription,
            &[billed],
            date!(2012 - 05 - 07),
            RepairStrategy::PartialRepair,
        );
        assert_eq!(proposal.repairs.len(), 1);
        assert_eq!(proposal.repairs[0].amount, dec!(483.86));
        assert_eq!(proposal.new_charges.len(), 1);
        assert_eq!(proposal.new_charges[0].amount, dec!(8.02));
    }

    #[test]
    fn test_full_repair_reinvoices_valid_coverage() {
        // Annual 2399.95 with a -10 adjustment, change at period start:
        // the whole item repairs at 2389.95 and the new monthly plan is
        // invoiced fresh.
        let subscription = timeline(
            date!(2012 - 05 - 01),
            vec![
                annual(
                    "shotgun-annual",
                    dec!(2399.95),
                    OpenEndedRange::between(date!(2012 - 05 - 01), date!(2012 - 05 - 01)),
                ),
                monthly(
                    "shotgun-monthly",
                    dec!(249.95),
                    OpenEndedRange::from(date!(2012 - 05 - 01)),
                ),
            ],
        );
        let billed = recurring_item(
            subscription.subscription_id,
            "shotgun-annual",
            DateRange::new(date!(2012 - 05 - 01), date!(2013 - 05 - 01)),
            dec!(2399.95),
        );
        let adjustment = InvoiceItem::item_adj(
            billed.invoice_id,
            billed.account_id,
            billed.id,
            date!(2012 - 05 - 10),
            dec!(-10),
            Currency::Usd,
            datetime!(2012-05-10 00:00 UTC),
        );

        let proposal = engine().reconcile(
            &subscription,
            &[billed.clone(), adjustment],
            date!(2012 - 05 - 10),
            RepairStrategy::FullRepair,
        );

        assert_eq!(proposal.repairs.len(), 1);
        assert_eq!(proposal.repairs[0].amount, dec!(2389.95));
        assert_eq!(
            proposal.repairs[0].range,
            DateRange::new(date!(2012 - 05 - 01), date!(2013 - 05 - 01))
        );

        assert_eq!(proposal.new_charges.len(), 1);
        assert_eq!(proposal.new_charges[0].plan, "shotgun-monthly");
        assert_eq!(proposal.new_charges[0].amount, dec!(249.95));
    }

    #[test]
    fn test_fully_adjusted_item_yields_no_repair() {
        // Cancellation of an item whose value was entirely consumed by an
        // adjustment: nothing to repair, nothing to re-invoice
        let subscription = timeline(
            date!(2012 - 05 - 01),
            vec![monthly(
                "shotgun-monthly",
                dec!(249.95),
                OpenEndedRange::between(date!(2012 - 05 - 01), date!(2012 - 05 - 10)),
            )],
        );
        let billed = recurring_item(
            subscription.subscription_id,
            "shotgun-monthly",
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            dec!(249.95),
        );
        let adjustment = InvoiceItem::item_adj(
            billed.invoice_id,
            billed.account_id,
            billed.id,
            date!(2012 - 05 - 09),
            dec!(-249.95),
            Currency::Usd,
            datetime!(2012-05-09 00:00 UTC),
        );
        let proposal = engine().reconcile(
            &subscription,
            &[billed, adjustment],
            date!(2012 - 05 - 10),
            RepairStrategy::PartialRepair,
        );
        assert!(proposal.is_empty());
    }

    #[test]
    fn test_prior_repair_not_repaired_twice() {
        let subscription = timeline(
            date!(2012 - 05 - 01),
            vec![
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
        );
        let billed = recurring_item(
            subscription.subscription_id,
            "shotgun-monthly",
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            dec!(249.95),
        );
        let prior_repair = InvoiceItem::repair_adj(
            billed.invoice_id,
            billed.account_id,
            subscription.subscription_id,
            billed.id,
            DateRange::new(date!(2012 - 05 - 02), date!(2012 - 06 - 01)),
            dec!(-241.88),
            Currency::Usd,
            datetime!(2012-05-02 00:00 UTC),
        );
        let new_item = recurring_item(
            subscription.subscription_id,
            "blowdart-monthly",
            DateRange::new(date!(2012 - 05 - 02), date!(2012 - 06 - 01)),
            dec!(9.63),
        );

        let proposal = engine().reconcile(
            &subscription,
            &[billed, prior_repair, new_item],
            date!(2012 - 05 - 02),
            RepairStrategy::PartialRepair,
        );
        assert!(proposal.is_empty());
    }

    #[test]
    fn test_subtract_ranges() {
        let target = DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01));
        let covered = vec![DateRange::new(date!(2012 - 05 - 10), date!(2012 - 05 - 20))];
        let holes = subtract_ranges(target, &covered);
        assert_eq!(
            holes,
            vec![
                DateRange::new(date!(2012 - 05 - 01), date!(2012 - 05 - 10)),
                DateRange::new(date!(2012 - 05 - 20), date!(2012 - 06 - 01)),
            ]
        );
        assert!(subtract_ranges(target, &[target]).is_empty());
        assert_eq!(subtract_ranges(target, &[]), vec![target]);
    }
}
