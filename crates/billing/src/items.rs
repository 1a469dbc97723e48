//! Invoice item model
//!
//! Items are immutable value types on an invoice timeline. Nothing is ever
//! edited in place: a charge is reversed by inserting an adjustment item of
//! a different kind (ITEM_ADJ, REPAIR_ADJ) and account credit moves through
//! CBA_ADJ entries. The item kind is a closed enum so the calculator and the
//! repair engine match on it exhaustively; adding a kind without classifying
//! it is a compile error.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use rebill_shared::{Currency, DateRange};

/// Kind of invoice item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceItemType {
    /// One-off charge at a fixed price (e.g. setup fee, trial phase)
    Fixed,
    /// Recurring subscription charge for a billing period
    Recurring,
    /// Charge injected from outside the subscription timeline
    ExternalCharge,
    /// Manual adjustment against a specific item (always negative)
    ItemAdj,
    /// Reversal of previously billed but no-longer-valid coverage (negative)
    RepairAdj,
    /// Account-balance credit gained (positive) or consumed (negative)
    CbaAdj,
    /// Invoice-level credit (negative; paired with a CBA_ADJ when created
    /// through the credit API)
    CreditAdj,
    /// Adjustment recording a refund against the invoice
    RefundAdj,
}

impl InvoiceItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceItemType::Fixed => "FIXED",
            InvoiceItemType::Recurring => "RECURRING",
            InvoiceItemType::ExternalCharge => "EXTERNAL_CHARGE",
            InvoiceItemType::ItemAdj => "ITEM_ADJ",
            InvoiceItemType::RepairAdj => "REPAIR_ADJ",
            InvoiceItemType::CbaAdj => "CBA_ADJ",
            InvoiceItemType::CreditAdj => "CREDIT_ADJ",
            InvoiceItemType::RefundAdj => "REFUND_ADJ",
        }
    }

    /// Regular line item (a charge)
    pub fn is_charge(&self) -> bool {
        match self {
            InvoiceItemType::Fixed
            | InvoiceItemType::Recurring
            | InvoiceItemType::ExternalCharge => true,
            InvoiceItemType::ItemAdj
            | InvoiceItemType::RepairAdj
            | InvoiceItemType::CbaAdj
            | InvoiceItemType::CreditAdj
            | InvoiceItemType::RefundAdj => false,
        }
    }

    /// Adjustment scoped to one item
    pub fn is_item_adjustment(&self) -> bool {
        matches!(self, InvoiceItemType::ItemAdj | InvoiceItemType::RepairAdj)
    }

    /// Account credit, gained or consumed
    pub fn is_account_credit(&self) -> bool {
        matches!(self, InvoiceItemType::CbaAdj)
    }
}

impl std::fmt::Display for InvoiceItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable invoice line item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub account_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub item_type: InvoiceItemType,
    /// Plan the charge belongs to; `None` for adjustments and credits
    pub plan: Option<String>,
    pub start_date: Date,
    /// `None` for one-off charges and point-in-time adjustments
    pub end_date: Option<Date>,
    /// Signed, currency-scaled amount
    pub amount: Decimal,
    pub currency: Currency,
    /// For ITEM_ADJ / REPAIR_ADJ: the item being adjusted or repaired.
    /// For CBA_ADJ created by a repair: the repair item it offsets.
    pub linked_item_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

impl InvoiceItem {
    #[allow(clippy::too_many_arguments)]
    fn new(
        invoice_id: Uuid,
        account_id: Uuid,
        subscription_id: Option<Uuid>,
        item_type: InvoiceItemType,
        plan: Option<String>,
        start_date: Date,
        end_date: Option<Date>,
        amount: Decimal,
        currency: Currency,
        linked_item_id: Option<Uuid>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            account_id,
            subscription_id,
            item_type,
            plan,
            start_date,
            end_date,
            amount,
            currency,
            linked_item_id,
            created_at,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn recurring(
        invoice_id: Uuid,
        account_id: Uuid,
        subscription_id: Uuid,
        plan: &str,
        range: DateRange,
        amount: Decimal,
        currency: Currency,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            Some(subscription_id),
            InvoiceItemType::Recurring,
            Some(plan.to_string()),
            range.start,
            Some(range.end),
            amount,
            currency,
            None,
            created_at,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn fixed(
        invoice_id: Uuid,
        account_id: Uuid,
        subscription_id: Uuid,
        plan: &str,
        date: Date,
        amount: Decimal,
        currency: Currency,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            Some(subscription_id),
            InvoiceItemType::Fixed,
            Some(plan.to_string()),
            date,
            None,
            amount,
            currency,
            None,
            created_at,
        )
    }

    pub fn external_charge(
        invoice_id: Uuid,
        account_id: Uuid,
        date: Date,
        amount: Decimal,
        currency: Currency,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            None,
            InvoiceItemType::ExternalCharge,
            None,
            date,
            None,
            amount,
            currency,
            None,
            created_at,
        )
    }

    /// Manual adjustment against `linked_item_id`; `amount` must already be
    /// negative
    #[allow(clippy::too_many_arguments)]
    pub fn item_adj(
        invoice_id: Uuid,
        account_id: Uuid,
        linked_item_id: Uuid,
        date: Date,
        amount: Decimal,
        currency: Currency,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            None,
            InvoiceItemType::ItemAdj,
            None,
            date,
            None,
            amount,
            currency,
            Some(linked_item_id),
            created_at,
        )
    }

    /// Repair of previously billed coverage over `range`; `amount` negative
    #[allow(clippy::too_many_arguments)]
    pub fn repair_adj(
        invoice_id: Uuid,
        account_id: Uuid,
        subscription_id: Uuid,
        linked_item_id: Uuid,
        range: DateRange,
        amount: Decimal,
        currency: Currency,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            Some(subscription_id),
            InvoiceItemType::RepairAdj,
            None,
            range.start,
            Some(range.end),
            amount,
            currency,
            Some(linked_item_id),
            created_at,
        )
    }

    /// Account-credit movement dated `date`; positive = gained, negative =
    /// consumed
    pub fn cba_adj(
        invoice_id: Uuid,
        account_id: Uuid,
        date: Date,
        amount: Decimal,
        currency: Currency,
        linked_item_id: Option<Uuid>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            None,
            InvoiceItemType::CbaAdj,
            None,
            date,
            Some(date),
            amount,
            currency,
            linked_item_id,
            created_at,
        )
    }

    /// Invoice-level credit; `amount` negative
    pub fn credit_adj(
        invoice_id: Uuid,
        account_id: Uuid,
        date: Date,
        amount: Decimal,
        currency: Currency,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            None,
            InvoiceItemType::CreditAdj,
            None,
            date,
            None,
            amount,
            currency,
            None,
            created_at,
        )
    }

    pub fn refund_adj(
        invoice_id: Uuid,
        account_id: Uuid,
        date: Date,
        amount: Decimal,
        currency: Currency,
        created_at: OffsetDateTime,
    ) -> Self {
        Self::new(
            invoice_id,
            account_id,
            None,
            InvoiceItemType::RefundAdj,
            None,
            date,
            None,
            amount,
            currency,
            None,
            created_at,
        )
    }

    /// Coverage range, when the item spans one
    pub fn range(&self) -> Option<DateRange> {
        self.end_date.map(|end| DateRange::new(self.start_date, end))
    }
}

/// Invoice aggregate: an ordered sequence of items. Immutable once persisted
/// except for appended adjustment items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub account_id: Uuid,
    pub invoice_date: Date,
    pub target_date: Date,
    pub currency: Currency,
    pub items: Vec<InvoiceItem>,
    /// Migrated from an external system; excluded from payment runs
    pub migration: bool,
}

impl Invoice {
    pub fn new(account_id: Uuid, invoice_date: Date, target_date: Date, currency: Currency) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            invoice_date,
            target_date,
            currency,
            items: Vec::new(),
            migration: false,
        }
    }

    pub fn find_item(&self, item_id: Uuid) -> Option<&InvoiceItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Items linked (by ITEM_ADJ / REPAIR_ADJ) to the given item
    pub fn items_linked_to(&self, item_id: Uuid) -> impl Iterator<Item = &InvoiceItem> {
        self.items
            .iter()
            .filter(move |i| i.linked_item_id == Some(item_id))
    }
}

/// Kind of payment row attached to an invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoicePaymentType {
    /// A (successful) payment attempt; positive amount
    Attempt,
    /// Money returned to the payer; negative amount
    Refund,
    /// Chargeback initiated by the payer's bank; negative amount
    ChargedBack,
}

/// Payment row as seen from the invoice side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePayment {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_type: InvoicePaymentType,
    pub amount: Decimal,
    pub currency: Currency,
    pub payment_date: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::{date, datetime};

    #[test]
    fn test_charge_classification_is_exhaustive() {
        let charges = [
            InvoiceItemType::Fixed,
            InvoiceItemType::Recurring,
            InvoiceItemType::ExternalCharge,
        ];
        for t in charges {
            assert!(t.is_charge(), "{t} should be a charge");
            assert!(!t.is_item_adjustment());
            assert!(!t.is_account_credit());
        }
        assert!(InvoiceItemType::ItemAdj.is_item_adjustment());
        assert!(InvoiceItemType::RepairAdj.is_item_adjustment());
        assert!(InvoiceItemType::CbaAdj.is_account_credit());
        assert!(!InvoiceItemType::CreditAdj.is_charge());
        assert!(!InvoiceItemType::RefundAdj.is_charge());
    }

    #[test]
    fn test_recurring_item_range() {
        let invoice_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let item = InvoiceItem::recurring(
            invoice_id,
            account_id,
            Uuid::new_v4(),
            "shotgun-monthly",
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            dec!(249.95),
            Currency::Usd,
            datetime!(2012-05-01 00:00 UTC),
        );
        assert_eq!(item.range().unwrap().days(), 31);
        assert_eq!(item.item_type, InvoiceItemType::Recurring);
    }

    #[test]
    fn test_items_linked_to() {
        let mut invoice = Invoice::new(
            Uuid::new_v4(),
            date!(2012 - 05 - 01),
            date!(2012 - 05 - 01),
            Currency::Usd,
        );
        let charge = InvoiceItem::recurring(
            invoice.id,
            invoice.account_id,
            Uuid::new_v4(),
            "shotgun-monthly",
            DateRange::new(date!(2012 - 05 - 01), date!(2012 - 06 - 01)),
            dec!(249.95),
            Currency::Usd,
            datetime!(2012-05-01 00:00 UTC),
        );
        let adj = InvoiceItem::item_adj(
            invoice.id,
            invoice.account_id,
            charge.id,
            date!(2012 - 05 - 02),
            dec!(-10),
            Currency::Usd,
            datetime!(2012-05-02 00:00 UTC),
        );
        invoice.items.push(charge.clone());
        invoice.items.push(adj);
        assert_eq!(invoice.items_linked_to(charge.id).count(), 1);
    }
}
