//! Invoice calculator
//!
//! Pure, side-effect-free functions over already-loaded item and payment
//! slices. All persistence and event posting stays in the dispatcher and
//! payment layers; nothing here does I/O.
//!
//! Sign conventions: charges are positive, adjustments (ITEM_ADJ,
//! REPAIR_ADJ, CREDIT_ADJ) negative, CBA_ADJ positive when credit is gained
//! and negative when consumed. ATTEMPT payments carry positive amounts,
//! REFUND/CHARGED_BACK rows negative ones.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use rebill_shared::MoneyConfig;

use crate::items::{InvoiceItem, InvoiceItemType, InvoicePayment, InvoicePaymentType};

/// Invoice-level adjustment: REFUND_ADJ, or CREDIT_ADJ unless the only other
/// item on the invoice is its own equal-and-opposite CBA_ADJ.
///
/// The CREDIT_ADJ carve-out is a documented special case inherited from the
/// upstream accounting behavior: a credit that was immediately and fully
/// consumed on its own invoice is reported as "adjusted for account credit"
/// (see [`amount_adjusted_for_account_credit`]) instead of as an invoice
/// adjustment, so it is not counted twice. Do not generalize it.
fn is_invoice_adjustment(item: &InvoiceItem, others: &[&InvoiceItem]) -> bool {
    match item.item_type {
        InvoiceItemType::RefundAdj => true,
        InvoiceItemType::CreditAdj => !is_self_consumed_credit(item, others),
        _ => false,
    }
}

fn is_self_consumed_credit(item: &InvoiceItem, others: &[&InvoiceItem]) -> bool {
    others.len() == 1
        && others[0].item_type == InvoiceItemType::CbaAdj
        && others[0].invoice_id == item.invoice_id
        && others[0].amount == -item.amount
}

fn others_of<'a>(items: &'a [InvoiceItem], item: &InvoiceItem) -> Vec<&'a InvoiceItem> {
    items.iter().filter(|other| other.id != item.id).collect()
}

/// Charges + invoice-level adjustments + item adjustments
pub fn amount_charged(config: &MoneyConfig, items: &[InvoiceItem]) -> Decimal {
    let mut total = Decimal::ZERO;
    for item in items {
        let others = others_of(items, item);
        if item.item_type.is_charge()
            || item.item_type.is_item_adjustment()
            || is_invoice_adjustment(item, &others)
        {
            total += item.amount;
        }
    }
    config.round(total)
}

/// Charges created at invoice creation time (the invoice's original face
/// value, before later repairs and adjustments were appended)
pub fn original_amount_charged(
    config: &MoneyConfig,
    invoice_created_at: OffsetDateTime,
    items: &[InvoiceItem],
) -> Decimal {
    let total: Decimal = items
        .iter()
        .filter(|item| item.item_type.is_charge() && item.created_at == invoice_created_at)
        .map(|item| item.amount)
        .sum();
    config.round(total)
}

/// Account credit gained (positive) or consumed (negative) on the invoice
pub fn amount_credited(config: &MoneyConfig, items: &[InvoiceItem]) -> Decimal {
    let total: Decimal = items
        .iter()
        .filter(|item| item.item_type.is_account_credit())
        .map(|item| item.amount)
        .sum();
    config.round(total)
}

/// The add-back for a CREDIT_ADJ whose only sibling is its own
/// equal-and-opposite CBA_ADJ (see [`is_invoice_adjustment`])
pub fn amount_adjusted_for_account_credit(config: &MoneyConfig, items: &[InvoiceItem]) -> Decimal {
    let mut total = Decimal::ZERO;
    for item in items {
        if item.item_type != InvoiceItemType::CreditAdj {
            continue;
        }
        let others = others_of(items, item);
        if is_self_consumed_credit(item, &others) {
            total += item.amount;
        }
    }
    config.round(total)
}

/// Sum of ATTEMPT payments
pub fn amount_paid(config: &MoneyConfig, payments: &[InvoicePayment]) -> Decimal {
    let total: Decimal = payments
        .iter()
        .filter(|p| p.payment_type == InvoicePaymentType::Attempt)
        .map(|p| p.amount)
        .sum();
    config.round(total)
}

/// Sum of REFUND and CHARGED_BACK payments (negative by convention)
pub fn amount_refunded(config: &MoneyConfig, payments: &[InvoicePayment]) -> Decimal {
    let total: Decimal = payments
        .iter()
        .filter(|p| {
            matches!(
                p.payment_type,
                InvoicePaymentType::Refund | InvoicePaymentType::ChargedBack
            )
        })
        .map(|p| p.amount)
        .sum();
    config.round(total)
}

/// balance = charged + credited + adjusted-for-account-credit − paid − refunded
pub fn balance(
    config: &MoneyConfig,
    items: &[InvoiceItem],
    payments: &[InvoicePayment],
) -> Decimal {
    config.round(
        amount_charged(config, items)
            + amount_credited(config, items)
            + amount_adjusted_for_account_credit(config, items)
            - amount_paid(config, payments)
            - amount_refunded(config, payments),
    )
}

/// One effective-dated tax factor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxFactor {
    pub effective: Date,
    pub factor: Decimal,
}

/// Reverse-chronological table of effective-dated tax factors.
///
/// The factor applied to a date is the first entry whose effective date is
/// strictly before it; dates before the earliest entry use factor 1. The
/// table is deployment configuration, not engine logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaxFactorTable {
    entries: Vec<TaxFactor>,
}

impl TaxFactorTable {
    pub fn new(mut entries: Vec<TaxFactor>) -> Self {
        entries.sort_by(|a, b| b.effective.cmp(&a.effective));
        Self { entries }
    }

    /// Historical Netherlands VAT factors shipped by the upstream system;
    /// provided for parity, nothing in the engine depends on it
    pub fn netherlands() -> Self {
        #[allow(clippy::expect_used)] // literal table entries
        fn entry(year: i32, month: u8, day: u8, factor: &str) -> TaxFactor {
            TaxFactor {
                effective: Date::from_calendar_date(
                    year,
                    time::Month::try_from(month).expect("literal month"),
                    day,
                )
                .expect("literal date"),
                factor: factor.parse().expect("literal factor"),
            }
        }
        Self::new(vec![
            entry(1969, 1, 1, "1.12"),
            entry(1971, 1, 1, "1.14"),
            entry(1973, 1, 1, "1.16"),
            entry(1976, 10, 1, "1.18"),
            entry(1984, 1, 1, "1.19"),
            entry(1986, 10, 1, "1.20"),
            entry(1989, 1, 1, "1.185"),
            entry(1992, 10, 1, "1.175"),
            entry(2001, 1, 1, "1.19"),
            entry(2012, 10, 1, "1.21"),
        ])
    }

    pub fn factor_for(&self, date: Date) -> Decimal {
        self.entries
            .iter()
            .find(|entry| entry.effective < date)
            .map(|entry| entry.factor)
            .unwrap_or(Decimal::ONE)
    }
}

/// Strip tax from a gross amount using the factor in effect at `date`
pub fn amount_excl_tax(
    config: &MoneyConfig,
    table: &TaxFactorTable,
    amount: Decimal,
    date: Date,
) -> Decimal {
    config.round(amount / table.factor_for(date))
}
