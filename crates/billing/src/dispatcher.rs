//! Invoice dispatcher
//!
//! Runs one generation pass for one account at one target date: resolves
//! the account and its time zone, reconciles every subscription timeline
//! through the repair engine, persists the outcome and posts notification
//! events. Also hosts the explicit item APIs (credits, external charges,
//! item adjustments).
//!
//! Account-credit movements are derived here, not in the engine: appending
//! a repair or adjustment to a paid invoice drives its balance negative,
//! and rebalancing converts that overpayment into a CBA_ADJ credit; a new
//! invoice then consumes available credit with a negative CBA_ADJ. This is
//! what produces the equal-and-opposite REPAIR_ADJ/CBA_ADJ pairs on
//! repaired invoices and the RECURRING/CBA_ADJ pairs netting to zero on
//! subsequent invoices.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use time::Date;
use uuid::Uuid;

use rebill_shared::{Clock, MoneyConfig};

use crate::accounts::AccountProvider;
use crate::calculator;
use crate::error::{BillingError, BillingResult};
use crate::events::{post_or_log, BusEvent, EventBus};
use crate::items::{Invoice, InvoiceItem, InvoicePayment};
use crate::locks::{AccountLockKey, AccountLocker};
use crate::repair::{RepairEngine, RepairProposal, RepairStrategy};
use crate::store::InvoiceStore;
use crate::tags::{ControlTag, TagStore};
use crate::timeline::ProposedChargeKind;

/// Engine-wide configuration
#[derive(Debug, Clone, Copy)]
pub struct BillingConfig {
    pub money: MoneyConfig,
    /// Strategy used when the generation call does not pass one; kept as
    /// call-site configuration, overridable per call for operational
    /// recovery
    pub default_repair_strategy: RepairStrategy,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            money: MoneyConfig::default(),
            default_repair_strategy: RepairStrategy::PartialRepair,
        }
    }
}

impl BillingConfig {
    /// Read `REBILL_MONEY_*` and `REBILL_REPAIR_STRATEGY`
    pub fn from_env() -> Self {
        let default_repair_strategy = std::env::var("REBILL_REPAIR_STRATEGY")
            .map(|v| RepairStrategy::from_string(&v))
            .unwrap_or_default();
        Self {
            money: MoneyConfig::from_env(),
            default_repair_strategy,
        }
    }
}

/// Outcome of a generation pass that found work to do
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceGenerationResult {
    /// The newly generated invoice, when any new charges were owed
    pub invoice: Option<Invoice>,
    /// Prior invoices that received appended repair/CBA items, in their
    /// post-append state
    pub adjusted_invoices: Vec<Invoice>,
}

/// Invoice generation and item APIs
pub struct InvoiceService {
    invoices: Arc<dyn InvoiceStore>,
    accounts: Arc<dyn AccountProvider>,
    tags: Arc<dyn TagStore>,
    bus: Arc<dyn EventBus>,
    locker: Arc<AccountLocker>,
    clock: Arc<dyn Clock>,
    engine: RepairEngine,
    config: BillingConfig,
}

impl InvoiceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        accounts: Arc<dyn AccountProvider>,
        tags: Arc<dyn TagStore>,
        bus: Arc<dyn EventBus>,
        locker: Arc<AccountLocker>,
        clock: Arc<dyn Clock>,
        config: BillingConfig,
    ) -> Self {
        Self {
            invoices,
            accounts,
            tags,
            bus,
            locker,
            clock,
            engine: RepairEngine::new(config.money),
            config,
        }
    }

    /// Generate (or dry-run) the next invoice for an account at a target
    /// date.
    ///
    /// Returns `NOTHING_TO_INVOICE` when reconciliation finds no new
    /// charges and no coverage in need of repair; callers treat that as a
    /// distinguishable empty result, not a failure.
    pub async fn generate_invoice(
        &self,
        account_id: Uuid,
        target_date: Date,
        strategy: Option<RepairStrategy>,
        dry_run: bool,
    ) -> BillingResult<InvoiceGenerationResult> {
        let account = self.accounts.account(account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        if self
            .tags
            .is_tagged(account_id, ControlTag::AutoInvoicingOff)
            .await?
        {
            tracing::info!(account_id = %account_id, "Skipping generation: AUTO_INVOICING_OFF");
            return Err(BillingError::NothingToInvoice(account_id));
        }

        let invoices = self.invoices.invoices_by_account(account_id).await?;
        let mut payments_by_invoice: HashMap<Uuid, Vec<InvoicePayment>> = HashMap::new();
        for invoice in &invoices {
            payments_by_invoice
                .insert(invoice.id, self.invoices.invoice_payments(invoice.id).await?);
        }
        let all_items: Vec<InvoiceItem> = invoices
            .iter()
            .flat_map(|invoice| invoice.items.iter().cloned())
            .collect();

        let strategy = strategy.unwrap_or(self.config.default_repair_strategy);
        let mut proposal = RepairProposal::default();
        for timeline in self.accounts.timelines(account_id).await? {
            let piece = self
                .engine
                .reconcile(&timeline, &all_items, target_date, strategy);
            proposal.repairs.extend(piece.repairs);
            proposal.new_charges.extend(piece.new_charges);
        }

        if proposal.is_empty() {
            tracing::debug!(
                account_id = %account_id,
                target_date = %target_date,
                "Nothing to invoice"
            );
            return Err(BillingError::NothingToInvoice(account_id));
        }

        let now = self.clock.now_utc();
        let today = self.clock.today_in(account.time_zone);
        let money = &self.config.money;

        // Append repairs to the invoices that hold the repaired items, then
        // rebalance each: a negative balance becomes account credit
        let mut adjusted: Vec<(Invoice, Vec<InvoiceItem>)> = Vec::new();
        for repair in &proposal.repairs {
            let index = match adjusted
                .iter()
                .position(|(invoice, _)| invoice.id == repair.invoice_id)
            {
                Some(index) => index,
                None => {
                    let invoice = invoices
                        .iter()
                        .find(|invoice| invoice.id == repair.invoice_id)
                        .cloned()
                        .ok_or(BillingError::NoSuchInvoice(repair.invoice_id))?;
                    adjusted.push((invoice, Vec::new()));
                    adjusted.len() - 1
                }
            };
            let (invoice, appended) = &mut adjusted[index];
            let item = InvoiceItem::repair_adj(
                invoice.id,
                account_id,
                repair.subscription_id,
                repair.repaired_item_id,
                repair.range,
                -repair.amount,
                account.currency,
                now,
            );
            invoice.items.push(item.clone());
            appended.push(item);
        }
        for (invoice, appended) in &mut adjusted {
            let payments = payments_by_invoice
                .get(&invoice.id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let balance = calculator::balance(money, &invoice.items, payments);
            if balance < Decimal::ZERO {
                let credit = InvoiceItem::cba_adj(
                    invoice.id,
                    account_id,
                    today,
                    -balance,
                    account.currency,
                    None,
                    now,
                );
                invoice.items.push(credit.clone());
                appended.push(credit);
            }
        }

        // Available account credit, with this pass's rebalancing included
        let mut account_credit = Decimal::ZERO;
        for invoice in &invoices {
            if !adjusted.iter().any(|(adj, _)| adj.id == invoice.id) {
                account_credit += calculator::amount_credited(money, &invoice.items);
            }
        }
        for (invoice, _) in &adjusted {
            account_credit += calculator::amount_credited(money, &invoice.items);
        }

        let new_invoice = if proposal.new_charges.is_empty() {
            None
        } else {
            let mut invoice = Invoice::new(account_id, today, target_date, account.currency);
            for charge in &proposal.new_charges {
                let item = match charge.kind {
                    ProposedChargeKind::Recurring => InvoiceItem::recurring(
                        invoice.id,
                        account_id,
                        charge.subscription_id,
                        &charge.plan,
                        charge.charged,
                        charge.amount,
                        account.currency,
                        now,
                    ),
                    ProposedChargeKind::Fixed => InvoiceItem::fixed(
                        invoice.id,
                        account_id,
                        charge.subscription_id,
                        &charge.plan,
                        charge.charged.start,
                        charge.amount,
                        account.currency,
                        now,
                    ),
                };
                invoice.items.push(item);
            }
            let charged = calculator::amount_charged(money, &invoice.items);
            let consumed = account_credit.min(charged);
            if consumed > Decimal::ZERO {
                invoice.items.push(InvoiceItem::cba_adj(
                    invoice.id,
                    account_id,
                    today,
                    -consumed,
                    account.currency,
                    None,
                    now,
                ));
            }
            Some(invoice)
        };

        let result = InvoiceGenerationResult {
            invoice: new_invoice.clone(),
            adjusted_invoices: adjusted.iter().map(|(invoice, _)| invoice.clone()).collect(),
        };

        if dry_run {
            return Ok(result);
        }

        if let Some(invoice) = &new_invoice {
            self.invoices.insert_invoice_with_items(invoice.clone()).await?;
        }
        for (invoice, appended) in &adjusted {
            self.invoices
                .append_invoice_items(invoice.id, appended.clone())
                .await?;
        }

        tracing::info!(
            account_id = %account_id,
            target_date = %target_date,
            strategy = strategy.as_str(),
            new_invoice = ?new_invoice.as_ref().map(|invoice| invoice.id),
            adjusted = adjusted.len(),
            "Generated invoice pass"
        );

        // Adjusting a previously-paid invoice triggers overdue
        // re-evaluation; delivery is at-least-once and consumers dedupe
        for (invoice, _) in &adjusted {
            let was_paid = payments_by_invoice
                .get(&invoice.id)
                .is_some_and(|payments| !payments.is_empty());
            if was_paid {
                post_or_log(
                    self.bus.as_ref(),
                    BusEvent::InvoiceAdjustment {
                        account_id,
                        invoice_id: invoice.id,
                    },
                )
                .await;
            }
        }
        if let Some(invoice) = &new_invoice {
            post_or_log(
                self.bus.as_ref(),
                BusEvent::InvoiceCreation {
                    account_id,
                    invoice_id: invoice.id,
                    amount: calculator::amount_charged(money, &invoice.items),
                },
            )
            .await;
        }

        Ok(result)
    }

    /// Create an account credit: a CREDIT_ADJ paired with its CBA_ADJ on a
    /// fresh invoice. `amount` must be strictly positive.
    pub async fn insert_credit(
        &self,
        account_id: Uuid,
        amount: Decimal,
        effective_date: Date,
    ) -> BillingResult<Invoice> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::AmountInvalid(amount.to_string()));
        }
        let account = self.accounts.account(account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        let now = self.clock.now_utc();
        let today = self.clock.today_in(account.time_zone);
        let amount = self.config.money.round(amount);
        let mut invoice = Invoice::new(account_id, today, effective_date, account.currency);
        invoice.items.push(InvoiceItem::credit_adj(
            invoice.id,
            account_id,
            effective_date,
            -amount,
            account.currency,
            now,
        ));
        invoice.items.push(InvoiceItem::cba_adj(
            invoice.id,
            account_id,
            effective_date,
            amount,
            account.currency,
            None,
            now,
        ));
        self.invoices.insert_invoice_with_items(invoice.clone()).await?;

        tracing::info!(account_id = %account_id, amount = %amount, "Inserted account credit");
        post_or_log(
            self.bus.as_ref(),
            BusEvent::InvoiceCreation {
                account_id,
                invoice_id: invoice.id,
                amount: Decimal::ZERO,
            },
        )
        .await;
        Ok(invoice)
    }

    /// Create an external charge on a fresh invoice, consuming available
    /// account credit. `amount` must be strictly positive.
    pub async fn insert_external_charge(
        &self,
        account_id: Uuid,
        amount: Decimal,
        effective_date: Date,
    ) -> BillingResult<Invoice> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::AmountInvalid(amount.to_string()));
        }
        let account = self.accounts.account(account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        let now = self.clock.now_utc();
        let today = self.clock.today_in(account.time_zone);
        let amount = self.config.money.round(amount);
        let mut invoice = Invoice::new(account_id, today, effective_date, account.currency);
        invoice.items.push(InvoiceItem::external_charge(
            invoice.id,
            account_id,
            effective_date,
            amount,
            account.currency,
            now,
        ));

        let credit = self.account_credit(account_id).await?;
        let consumed = credit.min(amount);
        if consumed > Decimal::ZERO {
            invoice.items.push(InvoiceItem::cba_adj(
                invoice.id,
                account_id,
                today,
                -consumed,
                account.currency,
                None,
                now,
            ));
        }
        self.invoices.insert_invoice_with_items(invoice.clone()).await?;

        tracing::info!(account_id = %account_id, amount = %amount, "Inserted external charge");
        post_or_log(
            self.bus.as_ref(),
            BusEvent::InvoiceCreation {
                account_id,
                invoice_id: invoice.id,
                amount,
            },
        )
        .await;
        Ok(invoice)
    }

    /// Adjust one invoice item by a positive `amount`, capped by what the
    /// item has left after prior adjustments
    pub async fn insert_item_adjustment(
        &self,
        account_id: Uuid,
        invoice_id: Uuid,
        item_id: Uuid,
        amount: Decimal,
        effective_date: Date,
    ) -> BillingResult<InvoiceItem> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::AmountInvalid(amount.to_string()));
        }
        let account = self.accounts.account(account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        let mut invoice = self.invoices.invoice(invoice_id).await?;
        if invoice.account_id != account_id {
            return Err(BillingError::NoSuchInvoice(invoice_id));
        }
        let item = invoice
            .find_item(item_id)
            .ok_or(BillingError::NoSuchInvoiceItem(item_id))?;
        if !item.item_type.is_charge() {
            return Err(BillingError::AmountInvalid(format!(
                "item {item_id} is a {} and cannot be adjusted",
                item.item_type
            )));
        }
        let prior: Decimal = invoice
            .items_linked_to(item_id)
            .filter(|linked| linked.item_type.is_item_adjustment())
            .map(|linked| linked.amount)
            .sum();
        let remaining = item.amount + prior;
        let amount = self.config.money.round(amount);
        if amount > remaining {
            return Err(BillingError::AmountInvalid(format!(
                "adjustment {amount} exceeds remaining {remaining}"
            )));
        }

        let now = self.clock.now_utc();
        let today = self.clock.today_in(account.time_zone);
        let adjustment = InvoiceItem::item_adj(
            invoice_id,
            account_id,
            item_id,
            effective_date,
            -amount,
            account.currency,
            now,
        );
        let mut appended = vec![adjustment.clone()];
        invoice.items.push(adjustment.clone());

        // Rebalance: an adjustment on a paid invoice surfaces as credit
        let payments = self.invoices.invoice_payments(invoice_id).await?;
        let balance = calculator::balance(&self.config.money, &invoice.items, &payments);
        if balance < Decimal::ZERO {
            appended.push(InvoiceItem::cba_adj(
                invoice_id,
                account_id,
                today,
                -balance,
                account.currency,
                None,
                now,
            ));
        }
        self.invoices.append_invoice_items(invoice_id, appended).await?;

        tracing::info!(
            account_id = %account_id,
            invoice_id = %invoice_id,
            item_id = %item_id,
            amount = %amount,
            "Inserted item adjustment"
        );
        post_or_log(
            self.bus.as_ref(),
            BusEvent::InvoiceAdjustment {
                account_id,
                invoice_id,
            },
        )
        .await;
        Ok(adjustment)
    }

    /// Sum of unpaid balances across the account's invoices
    pub async fn account_balance(&self, account_id: Uuid) -> BillingResult<Decimal> {
        let invoices = self.invoices.invoices_by_account(account_id).await?;
        let mut total = Decimal::ZERO;
        for invoice in &invoices {
            let payments = self.invoices.invoice_payments(invoice.id).await?;
            total += calculator::balance(&self.config.money, &invoice.items, &payments);
        }
        Ok(self.config.money.round(total))
    }

    /// Account credit currently available (sum of all CBA_ADJ items)
    pub async fn account_credit(&self, account_id: Uuid) -> BillingResult<Decimal> {
        let invoices = self.invoices.invoices_by_account(account_id).await?;
        let total = invoices
            .iter()
            .map(|invoice| calculator::amount_credited(&self.config.money, &invoice.items))
            .sum();
        Ok(self.config.money.round(total))
    }
}
