//! Persistence gateway
//!
//! Narrow contracts the engine persists through. Each operation is assumed
//! durable and transactional at the single-aggregate level; the engine
//! never needs cross-aggregate transactions because per-account ordering
//! comes from the account lock.
//!
//! `InMemoryStore` backs tests and standalone deployments; a production
//! deployment implements these traits over its own database.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use rebill_shared::Currency;

use crate::error::{BillingError, BillingResult};
use crate::items::{Invoice, InvoiceItem, InvoicePayment};
use crate::payment::{Payment, PaymentAttempt, PaymentStatus};

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice>;

    /// All invoices for the account, in insertion order
    async fn invoices_by_account(&self, account_id: Uuid) -> BillingResult<Vec<Invoice>>;

    /// Persist a new invoice and its items in one transaction
    async fn insert_invoice_with_items(&self, invoice: Invoice) -> BillingResult<()>;

    /// Append adjustment items (REPAIR_ADJ, CBA_ADJ, ITEM_ADJ) to an
    /// existing invoice; the only permitted mutation of a persisted invoice
    async fn append_invoice_items(
        &self,
        invoice_id: Uuid,
        items: Vec<InvoiceItem>,
    ) -> BillingResult<()>;

    async fn record_invoice_payment(&self, payment: InvoicePayment) -> BillingResult<()>;

    async fn invoice_payments(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoicePayment>>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>>;

    async fn payments_for_account(&self, account_id: Uuid) -> BillingResult<Vec<Payment>>;

    /// Attempts in insertion order; indexed by payment id so the scan is
    /// O(attempts-for-this-payment)
    async fn attempts_for_payment(&self, payment_id: Uuid) -> BillingResult<Vec<PaymentAttempt>>;

    async fn insert_payment_with_first_attempt(
        &self,
        payment: Payment,
        attempt: PaymentAttempt,
    ) -> BillingResult<()>;

    async fn update_payment_with_new_attempt(
        &self,
        payment_id: Uuid,
        attempt: PaymentAttempt,
    ) -> BillingResult<()>;

    /// Set the final status of a completed attempt and its payment in one
    /// transaction
    #[allow(clippy::too_many_arguments)]
    async fn update_payment_and_attempt_on_completion(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        processed_amount: Option<Decimal>,
        processed_currency: Option<Currency>,
        attempt_id: Uuid,
        gateway_error_code: Option<String>,
        gateway_error: Option<String>,
    ) -> BillingResult<()>;
}

#[derive(Default)]
struct StoreInner {
    invoices: HashMap<Uuid, Invoice>,
    invoice_order: Vec<Uuid>,
    invoice_payments: HashMap<Uuid, Vec<InvoicePayment>>,
    payments: HashMap<Uuid, Payment>,
    payment_order: Vec<Uuid>,
    attempts: HashMap<Uuid, Vec<PaymentAttempt>>,
}

/// In-memory implementation of both store traits
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl InvoiceStore for InMemoryStore {
    async fn invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.inner
            .read()
            .await
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or(BillingError::NoSuchInvoice(invoice_id))
    }

    async fn invoices_by_account(&self, account_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let inner = self.inner.read().await;
        Ok(inner
            .invoice_order
            .iter()
            .filter_map(|id| inner.invoices.get(id))
            .filter(|invoice| invoice.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn insert_invoice_with_items(&self, invoice: Invoice) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        inner.invoice_order.push(invoice.id);
        inner.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    async fn append_invoice_items(
        &self,
        invoice_id: Uuid,
        items: Vec<InvoiceItem>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        let invoice = inner
            .invoices
            .get_mut(&invoice_id)
            .ok_or(BillingError::NoSuchInvoice(invoice_id))?;
        invoice.items.extend(items);
        Ok(())
    }

    async fn record_invoice_payment(&self, payment: InvoicePayment) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.invoices.contains_key(&payment.invoice_id) {
            return Err(BillingError::NoSuchInvoice(payment.invoice_id));
        }
        inner
            .invoice_payments
            .entry(payment.invoice_id)
            .or_default()
            .push(payment);
        Ok(())
    }

    async fn invoice_payments(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoicePayment>> {
        Ok(self
            .inner
            .read()
            .await
            .invoice_payments
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn payment(&self, payment_id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.inner.read().await.payments.get(&payment_id).cloned())
    }

    async fn payments_for_account(&self, account_id: Uuid) -> BillingResult<Vec<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payment_order
            .iter()
            .filter_map(|id| inner.payments.get(id))
            .filter(|payment| payment.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn attempts_for_payment(&self, payment_id: Uuid) -> BillingResult<Vec<PaymentAttempt>> {
        Ok(self
            .inner
            .read()
            .await
            .attempts
            .get(&payment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_payment_with_first_attempt(
        &self,
        payment: Payment,
        attempt: PaymentAttempt,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        inner.payment_order.push(payment.id);
        inner.attempts.insert(payment.id, vec![attempt]);
        inner.payments.insert(payment.id, payment);
        Ok(())
    }

    async fn update_payment_with_new_attempt(
        &self,
        payment_id: Uuid,
        attempt: PaymentAttempt,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if !inner.payments.contains_key(&payment_id) {
            return Err(BillingError::NoSuchPayment(payment_id));
        }
        inner.attempts.entry(payment_id).or_default().push(attempt);
        Ok(())
    }

    async fn update_payment_and_attempt_on_completion(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        processed_amount: Option<Decimal>,
        processed_currency: Option<Currency>,
        attempt_id: Uuid,
        gateway_error_code: Option<String>,
        gateway_error: Option<String>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        let payment = inner
            .payments
            .get_mut(&payment_id)
            .ok_or(BillingError::NoSuchPayment(payment_id))?;
        payment.status = status;
        if processed_amount.is_some() {
            payment.processed_amount = processed_amount;
        }
        if processed_currency.is_some() {
            payment.processed_currency = processed_currency;
        }
        let attempts = inner
            .attempts
            .get_mut(&payment_id)
            .ok_or(BillingError::NoSuchPayment(payment_id))?;
        let attempt = attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or_else(|| {
                BillingError::Internal(format!("attempt {attempt_id} not found for {payment_id}"))
            })?;
        attempt.status = status;
        attempt.gateway_error_code = gateway_error_code;
        attempt.gateway_error = gateway_error;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::date;

    #[tokio::test]
    async fn test_invoice_round_trip_and_append() {
        let store = InMemoryStore::new();
        let account_id = Uuid::new_v4();
        let invoice = Invoice::new(
            account_id,
            date!(2012 - 05 - 01),
            date!(2012 - 05 - 01),
            Currency::Usd,
        );
        let invoice_id = invoice.id;
        store.insert_invoice_with_items(invoice).await.unwrap();

        let item = InvoiceItem::external_charge(
            invoice_id,
            account_id,
            date!(2012 - 05 - 02),
            dec!(15),
            Currency::Usd,
            time::OffsetDateTime::UNIX_EPOCH,
        );
        store
            .append_invoice_items(invoice_id, vec![item])
            .await
            .unwrap();

        let loaded = store.invoice(invoice_id).await.unwrap();
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(store.invoices_by_account(account_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_invoice_is_an_error() {
        let store = InMemoryStore::new();
        let err = store.invoice(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), "NO_SUCH_INVOICE");
    }

    #[tokio::test]
    async fn test_completion_updates_payment_and_attempt_together() {
        let store = InMemoryStore::new();
        let payment = Payment {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            payment_method_id: Uuid::new_v4(),
            requested_amount: dec!(249.95),
            currency: Currency::Usd,
            processed_amount: None,
            processed_currency: None,
            status: PaymentStatus::Init,
            effective_date: time::OffsetDateTime::UNIX_EPOCH,
        };
        let attempt = PaymentAttempt {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            account_id: payment.account_id,
            invoice_id: payment.invoice_id,
            payment_method_id: payment.payment_method_id,
            requested_amount: payment.requested_amount,
            currency: payment.currency,
            status: PaymentStatus::Init,
            gateway_error_code: None,
            gateway_error: None,
            effective_date: payment.effective_date,
        };
        let (payment_id, attempt_id) = (payment.id, attempt.id);
        store
            .insert_payment_with_first_attempt(payment, attempt)
            .await
            .unwrap();

        store
            .update_payment_and_attempt_on_completion(
                payment_id,
                PaymentStatus::PaymentFailure,
                None,
                None,
                attempt_id,
                Some("card_declined".to_string()),
                Some("Insufficient funds".to_string()),
            )
            .await
            .unwrap();

        let payment = store.payment(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::PaymentFailure);
        let attempts = store.attempts_for_payment(payment_id).await.unwrap();
        assert_eq!(attempts[0].status, PaymentStatus::PaymentFailure);
        assert_eq!(attempts[0].gateway_error_code.as_deref(), Some("card_declined"));
    }
}
