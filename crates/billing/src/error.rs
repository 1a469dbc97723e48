//! Billing error taxonomy
//!
//! Every error carries a stable machine-readable code so automated callers
//! can branch without matching on message text. "Nothing to invoice" is a
//! normal generation outcome surfaced through this type so callers can
//! distinguish it from a produced invoice; it is not an alarm condition.

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Generation ran to completion and determined no new invoice is needed
    #[error("no new invoice to generate for account {0}")]
    NothingToInvoice(Uuid),

    #[error("invalid amount: {0}")]
    AmountInvalid(String),

    #[error("no such account: {0}")]
    NoSuchAccount(Uuid),

    #[error("no such invoice: {0}")]
    NoSuchInvoice(Uuid),

    #[error("no such invoice item: {0}")]
    NoSuchInvoiceItem(Uuid),

    #[error("no such payment: {0}")]
    NoSuchPayment(Uuid),

    #[error("payment {0} is not in PENDING state")]
    PaymentNotPending(Uuid),

    #[error("account {0} has no default payment method")]
    NoPaymentMethod(Uuid),

    #[error("invoice {0} has no balance to pay")]
    NullInvoice(Uuid),

    #[error("requested amount {requested} exceeds invoice balance {balance}")]
    AmountDenied { requested: String, balance: String },

    #[error("payment declined by gateway: {0}")]
    PaymentDeclined(String),

    #[error("gateway plugin failure: {0}")]
    PluginFailure(String),

    /// The plugin call timed out while the account lock was held; the
    /// attempt's final state is unknown and is NOT rolled back
    #[error("gateway plugin timed out after {0:?}")]
    PluginTimeout(std::time::Duration),

    #[error("could not acquire account lock for {0}")]
    LockContended(String),

    #[error("tag not found: {0}")]
    TagNotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable error code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::NothingToInvoice(_) => "NOTHING_TO_INVOICE",
            BillingError::AmountInvalid(_) => "AMOUNT_INVALID",
            BillingError::NoSuchAccount(_) => "NO_SUCH_ACCOUNT",
            BillingError::NoSuchInvoice(_) => "NO_SUCH_INVOICE",
            BillingError::NoSuchInvoiceItem(_) => "NO_SUCH_INVOICE_ITEM",
            BillingError::NoSuchPayment(_) => "NO_SUCH_PAYMENT",
            BillingError::PaymentNotPending(_) => "PAYMENT_NOT_PENDING",
            BillingError::NoPaymentMethod(_) => "NO_PAYMENT_METHOD",
            BillingError::NullInvoice(_) => "PAYMENT_NULL_INVOICE",
            BillingError::AmountDenied { .. } => "PAYMENT_AMOUNT_DENIED",
            BillingError::PaymentDeclined(_) => "PAYMENT_DECLINED",
            BillingError::PluginFailure(_) => "PAYMENT_PLUGIN_FAILURE",
            BillingError::PluginTimeout(_) => "PLUGIN_TIMEOUT",
            BillingError::LockContended(_) => "LOCK_CONTENDED",
            BillingError::TagNotFound(_) => "TAG_NOT_FOUND",
            BillingError::Store(_) => "STORE_ERROR",
            BillingError::Config(_) => "CONFIG_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True for the "generation found nothing to do" outcome
    pub fn is_nothing_to_invoice(&self) -> bool {
        matches!(self, BillingError::NothingToInvoice(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let account_id = Uuid::new_v4();
        assert_eq!(
            BillingError::NothingToInvoice(account_id).code(),
            "NOTHING_TO_INVOICE"
        );
        assert_eq!(
            BillingError::AmountInvalid("-1".into()).code(),
            "AMOUNT_INVALID"
        );
        assert_eq!(
            BillingError::LockContended("acct".into()).code(),
            "LOCK_CONTENDED"
        );
    }

    #[test]
    fn test_nothing_to_invoice_is_distinguishable() {
        let err = BillingError::NothingToInvoice(Uuid::new_v4());
        assert!(err.is_nothing_to_invoice());
        assert!(!BillingError::NullInvoice(Uuid::new_v4()).is_nothing_to_invoice());
    }
}
