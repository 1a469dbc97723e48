//! Payment state machine
//!
//! Drives a single payment attempt through the gateway plugin under the
//! account lock. Declines and plugin failures feed separate retry counters
//! (a card decline and a plugin outage warrant different backoff), every
//! transition persists payment + attempt atomically and then posts exactly
//! one bus event, and a plugin timeout leaves the attempt in UNKNOWN on
//! purpose: the gateway call may still have succeeded, so the retry path or
//! the pending-notification path reconciles it later.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use rebill_shared::{Clock, Currency, MoneyConfig};

use crate::accounts::{Account, AccountProvider};
use crate::calculator;
use crate::error::{BillingError, BillingResult};
use crate::events::{post_or_log, BusEvent, EventBus};
use crate::items::{Invoice, InvoicePayment, InvoicePaymentType};
use crate::locks::{AccountLockKey, AccountLocker};
use crate::retry::{RetryCategory, RetrySchedulers};
use crate::store::{InvoiceStore, PaymentStore};
use crate::tags::{ControlTag, TagStore};

/// Payment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Created, gateway not yet consulted
    Init,
    /// Gateway accepted the request, asynchronous confirmation outstanding
    Pending,
    Success,
    /// Gateway declined; a retry is scheduled
    PaymentFailure,
    PaymentFailureAborted,
    /// Plugin threw or returned an unexpected status; a retry is scheduled
    PluginFailure,
    PluginFailureAborted,
    /// Parked because the account is flagged AUTO_PAY_OFF
    AutoPayOff,
    /// Outcome unknown (e.g. plugin timeout); reconciled by retry
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Init => "INIT",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::PaymentFailure => "PAYMENT_FAILURE",
            PaymentStatus::PaymentFailureAborted => "PAYMENT_FAILURE_ABORTED",
            PaymentStatus::PluginFailure => "PLUGIN_FAILURE",
            PaymentStatus::PluginFailureAborted => "PLUGIN_FAILURE_ABORTED",
            PaymentStatus::AutoPayOff => "AUTO_PAY_OFF",
            PaymentStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Success
                | PaymentStatus::PaymentFailureAborted
                | PaymentStatus::PluginFailureAborted
        )
    }

    /// States a retry may pick the payment back up from
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentStatus::PaymentFailure
                | PaymentStatus::PluginFailure
                | PaymentStatus::AutoPayOff
                | PaymentStatus::Unknown
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment aggregate. Mutated only under the account lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub account_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_method_id: Uuid,
    pub requested_amount: Decimal,
    pub currency: Currency,
    /// As reported by the gateway on completion; may differ from requested
    pub processed_amount: Option<Decimal>,
    pub processed_currency: Option<Currency>,
    pub status: PaymentStatus,
    pub effective_date: OffsetDateTime,
}

/// One attempt record; append-only, never deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub account_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_method_id: Uuid,
    pub requested_amount: Decimal,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub gateway_error_code: Option<String>,
    pub gateway_error: Option<String>,
    pub effective_date: OffsetDateTime,
}

impl PaymentAttempt {
    fn new(payment: &Payment, status: PaymentStatus, effective_date: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            account_id: payment.account_id,
            invoice_id: payment.invoice_id,
            payment_method_id: payment.payment_method_id,
            requested_amount: payment.requested_amount,
            currency: payment.currency,
            status,
            gateway_error_code: None,
            gateway_error: None,
            effective_date,
        }
    }
}

/// Outcome reported by the gateway plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Processed,
    Pending,
    Error,
}

#[derive(Debug, Clone)]
pub struct GatewayPaymentInfo {
    pub status: GatewayStatus,
    pub processed_amount: Option<Decimal>,
    pub processed_currency: Option<Currency>,
    pub gateway_error_code: Option<String>,
    pub gateway_error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct PluginError(pub String);

/// Payment gateway contract. Implementations may fail with a plugin error;
/// the state machine treats that the same as an unexpected status.
#[async_trait]
pub trait GatewayPlugin: Send + Sync {
    async fn process_payment(
        &self,
        account_id: Uuid,
        payment_id: Uuid,
        payment_method_id: Uuid,
        amount: Decimal,
        currency: Currency,
    ) -> Result<GatewayPaymentInfo, PluginError>;
}

/// Plugin for payments settled outside any gateway (wire transfer, check):
/// reports every request as processed at the requested amount
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalGatewayPlugin;

#[async_trait]
impl GatewayPlugin for ExternalGatewayPlugin {
    async fn process_payment(
        &self,
        _account_id: Uuid,
        _payment_id: Uuid,
        _payment_method_id: Uuid,
        amount: Decimal,
        currency: Currency,
    ) -> Result<GatewayPaymentInfo, PluginError> {
        Ok(GatewayPaymentInfo {
            status: GatewayStatus::Processed,
            processed_amount: Some(amount),
            processed_currency: Some(currency),
            gateway_error_code: None,
            gateway_error: None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaymentServiceConfig {
    /// Upper bound on one gateway call while the account lock is held
    pub plugin_timeout: Duration,
}

impl Default for PaymentServiceConfig {
    fn default() -> Self {
        Self {
            plugin_timeout: Duration::from_secs(30),
        }
    }
}

impl PaymentServiceConfig {
    pub fn from_env() -> Self {
        let plugin_timeout = std::env::var("REBILL_PLUGIN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));
        Self { plugin_timeout }
    }
}

/// Payment service: the state machine plus its retry entry points
pub struct PaymentService {
    payments: Arc<dyn PaymentStore>,
    invoices: Arc<dyn InvoiceStore>,
    accounts: Arc<dyn AccountProvider>,
    tags: Arc<dyn TagStore>,
    bus: Arc<dyn EventBus>,
    locker: Arc<AccountLocker>,
    plugin: Arc<dyn GatewayPlugin>,
    retries: Arc<RetrySchedulers>,
    clock: Arc<dyn Clock>,
    money: MoneyConfig,
    config: PaymentServiceConfig,
}

impl PaymentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        invoices: Arc<dyn InvoiceStore>,
        accounts: Arc<dyn AccountProvider>,
        tags: Arc<dyn TagStore>,
        bus: Arc<dyn EventBus>,
        locker: Arc<AccountLocker>,
        plugin: Arc<dyn GatewayPlugin>,
        retries: Arc<RetrySchedulers>,
        clock: Arc<dyn Clock>,
        money: MoneyConfig,
        config: PaymentServiceConfig,
    ) -> Self {
        Self {
            payments,
            invoices,
            accounts,
            tags,
            bus,
            locker,
            plugin,
            retries,
            clock,
            money,
            config,
        }
    }

    pub async fn payment(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.payments
            .payment(payment_id)
            .await?
            .ok_or(BillingError::NoSuchPayment(payment_id))
    }

    pub async fn attempts(&self, payment_id: Uuid) -> BillingResult<Vec<PaymentAttempt>> {
        self.payments.attempts_for_payment(payment_id).await
    }

    /// Create and process a payment for an invoice.
    ///
    /// `amount = None` pays the full invoice balance. The whole operation
    /// runs under the account lock; lock exhaustion fails fast with
    /// `LOCK_CONTENDED` and persists nothing.
    pub async fn create_payment(
        &self,
        account_id: Uuid,
        invoice_id: Uuid,
        amount: Option<Decimal>,
    ) -> BillingResult<Payment> {
        let account = self.accounts.account(account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        let invoice = self.invoices.invoice(invoice_id).await?;
        if invoice.migration {
            return Err(BillingError::Internal(format!(
                "invoice {invoice_id} is a migration invoice"
            )));
        }
        let requested_amount = self.validated_amount(&invoice, amount).await?;

        let Some(payment_method_id) = account.payment_method_id else {
            // Keep a record of the failure even though no gateway call is made
            self.record_aborted_for_missing_method(&account, &invoice, requested_amount)
                .await?;
            post_or_log(
                self.bus.as_ref(),
                BusEvent::PaymentError {
                    account_id: account.id,
                    invoice_id,
                    payment_id: None,
                    message: "no default payment method".to_string(),
                },
            )
            .await;
            return Err(BillingError::NoPaymentMethod(account.id));
        };

        self.flag_auto_pay_off_if_unsane(&account, payment_method_id)
            .await?;

        let now = self.clock.now_utc();
        let mut payment = Payment {
            id: Uuid::new_v4(),
            account_id: account.id,
            invoice_id,
            payment_method_id,
            requested_amount,
            currency: invoice.currency,
            processed_amount: None,
            processed_currency: None,
            status: PaymentStatus::Init,
            effective_date: now,
        };

        if self.tags.is_tagged(account.id, ControlTag::AutoPayOff).await? {
            // Parked: one attempt recorded, no gateway call
            payment.status = PaymentStatus::AutoPayOff;
            let attempt = PaymentAttempt::new(&payment, PaymentStatus::AutoPayOff, now);
            self.payments
                .insert_payment_with_first_attempt(payment.clone(), attempt)
                .await?;
            tracing::info!(
                account_id = %account.id,
                payment_id = %payment.id,
                "Payment parked: account is AUTO_PAY_OFF"
            );
            return Ok(payment);
        }

        let attempt = PaymentAttempt::new(&payment, PaymentStatus::Init, now);
        self.payments
            .insert_payment_with_first_attempt(payment.clone(), attempt.clone())
            .await?;

        self.process_attempt(&account, &invoice, payment, attempt)
            .await
    }

    /// Resolve a PENDING payment after asynchronous gateway confirmation
    pub async fn notify_pending_payment_completed(
        &self,
        account_id: Uuid,
        payment_id: Uuid,
        success: bool,
    ) -> BillingResult<Payment> {
        let account = self.accounts.account(account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        let payment = self.payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Err(BillingError::PaymentNotPending(payment_id));
        }
        let attempts = self.payments.attempts_for_payment(payment_id).await?;
        let last_attempt = attempts
            .last()
            .ok_or_else(|| BillingError::Internal(format!("payment {payment_id} has no attempts")))?;

        let status = if success {
            PaymentStatus::Success
        } else {
            PaymentStatus::PaymentFailureAborted
        };
        self.payments
            .update_payment_and_attempt_on_completion(
                payment_id,
                status,
                payment.processed_amount,
                payment.processed_currency,
                last_attempt.id,
                None,
                None,
            )
            .await?;

        if success {
            self.notify_invoice_of_payment(&payment).await?;
        }
        post_or_log(
            self.bus.as_ref(),
            BusEvent::PaymentInfo {
                account_id: account.id,
                invoice_id: payment.invoice_id,
                payment_id,
                amount: payment.requested_amount,
                status,
            },
        )
        .await;

        self.payment(payment_id).await
    }

    /// Re-enter the state machine for a gateway-declined payment
    pub async fn retry_payment_failure(&self, payment_id: Uuid) -> BillingResult<()> {
        self.retry_internal(payment_id, &[PaymentStatus::PaymentFailure])
            .await
    }

    /// Re-enter the state machine after a plugin failure or unknown outcome
    pub async fn retry_plugin_failure(&self, payment_id: Uuid) -> BillingResult<()> {
        self.retry_internal(
            payment_id,
            &[PaymentStatus::PluginFailure, PaymentStatus::Unknown],
        )
        .await
    }

    /// Re-enter the state machine for a payment parked in AUTO_PAY_OFF
    pub async fn retry_auto_pay_off(&self, payment_id: Uuid) -> BillingResult<()> {
        self.retry_internal(payment_id, &[PaymentStatus::AutoPayOff]).await
    }

    /// Operator-initiated retry from any retryable state
    pub async fn retry_from_api(&self, payment_id: Uuid) -> BillingResult<()> {
        self.retry_internal(
            payment_id,
            &[
                PaymentStatus::Unknown,
                PaymentStatus::AutoPayOff,
                PaymentStatus::PaymentFailure,
                PaymentStatus::PluginFailure,
            ],
        )
        .await
    }

    /// Lift AUTO_PAY_OFF from the account and schedule every parked or
    /// failed payment for immediate retry
    pub async fn remove_auto_pay_off(&self, account_id: Uuid) -> BillingResult<()> {
        match self.tags.remove_tag(account_id, ControlTag::AutoPayOff).await {
            Ok(()) | Err(BillingError::TagNotFound(_)) => {}
            Err(other) => return Err(other),
        }

        let account = self.accounts.account(account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        let now = self.clock.now_utc();
        let payments = self.payments.payments_for_account(account_id).await?;
        for payment in payments.iter().filter(|p| p.status.is_retryable()) {
            let category = match payment.status {
                PaymentStatus::AutoPayOff => RetryCategory::AutoPayOffResume,
                PaymentStatus::PaymentFailure => RetryCategory::PaymentFailure,
                PaymentStatus::PluginFailure | PaymentStatus::Unknown => {
                    RetryCategory::PluginFailure
                }
                // is_retryable() admits nothing else
                _ => continue,
            };
            self.retries.schedule_immediate(category, payment.id, now).await;
            tracing::info!(
                account_id = %account_id,
                payment_id = %payment.id,
                status = %payment.status,
                "Scheduled retry after AUTO_PAY_OFF removal"
            );
        }
        Ok(())
    }

    async fn retry_internal(
        &self,
        payment_id: Uuid,
        expected: &[PaymentStatus],
    ) -> BillingResult<()> {
        let Some(payment) = self.payments.payment(payment_id).await? else {
            tracing::error!(payment_id = %payment_id, "Invalid retry for nonexistent payment");
            return Ok(());
        };

        if self
            .tags
            .is_tagged(payment.account_id, ControlTag::AutoPayOff)
            .await?
        {
            tracing::info!(
                payment_id = %payment_id,
                status = %payment.status,
                "Skipping retry: account is AUTO_PAY_OFF"
            );
            return Ok(());
        }

        let account = self.accounts.account(payment.account_id).await?;
        let key = AccountLockKey::new(account.id, &account.external_key);
        let _lock = self.locker.lock(&key).await?;

        // Fetch again with the lock held: the payment may have moved
        let Some(payment) = self.payments.payment(payment_id).await? else {
            return Ok(());
        };
        if !expected.contains(&payment.status) {
            tracing::info!(
                payment_id = %payment_id,
                status = %payment.status,
                "Aborted retry: payment no longer in an expected state"
            );
            return Ok(());
        }

        let invoice = self.invoices.invoice(payment.invoice_id).await?;
        if invoice.migration {
            return Ok(());
        }
        let invoice_payments = self.invoices.invoice_payments(invoice.id).await?;
        let balance = calculator::balance(&self.money, &invoice.items, &invoice_payments);
        if balance <= Decimal::ZERO {
            tracing::info!(payment_id = %payment_id, "Aborted retry: invoice has been paid");
            self.abort_on_paid_invoice(&payment).await?;
            return Ok(());
        }

        let now = self.clock.now_utc();
        let mut retried = payment.clone();
        retried.requested_amount = self.money.round(balance);
        let attempt = PaymentAttempt::new(&retried, PaymentStatus::Init, now);
        self.payments
            .update_payment_with_new_attempt(payment_id, attempt.clone())
            .await?;

        self.process_attempt(&account, &invoice, retried, attempt)
            .await
            .map(|_| ())
    }

    /// One gateway round-trip plus the resulting transition
    async fn process_attempt(
        &self,
        account: &Account,
        invoice: &Invoice,
        payment: Payment,
        attempt: PaymentAttempt,
    ) -> BillingResult<Payment> {
        let call = self.plugin.process_payment(
            account.id,
            payment.id,
            attempt.payment_method_id,
            attempt.requested_amount,
            payment.currency,
        );

        let outcome = match tokio::time::timeout(self.config.plugin_timeout, call).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                // The in-flight call may yet succeed; leave UNKNOWN and let
                // the retry path reconcile. No rollback.
                self.payments
                    .update_payment_and_attempt_on_completion(
                        payment.id,
                        PaymentStatus::Unknown,
                        None,
                        None,
                        attempt.id,
                        None,
                        Some("plugin timeout".to_string()),
                    )
                    .await?;
                post_or_log(
                    self.bus.as_ref(),
                    BusEvent::PaymentPluginError {
                        account_id: account.id,
                        invoice_id: invoice.id,
                        payment_id: payment.id,
                        message: "plugin timeout".to_string(),
                    },
                )
                .await;
                tracing::warn!(
                    payment_id = %payment.id,
                    timeout = ?self.config.plugin_timeout,
                    "Gateway plugin timed out; payment left UNKNOWN"
                );
                return Err(BillingError::PluginTimeout(self.config.plugin_timeout));
            }
        };

        match outcome {
            Ok(info) => match info.status {
                GatewayStatus::Processed | GatewayStatus::Pending => {
                    let status = if info.status == GatewayStatus::Processed {
                        PaymentStatus::Success
                    } else {
                        PaymentStatus::Pending
                    };
                    // Track the amount/currency as the plugin reports them
                    self.payments
                        .update_payment_and_attempt_on_completion(
                            payment.id,
                            status,
                            info.processed_amount,
                            info.processed_currency,
                            attempt.id,
                            info.gateway_error_code.clone(),
                            None,
                        )
                        .await?;

                    let completed = self.payment(payment.id).await?;
                    if status == PaymentStatus::Success {
                        // The invoice is credited with the requested amount,
                        // staying consistent with the account currency even
                        // if the plugin settled in another one
                        self.notify_invoice_of_payment(&completed).await?;
                    }
                    post_or_log(
                        self.bus.as_ref(),
                        BusEvent::PaymentInfo {
                            account_id: account.id,
                            invoice_id: invoice.id,
                            payment_id: completed.id,
                            amount: completed.requested_amount,
                            status,
                        },
                    )
                    .await;
                    tracing::info!(
                        account_id = %account.id,
                        invoice_id = %invoice.id,
                        payment_id = %completed.id,
                        status = %status,
                        "Gateway accepted payment"
                    );
                    Ok(completed)
                }
                GatewayStatus::Error => {
                    let status = self.schedule_retry_on_payment_failure(payment.id).await?;
                    self.payments
                        .update_payment_and_attempt_on_completion(
                            payment.id,
                            status,
                            None,
                            None,
                            attempt.id,
                            info.gateway_error_code.clone(),
                            info.gateway_error.clone(),
                        )
                        .await?;
                    let message = info
                        .gateway_error
                        .unwrap_or_else(|| "gateway declined".to_string());
                    tracing::info!(
                        account_id = %account.id,
                        invoice_id = %invoice.id,
                        payment_id = %payment.id,
                        status = %status,
                        error = %message,
                        "Could not process payment"
                    );
                    post_or_log(
                        self.bus.as_ref(),
                        BusEvent::PaymentError {
                            account_id: account.id,
                            invoice_id: invoice.id,
                            payment_id: Some(payment.id),
                            message: message.clone(),
                        },
                    )
                    .await;
                    Err(BillingError::PaymentDeclined(message))
                }
            },
            Err(plugin_error) => {
                // Plugin threw: unknown outcome, retried on the separate
                // plugin-failure counter
                let status = self.schedule_retry_on_plugin_failure(payment.id).await?;
                self.payments
                    .update_payment_and_attempt_on_completion(
                        payment.id,
                        status,
                        None,
                        None,
                        attempt.id,
                        None,
                        Some(plugin_error.0.clone()),
                    )
                    .await?;
                tracing::warn!(
                    account_id = %account.id,
                    payment_id = %payment.id,
                    status = %status,
                    error = %plugin_error,
                    "Gateway plugin failed"
                );
                post_or_log(
                    self.bus.as_ref(),
                    BusEvent::PaymentPluginError {
                        account_id: account.id,
                        invoice_id: invoice.id,
                        payment_id: payment.id,
                        message: plugin_error.0.clone(),
                    },
                )
                .await;
                Err(BillingError::PluginFailure(plugin_error.0))
            }
        }
    }

    async fn schedule_retry_on_payment_failure(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<PaymentStatus> {
        let attempts = self.payments.attempts_for_payment(payment_id).await?;
        let prior = count_in_states(
            &attempts,
            &[PaymentStatus::Unknown, PaymentStatus::PaymentFailure],
        );
        let scheduled = self
            .retries
            .schedule(
                RetryCategory::PaymentFailure,
                payment_id,
                prior,
                self.clock.now_utc(),
            )
            .await;
        Ok(if scheduled {
            PaymentStatus::PaymentFailure
        } else {
            PaymentStatus::PaymentFailureAborted
        })
    }

    async fn schedule_retry_on_plugin_failure(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<PaymentStatus> {
        let attempts = self.payments.attempts_for_payment(payment_id).await?;
        let prior = count_in_states(
            &attempts,
            &[PaymentStatus::Unknown, PaymentStatus::PluginFailure],
        );
        let scheduled = self
            .retries
            .schedule(
                RetryCategory::PluginFailure,
                payment_id,
                prior,
                self.clock.now_utc(),
            )
            .await;
        Ok(if scheduled {
            PaymentStatus::PluginFailure
        } else {
            PaymentStatus::PluginFailureAborted
        })
    }

    /// The invoice balance reached zero while this payment sat in a
    /// retryable state; close it out on the matching terminal
    async fn abort_on_paid_invoice(&self, payment: &Payment) -> BillingResult<()> {
        let status = match payment.status {
            PaymentStatus::PaymentFailure | PaymentStatus::AutoPayOff => {
                PaymentStatus::PaymentFailureAborted
            }
            PaymentStatus::PluginFailure | PaymentStatus::Unknown => {
                PaymentStatus::PluginFailureAborted
            }
            other => {
                return Err(BillingError::Internal(format!(
                    "unexpected payment status for retry abort: {other}"
                )))
            }
        };
        let now = self.clock.now_utc();
        let mut attempt = PaymentAttempt::new(payment, status, now);
        attempt.gateway_error = Some("invoice already paid".to_string());
        self.payments
            .update_payment_with_new_attempt(payment.id, attempt.clone())
            .await?;
        self.payments
            .update_payment_and_attempt_on_completion(
                payment.id,
                status,
                None,
                None,
                attempt.id,
                None,
                Some("invoice already paid".to_string()),
            )
            .await?;
        Ok(())
    }

    async fn validated_amount(
        &self,
        invoice: &Invoice,
        amount: Option<Decimal>,
    ) -> BillingResult<Decimal> {
        let payments = self.invoices.invoice_payments(invoice.id).await?;
        let balance = calculator::balance(&self.money, &invoice.items, &payments);
        if balance <= Decimal::ZERO {
            return Err(BillingError::NullInvoice(invoice.id));
        }
        if let Some(requested) = amount {
            if requested <= Decimal::ZERO {
                return Err(BillingError::AmountInvalid(requested.to_string()));
            }
            if requested > balance {
                return Err(BillingError::AmountDenied {
                    requested: requested.to_string(),
                    balance: balance.to_string(),
                });
            }
        }
        Ok(self.money.round(amount.unwrap_or(balance)))
    }

    async fn notify_invoice_of_payment(&self, payment: &Payment) -> BillingResult<()> {
        self.invoices
            .record_invoice_payment(InvoicePayment {
                id: Uuid::new_v4(),
                payment_id: payment.id,
                invoice_id: payment.invoice_id,
                payment_type: InvoicePaymentType::Attempt,
                amount: payment.requested_amount,
                currency: payment.currency,
                payment_date: self.clock.now_utc(),
            })
            .await
    }

    async fn record_aborted_for_missing_method(
        &self,
        account: &Account,
        invoice: &Invoice,
        requested_amount: Decimal,
    ) -> BillingResult<()> {
        // Sentinel method id keeps the record shape uniform
        let missing_method = Uuid::nil();
        let now = self.clock.now_utc();
        let payment = Payment {
            id: Uuid::new_v4(),
            account_id: account.id,
            invoice_id: invoice.id,
            payment_method_id: missing_method,
            requested_amount,
            currency: invoice.currency,
            processed_amount: None,
            processed_currency: None,
            status: PaymentStatus::PaymentFailureAborted,
            effective_date: now,
        };
        let mut attempt = PaymentAttempt::new(&payment, PaymentStatus::PaymentFailureAborted, now);
        attempt.gateway_error = Some("no default payment method".to_string());
        self.payments
            .insert_payment_with_first_attempt(payment, attempt)
            .await
    }

    /// An aborted plugin failure or unknown outcome on the last payment for
    /// this method is a bad sign; stop auto-paying until an operator looks
    async fn flag_auto_pay_off_if_unsane(
        &self,
        account: &Account,
        payment_method_id: Uuid,
    ) -> BillingResult<()> {
        let payments = self.payments.payments_for_account(account.id).await?;
        let last_for_method = payments
            .iter()
            .filter(|p| p.payment_method_id == payment_method_id)
            .max_by_key(|p| p.effective_date);
        let is_bad = last_for_method.is_some_and(|p| {
            matches!(
                p.status,
                PaymentStatus::PluginFailureAborted | PaymentStatus::Unknown
            )
        });
        if is_bad && !self.tags.is_tagged(account.id, ControlTag::AutoPayOff).await? {
            tracing::warn!(
                account_id = %account.id,
                "Setting account AUTO_PAY_OFF after bad payment on method"
            );
            self.tags.add_tag(account.id, ControlTag::AutoPayOff).await?;
        }
        Ok(())
    }
}

/// Attempts already recorded in any of the given states; indexed per
/// payment, so the scan is O(attempts-for-this-payment)
fn count_in_states(attempts: &[PaymentAttempt], states: &[PaymentStatus]) -> usize {
    attempts
        .iter()
        .filter(|attempt| states.contains(&attempt.status))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_and_retryable_are_disjoint() {
        let all = [
            PaymentStatus::Init,
            PaymentStatus::Pending,
            PaymentStatus::Success,
            PaymentStatus::PaymentFailure,
            PaymentStatus::PaymentFailureAborted,
            PaymentStatus::PluginFailure,
            PaymentStatus::PluginFailureAborted,
            PaymentStatus::AutoPayOff,
            PaymentStatus::Unknown,
        ];
        for status in all {
            assert!(
                !(status.is_terminal() && status.is_retryable()),
                "{status} cannot be both terminal and retryable"
            );
        }
    }

    #[test]
    fn test_count_in_states() {
        let payment = Payment {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            payment_method_id: Uuid::new_v4(),
            requested_amount: Decimal::TEN,
            currency: Currency::Usd,
            processed_amount: None,
            processed_currency: None,
            status: PaymentStatus::PaymentFailure,
            effective_date: OffsetDateTime::UNIX_EPOCH,
        };
        let mk = |status| PaymentAttempt::new(&payment, status, OffsetDateTime::UNIX_EPOCH);
        let attempts = vec![
            mk(PaymentStatus::PaymentFailure),
            mk(PaymentStatus::Unknown),
            mk(PaymentStatus::PluginFailure),
            mk(PaymentStatus::Init),
        ];
        assert_eq!(
            count_in_states(
                &attempts,
                &[PaymentStatus::Unknown, PaymentStatus::PaymentFailure]
            ),
            2
        );
        assert_eq!(
            count_in_states(
                &attempts,
                &[PaymentStatus::Unknown, PaymentStatus::PluginFailure]
            ),
            2
        );
    }
}
