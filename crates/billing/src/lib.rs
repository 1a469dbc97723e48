// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Service constructors wire many collaborators
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Rebill Billing Engine
//!
//! The invoice generation/repair engine and the payment state machine of a
//! subscription billing platform, behind narrow collaborator traits.
//!
//! ## Features
//!
//! - **Invoice Items**: immutable charges, adjustments, repairs and credits
//! - **Calculator**: pure balance/paid/credited/refunded computations
//! - **Repair Engine**: reconciles billing timelines against invoiced
//!   coverage (PARTIAL_REPAIR / FULL_REPAIR)
//! - **Dispatcher**: per-account generation passes, credits, external
//!   charges, item adjustments, CBA rebalancing
//! - **Payment State Machine**: idempotent attempts through a pluggable
//!   gateway under an account-scoped lock
//! - **Retry Schedulers**: per-failure-category delay tables
//! - **Overdue Applicator**: blocking-state transitions with notification
//!   side effects

pub mod accounts;
pub mod calculator;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod items;
pub mod locks;
pub mod overdue;
pub mod payment;
pub mod proration;
pub mod repair;
pub mod retry;
pub mod store;
pub mod tags;
pub mod timeline;


// Accounts
pub use accounts::{Account, AccountProvider, InMemoryAccounts};

// Calculator
pub use calculator::{TaxFactor, TaxFactorTable};

// Dispatcher
pub use dispatcher::{BillingConfig, InvoiceGenerationResult, InvoiceService};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BusEvent, EventBus, InMemoryBus};

// Items
pub use items::{Invoice, InvoiceItem, InvoiceItemType, InvoicePayment, InvoicePaymentType};

// Locks
pub use locks::{AccountLockKey, AccountLocker, LockConfig};

// Overdue
pub use overdue::{
    BillingActionPolicy, BlockingGateway, BlockingStateRecord, EmailSender, EnterStateEmail,
    Entitlement, EntitlementGateway, OverdueCancellationPolicy, OverdueCheckQueue,
    OverdueStateApplicator, OverdueStateConfig, OverdueStateSet,
};

// Payment
pub use payment::{
    ExternalGatewayPlugin, GatewayPaymentInfo, GatewayPlugin, GatewayStatus, Payment,
    PaymentAttempt, PaymentService, PaymentServiceConfig, PaymentStatus, PluginError,
};

// Repair
pub use repair::{NewCharge, RepairEngine, RepairItem, RepairProposal, RepairStrategy};

// Retry
pub use retry::{RetryCategory, RetryPolicy, RetryQueue, RetrySchedulers, ScheduledRetry};

// Store
pub use store::{InMemoryStore, InvoiceStore, PaymentStore};

// Tags
pub use tags::{ControlTag, InMemoryTagStore, TagStore};

// Timeline
pub use timeline::{
    BillingInterval, BillingState, OpenEndedRange, ProposedCharge, ProposedChargeKind,
    SubscriptionTimeline,
};

use std::sync::Arc;

use rebill_shared::Clock;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: BillingConfig,
    pub invoices: InvoiceService,
    pub payments: PaymentService,
    pub overdue: OverdueStateApplicator,
    pub retries: Arc<RetrySchedulers>,
}

impl BillingService {
    /// Wire the services over explicit collaborators
    pub fn new(
        invoice_store: Arc<dyn InvoiceStore>,
        payment_store: Arc<dyn PaymentStore>,
        accounts: Arc<dyn AccountProvider>,
        tags: Arc<dyn TagStore>,
        bus: Arc<dyn EventBus>,
        plugin: Arc<dyn GatewayPlugin>,
        blocking: Arc<dyn BlockingGateway>,
        entitlements: Arc<dyn EntitlementGateway>,
        checks: Arc<dyn OverdueCheckQueue>,
        email: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
        retries: Arc<RetrySchedulers>,
        config: BillingConfig,
        payment_config: PaymentServiceConfig,
    ) -> Self {
        let locker = AccountLocker::new(LockConfig::default());
        let invoices = InvoiceService::new(
            invoice_store.clone(),
            accounts.clone(),
            tags.clone(),
            bus.clone(),
            locker.clone(),
            clock.clone(),
            config,
        );
        let payments = PaymentService::new(
            payment_store,
            invoice_store,
            accounts.clone(),
            tags.clone(),
            bus.clone(),
            locker,
            plugin,
            retries.clone(),
            clock.clone(),
            config.money,
            payment_config,
        );
        let overdue =
            OverdueStateApplicator::new(blocking, entitlements, checks, email, tags, bus, clock);
        Self {
            config,
            invoices,
            payments,
            overdue,
            retries,
        }
    }
}
