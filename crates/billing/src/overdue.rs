//! Overdue state applicator
//!
//! Applies a transition between configured overdue tiers to an account:
//! persists the blocking state, toggles the AUTO_INVOICING_OFF control tag
//! across block/unblock-billing transitions, cancels subscriptions per the
//! tier's policy (add-ons follow their base subscription), sends the
//! configured email, and schedules the next re-check. Side-effect failures
//! are logged and never abort the transition; the state-change bus event is
//! always posted last. Consumers of that event must tolerate duplicate and
//! out-of-order delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Date, Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use rebill_shared::Clock;

use crate::accounts::Account;
use crate::error::{BillingError, BillingResult};
use crate::events::{post_or_log, BusEvent, EventBus};
use crate::tags::{ControlTag, TagStore};
use crate::timeline::BillingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverdueCancellationPolicy {
    None,
    EndOfTerm,
    Immediate,
}

/// Email sent when an account enters a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterStateEmail {
    pub subject: String,
    /// Body template; `{account}`, `{state}` and `{balance}` are replaced
    pub body: String,
    pub is_html: bool,
}

/// One configured overdue tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverdueStateConfig {
    pub name: String,
    pub is_clear: bool,
    pub block_changes: bool,
    /// Blocks entitlement and billing while set (one switch upstream)
    pub disable_entitlement_and_changes_blocked: bool,
    pub subscription_cancellation_policy: OverdueCancellationPolicy,
    /// Re-check cadence while the account sits in this tier
    pub reevaluation_interval: Option<Duration>,
    /// Unpaid-invoice age at which this tier starts to apply
    pub time_since_earliest_unpaid_invoice: Option<Duration>,
    pub enter_state_email: Option<EnterStateEmail>,
}

impl OverdueStateConfig {
    pub fn clear(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_clear: true,
            block_changes: false,
            disable_entitlement_and_changes_blocked: false,
            subscription_cancellation_policy: OverdueCancellationPolicy::None,
            reevaluation_interval: None,
            time_since_earliest_unpaid_invoice: None,
            enter_state_email: None,
        }
    }

    fn blocks_billing(&self) -> bool {
        self.disable_entitlement_and_changes_blocked
    }
}

/// The configured tier set: one clear state plus escalating overdue tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverdueStateSet {
    /// Ordered, mildest first; the clear state is separate
    pub states: Vec<OverdueStateConfig>,
    pub clear_state: OverdueStateConfig,
    /// Re-check cadence after returning to clear with unpaid invoices still
    /// outstanding
    pub initial_reevaluation_interval: Option<Duration>,
}

impl OverdueStateSet {
    pub fn first_overdue_state(&self) -> Option<&OverdueStateConfig> {
        self.states.first()
    }

    pub fn state_by_name(&self, name: &str) -> Option<&OverdueStateConfig> {
        if self.clear_state.name == name {
            return Some(&self.clear_state);
        }
        self.states.iter().find(|state| state.name == name)
    }

    /// Candidate state for a billing snapshot: the most severe tier whose
    /// unpaid-invoice age threshold is met, else clear
    pub fn evaluate(&self, billing_state: &BillingState, today: Date) -> &OverdueStateConfig {
        let Some(earliest) = billing_state.date_of_earliest_unpaid_invoice else {
            return &self.clear_state;
        };
        let age = Duration::days((today - earliest).whole_days());
        self.states
            .iter()
            .rev()
            .find(|state| {
                state
                    .time_since_earliest_unpaid_invoice
                    .is_some_and(|threshold| age >= threshold)
            })
            .unwrap_or(&self.clear_state)
    }
}

/// Blocking-state record owned by the external blocking API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingStateRecord {
    pub account_id: Uuid,
    pub state_name: String,
    pub block_changes: bool,
    pub block_entitlement: bool,
    pub block_billing: bool,
    pub effective: OffsetDateTime,
}

#[async_trait]
pub trait BlockingGateway: Send + Sync {
    async fn set_blocking_state(&self, record: BlockingStateRecord) -> BillingResult<()>;
}

/// Subscription as seen by cancellation
#[derive(Debug, Clone, PartialEq)]
pub struct Entitlement {
    pub subscription_id: Uuid,
    pub bundle_id: Uuid,
    pub is_addon: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingActionPolicy {
    EndOfTerm,
    Immediate,
}

#[async_trait]
pub trait EntitlementGateway: Send + Sync {
    async fn entitlements(&self, account_id: Uuid) -> BillingResult<Vec<Entitlement>>;

    /// Cancelling an already-cancelled subscription is a no-op upstream
    async fn cancel(
        &self,
        subscription_id: Uuid,
        effective_date: Date,
        policy: BillingActionPolicy,
    ) -> BillingResult<()>;
}

/// Future re-check notifications
#[async_trait]
pub trait OverdueCheckQueue: Send + Sync {
    async fn insert_check(&self, account_id: Uuid, at: OffsetDateTime) -> BillingResult<()>;
    async fn clear_checks(&self, account_id: Uuid) -> BillingResult<()>;
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str, is_html: bool)
        -> Result<(), String>;
}

pub struct OverdueStateApplicator {
    blocking: Arc<dyn BlockingGateway>,
    entitlements: Arc<dyn EntitlementGateway>,
    checks: Arc<dyn OverdueCheckQueue>,
    email: Arc<dyn EmailSender>,
    tags: Arc<dyn TagStore>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
}

impl OverdueStateApplicator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blocking: Arc<dyn BlockingGateway>,
        entitlements: Arc<dyn EntitlementGateway>,
        checks: Arc<dyn OverdueCheckQueue>,
        email: Arc<dyn EmailSender>,
        tags: Arc<dyn TagStore>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blocking,
            entitlements,
            checks,
            email,
            tags,
            bus,
            clock,
        }
    }

    /// Apply the transition from `previous` to `next` for the account
    pub async fn apply(
        &self,
        state_set: &OverdueStateSet,
        billing_state: &BillingState,
        account: &Account,
        previous: &OverdueStateConfig,
        next: &OverdueStateConfig,
    ) -> BillingResult<()> {
        if self
            .tags
            .is_tagged(account.id, ControlTag::OverdueEnforcementOff)
            .await?
        {
            tracing::debug!(account_id = %account.id, "Overdue enforcement off, skipping");
            return Ok(());
        }

        let now = self.clock.now_utc();
        tracing::debug!(
            account_id = %account.id,
            previous = %previous.name,
            next = %next.name,
            "Applying overdue state"
        );

        self.schedule_next_check(state_set, billing_state, account, next, now)
            .await;

        if previous.name == next.name {
            return Ok(());
        }

        self.store_new_state(account, next, now).await;
        self.cancel_subscriptions_if_required(account, next).await;
        self.send_email_if_required(account, billing_state, next).await;
        self.toggle_auto_invoicing_off(account, previous, next).await;

        // Posted regardless of how the side effects fared
        post_or_log(
            self.bus.as_ref(),
            BusEvent::OverdueChange {
                account_id: account.id,
                previous_state: previous.name.clone(),
                next_state: next.name.clone(),
                blocked_billing: is_block_billing_transition(previous, next),
                unblocked_billing: is_unblock_billing_transition(previous, next),
            },
        )
        .await;
        Ok(())
    }

    async fn schedule_next_check(
        &self,
        state_set: &OverdueStateSet,
        billing_state: &BillingState,
        account: &Account,
        next: &OverdueStateConfig,
        now: OffsetDateTime,
    ) {
        // Still overdue, or clear with an unpaid invoice that has not yet
        // aged into the first tier: keep watching
        let needs_check = !next.is_clear
            || (state_set.first_overdue_state().is_some()
                && billing_state.date_of_earliest_unpaid_invoice.is_some());

        if needs_check {
            let interval = if next.is_clear {
                state_set.initial_reevaluation_interval
            } else {
                next.reevaluation_interval
            };
            match interval {
                Some(interval) => {
                    if let Err(error) = self.checks.insert_check(account.id, now + interval).await {
                        tracing::error!(
                            account_id = %account.id,
                            error = %error,
                            "Failed to schedule overdue re-check"
                        );
                    }
                }
                None => {
                    // Conditions are not time based; nothing to re-check
                    tracing::debug!(
                        account_id = %account.id,
                        "No reevaluation interval configured, not scheduling re-check"
                    );
                }
            }
        } else if next.is_clear {
            if let Err(error) = self.checks.clear_checks(account.id).await {
                tracing::error!(
                    account_id = %account.id,
                    error = %error,
                    "Failed to clear pending overdue re-checks"
                );
            }
        }
    }

    async fn store_new_state(
        &self,
        account: &Account,
        next: &OverdueStateConfig,
        now: OffsetDateTime,
    ) {
        let record = BlockingStateRecord {
            account_id: account.id,
            state_name: next.name.clone(),
            block_changes: next.block_changes,
            block_entitlement: next.disable_entitlement_and_changes_blocked,
            block_billing: next.blocks_billing(),
            effective: now,
        };
        if let Err(error) = self.blocking.set_blocking_state(record).await {
            tracing::error!(
                account_id = %account.id,
                state = %next.name,
                error = %error,
                "Failed to store blocking state"
            );
        }
    }

    async fn cancel_subscriptions_if_required(&self, account: &Account, next: &OverdueStateConfig) {
        let policy = match next.subscription_cancellation_policy {
            OverdueCancellationPolicy::None => return,
            OverdueCancellationPolicy::EndOfTerm => BillingActionPolicy::EndOfTerm,
            OverdueCancellationPolicy::Immediate => BillingActionPolicy::Immediate,
        };
        let entitlements = match self.entitlements.entitlements(account.id).await {
            Ok(entitlements) => entitlements,
            Err(error) => {
                tracing::error!(
                    account_id = %account.id,
                    error = %error,
                    "Failed to list entitlements for cancellation"
                );
                return;
            }
        };
        let effective_date = self.clock.today_in(account.time_zone);
        // Add-ons are cancelled transitively by their base subscription
        for entitlement in entitlements.iter().filter(|e| !e.is_addon) {
            if let Err(error) = self
                .entitlements
                .cancel(entitlement.subscription_id, effective_date, policy)
                .await
            {
                tracing::error!(
                    account_id = %account.id,
                    subscription_id = %entitlement.subscription_id,
                    error = %error,
                    "Failed to cancel subscription for overdue state"
                );
            }
        }
    }

    async fn send_email_if_required(
        &self,
        account: &Account,
        billing_state: &BillingState,
        next: &OverdueStateConfig,
    ) {
        let Some(email) = &next.enter_state_email else {
            return;
        };
        let Some(to) = &account.email else {
            tracing::warn!(account_id = %account.id, "No account email for overdue notification");
            return;
        };
        let body = email
            .body
            .replace("{account}", &account.external_key)
            .replace("{state}", &next.name)
            .replace("{balance}", &billing_state.total_unpaid_balance.to_string());
        if let Err(error) = self.email.send(to, &email.subject, &body, email.is_html).await {
            tracing::warn!(
                account_id = %account.id,
                error = %error,
                "Unable to send overdue notification email"
            );
        }
    }

    /// Billing stays blocked while the account is in enforcement; the tag
    /// keeps generation from piling credit onto a blocked account
    async fn toggle_auto_invoicing_off(
        &self,
        account: &Account,
        previous: &OverdueStateConfig,
        next: &OverdueStateConfig,
    ) {
        if is_block_billing_transition(previous, next) {
            if let Err(error) = self
                .tags
                .add_tag(account.id, ControlTag::AutoInvoicingOff)
                .await
            {
                tracing::error!(
                    account_id = %account.id,
                    error = %error,
                    "Failed to add AUTO_INVOICING_OFF"
                );
            }
        } else if is_unblock_billing_transition(previous, next) {
            match self
                .tags
                .remove_tag(account.id, ControlTag::AutoInvoicingOff)
                .await
            {
                Ok(()) | Err(BillingError::TagNotFound(_)) => {}
                Err(error) => {
                    tracing::error!(
                        account_id = %account.id,
                        error = %error,
                        "Failed to remove AUTO_INVOICING_OFF"
                    );
                }
            }
        }
    }
}

fn is_block_billing_transition(previous: &OverdueStateConfig, next: &OverdueStateConfig) -> bool {
    !previous.blocks_billing() && next.blocks_billing()
}

fn is_unblock_billing_transition(previous: &OverdueStateConfig, next: &OverdueStateConfig) -> bool {
    previous.blocks_billing() && !next.blocks_billing()
}

/// In-memory collaborators for tests and standalone deployments
pub mod in_memory {
    use super::*;

    #[derive(Default)]
    pub struct InMemoryBlocking {
        pub records: Mutex<Vec<BlockingStateRecord>>,
    }

    impl InMemoryBlocking {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn current(&self, account_id: Uuid) -> Option<BlockingStateRecord> {
            self.records
                .lock()
                .await
                .iter()
                .rev()
                .find(|record| record.account_id == account_id)
                .cloned()
        }
    }

    #[async_trait]
    impl BlockingGateway for InMemoryBlocking {
        async fn set_blocking_state(&self, record: BlockingStateRecord) -> BillingResult<()> {
            self.records.lock().await.push(record);
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Cancellation {
        pub subscription_id: Uuid,
        pub effective_date: Date,
        pub policy: BillingActionPolicy,
    }

    #[derive(Default)]
    pub struct InMemoryEntitlements {
        pub all: Mutex<Vec<Entitlement>>,
        pub cancelled: Mutex<Vec<Cancellation>>,
    }

    impl InMemoryEntitlements {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn add(&self, entitlement: Entitlement) {
            self.all.lock().await.push(entitlement);
        }
    }

    #[async_trait]
    impl EntitlementGateway for InMemoryEntitlements {
        async fn entitlements(&self, _account_id: Uuid) -> BillingResult<Vec<Entitlement>> {
            Ok(self.all.lock().await.clone())
        }

        async fn cancel(
            &self,
            subscription_id: Uuid,
            effective_date: Date,
            policy: BillingActionPolicy,
        ) -> BillingResult<()> {
            self.cancelled.lock().await.push(Cancellation {
                subscription_id,
                effective_date,
                policy,
            });
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryCheckQueue {
        pub checks: Mutex<Vec<(Uuid, OffsetDateTime)>>,
    }

    impl InMemoryCheckQueue {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn pending_for(&self, account_id: Uuid) -> Vec<OffsetDateTime> {
            self.checks
                .lock()
                .await
                .iter()
                .filter(|(id, _)| *id == account_id)
                .map(|(_, at)| *at)
                .collect()
        }

        /// Drain checks due at or before `now`
        pub async fn due(&self, now: OffsetDateTime) -> Vec<Uuid> {
            let mut checks = self.checks.lock().await;
            let mut due = Vec::new();
            checks.retain(|(account_id, at)| {
                if *at <= now {
                    due.push(*account_id);
                    false
                } else {
                    true
                }
            });
            due
        }
    }

    #[async_trait]
    impl OverdueCheckQueue for InMemoryCheckQueue {
        async fn insert_check(&self, account_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
            self.checks.lock().await.push((account_id, at));
            Ok(())
        }

        async fn clear_checks(&self, account_id: Uuid) -> BillingResult<()> {
            self.checks.lock().await.retain(|(id, _)| *id != account_id);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryEmail {
        pub sent: Mutex<Vec<(String, String)>>,
    }

    impl InMemoryEmail {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl EmailSender for InMemoryEmail {
        async fn send(
            &self,
            to: &str,
            subject: &str,
            _body: &str,
            _is_html: bool,
        ) -> Result<(), String> {
            self.sent.lock().await.push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::in_memory::*;
    use super::*;
    use crate::events::InMemoryBus;
    use crate::tags::InMemoryTagStore;
    use rebill_shared::{Currency, ManualClock};
    use rust_decimal::Decimal;
    use time::macros::{date, datetime};
    use time::UtcOffset;

    fn account() -> Account {
        Account {
            id: Uuid::new_v4(),
            external_key: "acct-overdue".to_string(),
            email: Some("owner@example.com".to_string()),
            currency: Currency::Usd,
            time_zone: UtcOffset::UTC,
            payment_method_id: None,
        }
    }

    fn state_set() -> OverdueStateSet {
        OverdueStateSet {
            clear_state: OverdueStateConfig::clear("CLEAR"),
            states: vec![
                OverdueStateConfig {
                    name: "OD1".to_string(),
                    is_clear: false,
                    block_changes: true,
                    disable_entitlement_and_changes_blocked: false,
                    subscription_cancellation_policy: OverdueCancellationPolicy::None,
                    reevaluation_interval: Some(Duration::days(5)),
                    time_since_earliest_unpaid_invoice: Some(Duration::days(30)),
                    enter_state_email: Some(EnterStateEmail {
                        subject: "Account overdue".to_string(),
                        body: "Account {account} entered {state}, balance {balance}".to_string(),
                        is_html: false,
                    }),
                },
                OverdueStateConfig {
                    name: "OD2".to_string(),
                    is_clear: false,
                    block_changes: true,
                    disable_entitlement_and_changes_blocked: true,
                    subscription_cancellation_policy: OverdueCancellationPolicy::EndOfTerm,
                    reevaluation_interval: Some(Duration::days(5)),
                    time_since_earliest_unpaid_invoice: Some(Duration::days(60)),
                    enter_state_email: None,
                },
            ],
            initial_reevaluation_interval: Some(Duration::days(1)),
        }
    }

    fn billing_state(account_id: Uuid, earliest_unpaid: Option<Date>) -> BillingState {
        BillingState {
            account_id,
            unpaid_invoice_count: usize::from(earliest_unpaid.is_some()),
            total_unpaid_balance: if earliest_unpaid.is_some() {
                Decimal::from(100)
            } else {
                Decimal::ZERO
            },
            date_of_earliest_unpaid_invoice: earliest_unpaid,
        }
    }

    struct Fixture {
        applicator: OverdueStateApplicator,
        blocking: Arc<InMemoryBlocking>,
        entitlements: Arc<InMemoryEntitlements>,
        checks: Arc<InMemoryCheckQueue>,
        email: Arc<InMemoryEmail>,
        tags: Arc<InMemoryTagStore>,
        bus: Arc<InMemoryBus>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let blocking = InMemoryBlocking::new();
        let entitlements = InMemoryEntitlements::new();
        let checks = InMemoryCheckQueue::new();
        let email = InMemoryEmail::new();
        let tags = InMemoryTagStore::new();
        let bus = InMemoryBus::new();
        let clock = ManualClock::new(datetime!(2012-07-01 00:00 UTC));
        let applicator = OverdueStateApplicator::new(
            blocking.clone(),
            entitlements.clone(),
            checks.clone(),
            email.clone(),
            tags.clone(),
            bus.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            applicator,
            blocking,
            entitlements,
            checks,
            email,
            tags,
            bus,
            clock,
        }
    }

    #[tokio::test]
    async fn test_evaluate_picks_most_severe_applicable_tier() {
        let set = state_set();
        let account_id = Uuid::new_v4();

        let state = set.evaluate(
            &billing_state(account_id, Some(date!(2012 - 05 - 01))),
            date!(2012 - 07 - 05),
        );
        assert_eq!(state.name, "OD2");

        let state = set.evaluate(
            &billing_state(account_id, Some(date!(2012 - 06 - 01))),
            date!(2012 - 07 - 05),
        );
        assert_eq!(state.name, "OD1");

        let state = set.evaluate(&billing_state(account_id, None), date!(2012 - 07 - 05));
        assert!(state.is_clear);
    }

    #[tokio::test]
    async fn test_transition_blocks_and_tags_and_posts_event() {
        let f = fixture();
        let account = account();
        let set = state_set();
        let state = billing_state(account.id, Some(date!(2012 - 05 - 01)));

        f.applicator
            .apply(&set, &state, &account, &set.clear_state, &set.states[1])
            .await
            .unwrap();

        let record = f.blocking.current(account.id).await.unwrap();
        assert_eq!(record.state_name, "OD2");
        assert!(record.block_billing);

        assert!(f
            .tags
            .is_tagged(account.id, ControlTag::AutoInvoicingOff)
            .await
            .unwrap());

        let events = f.bus.posted().await;
        assert!(matches!(
            events.last().unwrap(),
            BusEvent::OverdueChange { blocked_billing: true, .. }
        ));

        // Re-check scheduled at now + tier interval
        let pending = f.checks.pending_for(account.id).await;
        assert_eq!(pending, vec![f.clock.now_utc() + Duration::days(5)]);
    }

    #[tokio::test]
    async fn test_clear_transition_removes_tag_and_cancels_checks() {
        let f = fixture();
        let account = account();
        let set = state_set();

        // In OD2 with the billing-block tag set
        f.tags
            .add_tag(account.id, ControlTag::AutoInvoicingOff)
            .await
            .unwrap();
        f.checks
            .insert_check(account.id, f.clock.now_utc() + Duration::days(5))
            .await
            .unwrap();

        let state = billing_state(account.id, None);
        f.applicator
            .apply(&set, &state, &account, &set.states[1], &set.clear_state)
            .await
            .unwrap();

        assert!(!f
            .tags
            .is_tagged(account.id, ControlTag::AutoInvoicingOff)
            .await
            .unwrap());
        assert!(f.checks.pending_for(account.id).await.is_empty());
        let events = f.bus.posted().await;
        assert!(matches!(
            events.last().unwrap(),
            BusEvent::OverdueChange { unblocked_billing: true, .. }
        ));
    }

    #[tokio::test]
    async fn test_clear_with_unpaid_invoice_schedules_initial_recheck() {
        let f = fixture();
        let account = account();
        let set = state_set();

        // Unpaid invoice not yet old enough for OD1: stay clear, watch
        let state = billing_state(account.id, Some(date!(2012 - 06 - 25)));
        f.applicator
            .apply(&set, &state, &account, &set.clear_state, &set.clear_state)
            .await
            .unwrap();

        let pending = f.checks.pending_for(account.id).await;
        assert_eq!(pending, vec![f.clock.now_utc() + Duration::days(1)]);
        // Same state: no transition side effects, no event
        assert!(f.bus.posted().await.is_empty());
        assert!(f.blocking.current(account.id).await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_skips_addons() {
        let f = fixture();
        let account = account();
        let set = state_set();
        let base = Uuid::new_v4();
        let addon = Uuid::new_v4();
        f.entitlements
            .add(Entitlement {
                subscription_id: base,
                bundle_id: Uuid::new_v4(),
                is_addon: false,
            })
            .await;
        f.entitlements
            .add(Entitlement {
                subscription_id: addon,
                bundle_id: Uuid::new_v4(),
                is_addon: true,
            })
            .await;

        let state = billing_state(account.id, Some(date!(2012 - 04 - 01)));
        f.applicator
            .apply(&set, &state, &account, &set.states[0], &set.states[1])
            .await
            .unwrap();

        let cancelled = f.entitlements.cancelled.lock().await.clone();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].subscription_id, base);
        assert_eq!(cancelled[0].policy, BillingActionPolicy::EndOfTerm);
    }

    #[tokio::test]
    async fn test_enforcement_off_tag_is_a_noop() {
        let f = fixture();
        let account = account();
        let set = state_set();
        f.tags
            .add_tag(account.id, ControlTag::OverdueEnforcementOff)
            .await
            .unwrap();

        let state = billing_state(account.id, Some(date!(2012 - 04 - 01)));
        f.applicator
            .apply(&set, &state, &account, &set.clear_state, &set.states[1])
            .await
            .unwrap();

        assert!(f.blocking.current(account.id).await.is_none());
        assert!(f.bus.posted().await.is_empty());
        assert!(f.checks.pending_for(account.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_email_sent_on_entering_tier_with_template() {
        let f = fixture();
        let account = account();
        let set = state_set();
        let state = billing_state(account.id, Some(date!(2012 - 06 - 01)));

        f.applicator
            .apply(&set, &state, &account, &set.clear_state, &set.states[0])
            .await
            .unwrap();

        let sent = f.email.sent.lock().await.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "owner@example.com");
        assert_eq!(sent[0].1, "Account overdue");
    }
}
