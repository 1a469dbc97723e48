//! Rebill Background Worker
//!
//! Drives the engine's scheduled work:
//! - Payment retry queue drain (every minute)
//! - Overdue re-check sweep (hourly)
//! - Health check heartbeat (every 5 minutes)
//!
//! The worker wires the engine over its in-memory collaborators
//! (standalone mode). Deployments embedding the engine swap the stores,
//! gateway plugin and overdue configuration for their own implementations
//! and reuse the same job bodies.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use rebill_billing::{
    BillingConfig, BillingService, BillingState, EnterStateEmail, ExternalGatewayPlugin,
    InMemoryAccounts, InMemoryBus, InMemoryStore, InMemoryTagStore, InvoiceStore,
    OverdueCancellationPolicy, OverdueStateConfig, OverdueStateSet, PaymentServiceConfig,
    RetryCategory, RetryQueue, RetrySchedulers,
};
use rebill_billing::overdue::in_memory::{
    InMemoryBlocking, InMemoryCheckQueue, InMemoryEmail, InMemoryEntitlements,
};
use rebill_shared::{Clock, SystemClock};

/// Default overdue tiers for standalone mode; deployments supply their own
fn default_overdue_state_set() -> OverdueStateSet {
    OverdueStateSet {
        clear_state: OverdueStateConfig::clear("CLEAR"),
        states: vec![
            OverdueStateConfig {
                name: "OD1".to_string(),
                is_clear: false,
                block_changes: true,
                disable_entitlement_and_changes_blocked: false,
                subscription_cancellation_policy: OverdueCancellationPolicy::None,
                reevaluation_interval: Some(time::Duration::days(5)),
                time_since_earliest_unpaid_invoice: Some(time::Duration::days(30)),
                enter_state_email: Some(EnterStateEmail {
                    subject: "Your account is overdue".to_string(),
                    body: "Account {account} entered {state}; outstanding balance {balance}."
                        .to_string(),
                    is_html: false,
                }),
            },
            OverdueStateConfig {
                name: "OD2".to_string(),
                is_clear: false,
                block_changes: true,
                disable_entitlement_and_changes_blocked: true,
                subscription_cancellation_policy: OverdueCancellationPolicy::EndOfTerm,
                reevaluation_interval: Some(time::Duration::days(5)),
                time_since_earliest_unpaid_invoice: Some(time::Duration::days(60)),
                enter_state_email: None,
            },
        ],
        initial_reevaluation_interval: Some(time::Duration::days(1)),
    }
}

/// Re-enter the state machine for every due retry entry
async fn drain_payment_retries(
    service: &BillingService,
    queue: &RetryQueue,
    clock: &dyn Clock,
) {
    let due = queue.due(clock.now_utc()).await;
    if due.is_empty() {
        return;
    }

    let total = due.len();
    let mut errors = 0;
    for entry in due {
        let result = match entry.category {
            RetryCategory::PaymentFailure => {
                service.payments.retry_payment_failure(entry.payment_id).await
            }
            RetryCategory::PluginFailure => {
                service.payments.retry_plugin_failure(entry.payment_id).await
            }
            RetryCategory::AutoPayOffResume => {
                service.payments.retry_auto_pay_off(entry.payment_id).await
            }
        };
        if let Err(e) = result {
            // Declines re-schedule themselves; anything else is diagnostic
            error!(payment_id = %entry.payment_id, error = %e, "Payment retry failed");
            errors += 1;
        }
    }
    info!(total = total, errors = errors, "Payment retry drain complete");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Rebill Worker");

    let store = InMemoryStore::new();
    let accounts = InMemoryAccounts::new();
    let tags = InMemoryTagStore::new();
    let bus = InMemoryBus::new();
    let blocking = InMemoryBlocking::new();
    let entitlements = InMemoryEntitlements::new();
    let checks = InMemoryCheckQueue::new();
    let email = InMemoryEmail::new();
    let clock = Arc::new(SystemClock);
    let queue = RetryQueue::new();
    let retries = RetrySchedulers::from_env(queue.clone());
    let config = BillingConfig::from_env();

    info!(
        scale = config.money.scale,
        strategy = config.default_repair_strategy.as_str(),
        "Worker running in standalone mode (in-memory stores)"
    );

    let service = Arc::new(BillingService::new(
        store.clone(),
        store.clone(),
        accounts.clone(),
        tags,
        bus,
        Arc::new(ExternalGatewayPlugin),
        blocking.clone(),
        entitlements,
        checks.clone(),
        email,
        clock.clone(),
        retries,
        config,
        PaymentServiceConfig::from_env(),
    ));
    let state_set = Arc::new(default_overdue_state_set());

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain the payment retry queue (every minute)
    let retry_service = service.clone();
    let retry_queue = queue.clone();
    let retry_clock = clock.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let service = retry_service.clone();
            let queue = retry_queue.clone();
            let clock = retry_clock.clone();
            Box::pin(async move {
                drain_payment_retries(&service, &queue, clock.as_ref()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Payment retry drain (every minute)");

    // Job 2: Overdue re-check sweep (hourly)
    let overdue_service = service.clone();
    let overdue_store = store.clone();
    let overdue_accounts = accounts.clone();
    let overdue_blocking = blocking.clone();
    let overdue_checks = checks.clone();
    let overdue_clock = clock.clone();
    let overdue_states = state_set.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = overdue_service.clone();
            let store = overdue_store.clone();
            let accounts = overdue_accounts.clone();
            let blocking = overdue_blocking.clone();
            let checks = overdue_checks.clone();
            let clock = overdue_clock.clone();
            let state_set = overdue_states.clone();
            Box::pin(async move {
                let due = checks.due(clock.now_utc()).await;
                if due.is_empty() {
                    return;
                }
                info!(count = due.len(), "Running overdue re-checks");

                let mut errors = 0;
                for account_id in due {
                    if let Err(e) = recheck_account(
                        &service,
                        store.as_ref(),
                        &accounts,
                        &blocking,
                        &state_set,
                        clock.as_ref(),
                        account_id,
                    )
                    .await
                    {
                        error!(account_id = %account_id, error = %e, "Overdue re-check failed");
                        errors += 1;
                    }
                }
                info!(errors = errors, "Overdue re-check sweep complete");
            })
        })?)
        .await?;
    info!("Scheduled: Overdue re-check sweep (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Rebill Worker started successfully with 3 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
    }
}

/// Evaluate one account against the overdue configuration and apply the
/// resulting transition
async fn recheck_account(
    service: &BillingService,
    store: &InMemoryStore,
    accounts: &InMemoryAccounts,
    blocking: &InMemoryBlocking,
    state_set: &OverdueStateSet,
    clock: &dyn Clock,
    account_id: uuid::Uuid,
) -> anyhow::Result<()> {
    use rebill_billing::AccountProvider;

    let account = accounts.account(account_id).await?;
    let invoices = store.invoices_by_account(account_id).await?;
    let mut pairs = Vec::with_capacity(invoices.len());
    for invoice in invoices {
        let payments = store.invoice_payments(invoice.id).await?;
        pairs.push((invoice, payments));
    }
    let billing_state = BillingState::compute(&service.config.money, account_id, &pairs);

    let today = clock.today_in(account.time_zone);
    let next = state_set.evaluate(&billing_state, today).clone();
    let previous = match blocking.current(account_id).await {
        Some(record) => state_set
            .state_by_name(&record.state_name)
            .cloned()
            .unwrap_or_else(|| state_set.clear_state.clone()),
        None => state_set.clear_state.clone(),
    };

    service
        .overdue
        .apply(state_set, &billing_state, &account, &previous, &next)
        .await?;
    Ok(())
}
