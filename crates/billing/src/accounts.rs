//! Account and subscription providers
//!
//! Read-only collaborator contracts: the engine never owns account or
//! entitlement data, it only needs the account snapshot (time zone,
//! external key, currency, default payment method) and the per-subscription
//! billing timelines.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use time::UtcOffset;
use tokio::sync::RwLock;
use uuid::Uuid;

use rebill_shared::Currency;

use crate::error::{BillingError, BillingResult};
use crate::timeline::SubscriptionTimeline;

/// Immutable account snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: Uuid,
    /// External identifier; also the account-lock key
    pub external_key: String,
    pub email: Option<String>,
    pub currency: Currency,
    pub time_zone: UtcOffset,
    pub payment_method_id: Option<Uuid>,
}

#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn account(&self, account_id: Uuid) -> BillingResult<Account>;

    /// Billing timelines for every subscription in the account's bundles
    async fn timelines(&self, account_id: Uuid) -> BillingResult<Vec<SubscriptionTimeline>>;
}

/// In-memory provider for tests and standalone deployments
#[derive(Default)]
pub struct InMemoryAccounts {
    accounts: RwLock<HashMap<Uuid, Account>>,
    timelines: RwLock<HashMap<Uuid, Vec<SubscriptionTimeline>>>,
}

impl InMemoryAccounts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert_account(&self, account: Account) {
        self.accounts.write().await.insert(account.id, account);
    }

    /// Replace the timelines for an account (a plan change re-publishes the
    /// whole timeline)
    pub async fn set_timelines(&self, account_id: Uuid, timelines: Vec<SubscriptionTimeline>) {
        self.timelines.write().await.insert(account_id, timelines);
    }
}

#[async_trait]
impl AccountProvider for InMemoryAccounts {
    async fn account(&self, account_id: Uuid) -> BillingResult<Account> {
        self.accounts
            .read()
            .await
            .get(&account_id)
            .cloned()
            .ok_or(BillingError::NoSuchAccount(account_id))
    }

    async fn timelines(&self, account_id: Uuid) -> BillingResult<Vec<SubscriptionTimeline>> {
        Ok(self
            .timelines
            .read()
            .await
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_account_is_an_error() {
        let provider = InMemoryAccounts::new();
        let missing = Uuid::new_v4();
        let err = provider.account(missing).await.unwrap_err();
        assert_eq!(err.code(), "NO_SUCH_ACCOUNT");
    }

    #[tokio::test]
    async fn test_account_round_trip() {
        let provider = InMemoryAccounts::new();
        let account = Account {
            id: Uuid::new_v4(),
            external_key: "acct-42".to_string(),
            email: None,
            currency: Currency::Usd,
            time_zone: UtcOffset::UTC,
            payment_method_id: None,
        };
        provider.insert_account(account.clone()).await;
        assert_eq!(provider.account(account.id).await.unwrap(), account);
        assert!(provider.timelines(account.id).await.unwrap().is_empty());
    }
}
