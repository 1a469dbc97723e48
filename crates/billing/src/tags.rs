//! Account control tags
//!
//! Boolean switches attached to an account that gate engine behavior.
//! AUTO_INVOICING_OFF is toggled internally by the overdue applicator; the
//! other two are operator-facing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlTag {
    /// Suspend automatic payment attempts for the account
    AutoPayOff,
    /// Suppress invoice generation (set while billing is blocked overdue)
    AutoInvoicingOff,
    /// Exempt the account from overdue enforcement entirely
    OverdueEnforcementOff,
}

impl ControlTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlTag::AutoPayOff => "AUTO_PAY_OFF",
            ControlTag::AutoInvoicingOff => "AUTO_INVOICING_OFF",
            ControlTag::OverdueEnforcementOff => "OVERDUE_ENFORCEMENT_OFF",
        }
    }
}

#[async_trait]
pub trait TagStore: Send + Sync {
    async fn is_tagged(&self, account_id: Uuid, tag: ControlTag) -> BillingResult<bool>;

    /// Adding an already-present tag is a no-op
    async fn add_tag(&self, account_id: Uuid, tag: ControlTag) -> BillingResult<()>;

    /// Removing an absent tag is `TagNotFound`; callers that treat removal
    /// as idempotent tolerate that variant explicitly
    async fn remove_tag(&self, account_id: Uuid, tag: ControlTag) -> BillingResult<()>;
}

#[derive(Default)]
pub struct InMemoryTagStore {
    tags: RwLock<HashSet<(Uuid, ControlTag)>>,
}

impl InMemoryTagStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TagStore for InMemoryTagStore {
    async fn is_tagged(&self, account_id: Uuid, tag: ControlTag) -> BillingResult<bool> {
        Ok(self.tags.read().await.contains(&(account_id, tag)))
    }

    async fn add_tag(&self, account_id: Uuid, tag: ControlTag) -> BillingResult<()> {
        self.tags.write().await.insert((account_id, tag));
        Ok(())
    }

    async fn remove_tag(&self, account_id: Uuid, tag: ControlTag) -> BillingResult<()> {
        if self.tags.write().await.remove(&(account_id, tag)) {
            Ok(())
        } else {
            Err(BillingError::TagNotFound(tag.as_str().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tag_lifecycle() {
        let store = InMemoryTagStore::new();
        let account_id = Uuid::new_v4();

        assert!(!store.is_tagged(account_id, ControlTag::AutoPayOff).await.unwrap());
        store.add_tag(account_id, ControlTag::AutoPayOff).await.unwrap();
        assert!(store.is_tagged(account_id, ControlTag::AutoPayOff).await.unwrap());
        store.remove_tag(account_id, ControlTag::AutoPayOff).await.unwrap();
        assert!(!store.is_tagged(account_id, ControlTag::AutoPayOff).await.unwrap());
    }

    #[tokio::test]
    async fn test_removing_absent_tag_is_tag_not_found() {
        let store = InMemoryTagStore::new();
        let err = store
            .remove_tag(Uuid::new_v4(), ControlTag::AutoInvoicingOff)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TAG_NOT_FOUND");
    }
}
