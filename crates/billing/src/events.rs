//! Bus events
//!
//! Every completed state transition posts exactly one event describing the
//! outcome. Delivery is best-effort at-least-once: posting failures are
//! logged and never roll back the persisted state, and consumers must
//! tolerate duplicates and reordering.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::payment::PaymentStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusEvent {
    InvoiceCreation {
        account_id: Uuid,
        invoice_id: Uuid,
        amount: Decimal,
    },
    /// A previously generated (possibly paid) invoice had adjustment items
    /// appended; overdue re-evaluation listens for this
    InvoiceAdjustment {
        account_id: Uuid,
        invoice_id: Uuid,
    },
    PaymentInfo {
        account_id: Uuid,
        invoice_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        status: PaymentStatus,
    },
    PaymentError {
        account_id: Uuid,
        invoice_id: Uuid,
        payment_id: Option<Uuid>,
        message: String,
    },
    PaymentPluginError {
        account_id: Uuid,
        invoice_id: Uuid,
        payment_id: Uuid,
        message: String,
    },
    OverdueChange {
        account_id: Uuid,
        previous_state: String,
        next_state: String,
        blocked_billing: bool,
        unblocked_billing: bool,
    },
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn post(&self, event: BusEvent) -> Result<(), String>;
}

/// Post an event, logging (not propagating) failure
pub async fn post_or_log(bus: &dyn EventBus, event: BusEvent) {
    if let Err(error) = bus.post(event).await {
        tracing::error!(error = %error, "Failed to post bus event");
    }
}

/// Capturing bus for tests and standalone runs
#[derive(Default)]
pub struct InMemoryBus {
    posted: Mutex<Vec<BusEvent>>,
    fail_next: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn posted(&self) -> Vec<BusEvent> {
        self.posted.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.posted.lock().await.clear();
    }

    /// Make the next post fail (tests exercising the log-don't-abort path)
    pub fn fail_next_post(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn post(&self, event: BusEvent) -> Result<(), String> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err("bus unavailable".to_string());
        }
        self.posted.lock().await.push(event);
        Ok(())
    }
}
