//! Typed event bus for orchestration progress.
//!
//! Delivery is synchronous and in registration order. Handlers run outside
//! the registry lock, so a handler may subscribe or unsubscribe without
//! deadlocking; such changes take effect from the next publish.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::AvailError;
use crate::steps::{ProgressStep, StepKind};
use crate::types::{
    Address, Amount, BridgeEstimate, BridgeOperation, ChainId, OperationId, TokenSymbol, TxHash,
    UnifiedBalance,
};

/// Event type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AllowanceApprovalRequired,
    IntentApprovalRequired,
    BridgeExecuteExpectedSteps,
    BridgeExecuteCompletedSteps,
    BridgeExecuteCompleted,
    BridgeExecuteFailed,
    UnifiedBalanceUpdated,
    /// A subscriber's handler failed. Only delivered to explicit subscribers.
    HandlerError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AllowanceApprovalRequired => "ALLOWANCE_APPROVAL_REQUIRED",
            EventKind::IntentApprovalRequired => "INTENT_APPROVAL_REQUIRED",
            EventKind::BridgeExecuteExpectedSteps => "BRIDGE_EXECUTE_EXPECTED_STEPS",
            EventKind::BridgeExecuteCompletedSteps => "BRIDGE_EXECUTE_COMPLETED_STEPS",
            EventKind::BridgeExecuteCompleted => "BRIDGE_EXECUTE_COMPLETED",
            EventKind::BridgeExecuteFailed => "BRIDGE_EXECUTE_FAILED",
            EventKind::UnifiedBalanceUpdated => "UNIFIED_BALANCE_UPDATED",
            EventKind::HandlerError => "HANDLER_ERROR",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload, keyed on the event type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventData {
    AllowanceApprovalRequired {
        chain_id: ChainId,
        token: TokenSymbol,
        spender: Address,
        current: Amount,
        required: Amount,
    },
    IntentApprovalRequired {
        operation: BridgeOperation,
        estimate: BridgeEstimate,
    },
    BridgeExecuteExpectedSteps {
        steps: Vec<StepKind>,
    },
    BridgeExecuteCompletedSteps {
        step: ProgressStep,
        completed: usize,
        expected: usize,
        progress: u8,
    },
    BridgeExecuteCompleted {
        source_transaction_hash: TxHash,
        transaction_hash: TxHash,
    },
    BridgeExecuteFailed {
        error: AvailError,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<StepKind>,
    },
    UnifiedBalanceUpdated {
        balance: UnifiedBalance,
    },
    HandlerError {
        subscription_id: u64,
        event_type: EventKind,
        message: String,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::AllowanceApprovalRequired { .. } => EventKind::AllowanceApprovalRequired,
            EventData::IntentApprovalRequired { .. } => EventKind::IntentApprovalRequired,
            EventData::BridgeExecuteExpectedSteps { .. } => EventKind::BridgeExecuteExpectedSteps,
            EventData::BridgeExecuteCompletedSteps { .. } => EventKind::BridgeExecuteCompletedSteps,
            EventData::BridgeExecuteCompleted { .. } => EventKind::BridgeExecuteCompleted,
            EventData::BridgeExecuteFailed { .. } => EventKind::BridgeExecuteFailed,
            EventData::UnifiedBalanceUpdated { .. } => EventKind::UnifiedBalanceUpdated,
            EventData::HandlerError { .. } => EventKind::HandlerError,
        }
    }
}

/// A published event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailEvent {
    #[serde(flatten)]
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
}

impl AvailEvent {
    pub fn new(data: EventData) -> Self {
        Self {
            data,
            timestamp: Utc::now(),
            operation_id: None,
        }
    }

    pub fn for_operation(operation_id: OperationId, data: EventData) -> Self {
        Self {
            operation_id: Some(operation_id),
            ..Self::new(data)
        }
    }

    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }
}

/// Which events a subscription receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventFilter {
    Kind(EventKind),
    /// Every event except [`EventKind::HandlerError`].
    Any,
}

impl EventFilter {
    pub fn matches(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::Kind(wanted) => *wanted == kind,
            EventFilter::Any => kind != EventKind::HandlerError,
        }
    }
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        EventFilter::Kind(kind)
    }
}

type Handler = dyn Fn(&AvailEvent) -> anyhow::Result<()> + Send + Sync;

struct Registration {
    id: u64,
    filter: EventFilter,
    handler: Box<Handler>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Arc<Registration>>>,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }
}

/// Publish/subscribe hub shared by every orchestrator component.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events matching `filter`.
    ///
    /// The returned [`Subscription`] unsubscribes when dropped.
    pub fn subscribe<F>(&self, filter: impl Into<EventFilter>, handler: F) -> Subscription
    where
        F: Fn(&AvailEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            id,
            filter: filter.into(),
            handler: Box::new(handler),
        });
        self.inner
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(registration);

        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every matching subscriber registered right now.
    ///
    /// Never fails: handler errors and panics are turned into
    /// `HANDLER_ERROR` events.
    pub fn publish(&self, event: AvailEvent) {
        let kind = event.kind();
        let targets: Vec<Arc<Registration>> = self
            .inner
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.filter.matches(kind))
            .cloned()
            .collect();

        debug!(event = %kind, subscribers = targets.len(), "publishing event");

        for registration in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.handler)(&event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => format!("handler panicked: {}", panic_message(payload.as_ref())),
            };

            if kind == EventKind::HandlerError {
                error!(
                    subscription = registration.id,
                    error = %message,
                    "handler error subscriber failed"
                );
                continue;
            }

            warn!(
                subscription = registration.id,
                event = %kind,
                error = %message,
                "event handler failed"
            );
            let report = EventData::HandlerError {
                subscription_id: registration.id,
                event_type: kind,
                message,
            };
            self.publish(AvailEvent {
                operation_id: event.operation_id.clone(),
                ..AvailEvent::new(report)
            });
        }
    }

    /// Remove a subscription. Equivalent to dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        subscription.unsubscribe();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.inner
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a registered handler.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.bus
            .upgrade()
            .map(|bus| {
                bus.registrations
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .any(|r| r.id == self.id)
            })
            .unwrap_or(false)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keep the handler registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.bus = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
