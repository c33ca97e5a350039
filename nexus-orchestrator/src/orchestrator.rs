//! Public entry point tying the components together.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, RwLock, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::balance::BalanceAggregator;
use crate::cancel::CancelGate;
use crate::config::{ConcurrentOperationPolicy, OrchestratorConfig};
use crate::connector::{ChainConnector, Signer};
use crate::error::AvailError;
use crate::estimator::BridgeEstimator;
use crate::events::{AvailEvent, EventBus, EventFilter, EventKind, Subscription};
use crate::machine::{MachineContext, PaymentMachine};
use crate::retry::{retry_on_timeout, RetryPolicy};
use crate::state::{PaymentState, StateWriter};
use crate::types::{BridgeEstimate, BridgeOperation, ChainId, OperationId, TokenSymbol, UnifiedBalance};

/// Handle returned by [`NexusOrchestrator::submit`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationHandle(OperationId);

impl OperationHandle {
    pub fn id(&self) -> &OperationId {
        &self.0
    }
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Entry {
    state: watch::Receiver<PaymentState>,
    gate: Arc<CancelGate>,
}

/// Known operations in submission order.
#[derive(Default)]
struct Registry {
    entries: HashMap<OperationId, Entry>,
    order: VecDeque<OperationId>,
}

impl Registry {
    fn insert(&mut self, id: OperationId, entry: Entry) {
        self.entries.insert(id.clone(), entry);
        self.order.push_back(id);
    }

    fn remove(&mut self, id: &OperationId) {
        self.entries.remove(id);
        self.order.retain(|known| known != id);
    }

    fn lookup(&self, handle: &OperationHandle) -> Result<&Entry, AvailError> {
        self.entries
            .get(handle.id())
            .ok_or_else(|| AvailError::operation_not_found(handle))
    }

    /// Evict the oldest finished operations until at most `retain` remain.
    /// Operations still running are never evicted.
    fn prune(&mut self, retain: usize) -> usize {
        let Registry { entries, order } = self;
        let mut excess = entries.len().saturating_sub(retain);
        let before = entries.len();
        order.retain(|id| {
            if excess == 0 {
                return true;
            }
            let finished = entries
                .get(id)
                .map_or(true, |entry| entry.state.borrow().is_frozen());
            if finished {
                entries.remove(id);
                excess -= 1;
            }
            !finished
        });
        before - entries.len()
    }
}

/// Queued unit of work for the execution loop.
struct Job {
    machine: PaymentMachine,
    /// Held until the operation is terminal under the reject policy.
    permit: Option<OwnedSemaphorePermit>,
}

/// Orchestrates bridge payments for one owner account.
///
/// Operations execute one at a time in submission order. Each runs on a
/// background task; callers observe it through [`NexusOrchestrator::get_state`],
/// [`NexusOrchestrator::wait_for_completion`] and the event bus.
pub struct NexusOrchestrator {
    config: Arc<OrchestratorConfig>,
    ctx: MachineContext,
    aggregator: BalanceAggregator,
    sequence: AtomicU64,
    slot: Arc<Semaphore>,
    jobs: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
    operations: RwLock<Registry>,
}

impl NexusOrchestrator {
    /// Validate `config` and start the execution loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        connector: Arc<dyn ChainConnector>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self, AvailError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            AvailError::invalid_configuration("orchestrator must be created inside a Tokio runtime")
        })?;

        let config = Arc::new(config);
        let events = EventBus::new();
        let estimator = Arc::new(BridgeEstimator::new(connector.clone(), config.clone()));
        let aggregator = BalanceAggregator::new(connector.clone(), config.clone(), events.clone());
        let ctx = MachineContext {
            connector,
            signer,
            estimator,
            config: config.clone(),
            events,
            retry: RetryPolicy::from_config(&config),
        };

        let (jobs, job_rx) = mpsc::unbounded_channel();
        let worker = runtime.spawn(run_loop(job_rx));

        info!(
            network = ?config.network,
            rpc_url = config.rpc_url(),
            policy = ?config.concurrent_operation_policy,
            "orchestrator initialised"
        );

        Ok(Self {
            config,
            ctx,
            aggregator,
            sequence: AtomicU64::new(0),
            slot: Arc::new(Semaphore::new(1)),
            jobs,
            worker,
            operations: RwLock::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The bus every component publishes on.
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// Estimate without submitting. Retries timeouts like a submitted run.
    pub async fn estimate(&self, operation: &BridgeOperation) -> Result<BridgeEstimate, AvailError> {
        let estimator = &self.ctx.estimator;
        retry_on_timeout(self.ctx.retry, "estimate", |_| estimator.estimate(operation)).await
    }

    /// Queue `operation` for execution.
    ///
    /// Fails synchronously only for invalid input or, under the reject
    /// policy, when another operation holds the execution slot. Everything
    /// after that is reported through the operation's state and events.
    pub async fn submit(&self, operation: BridgeOperation) -> Result<OperationHandle, AvailError> {
        operation.validate()?;

        let permit = match self.config.concurrent_operation_policy {
            ConcurrentOperationPolicy::Queue => None,
            ConcurrentOperationPolicy::Reject => match self.slot.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(TryAcquireError::NoPermits) => return Err(AvailError::operation_in_flight()),
                Err(TryAcquireError::Closed) => return Err(disposed()),
            },
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let id = OperationId::derive(sequence, &operation);
        let (writer, state) = StateWriter::new(id.clone());
        let gate = Arc::new(CancelGate::new());
        let machine = PaymentMachine::new(
            id.clone(),
            operation,
            self.ctx.clone(),
            writer,
            gate.clone(),
        );

        // Registered before queueing so the handle is valid immediately.
        {
            let mut operations = self.operations.write().await;
            operations.insert(id.clone(), Entry { state, gate });
            let evicted = operations.prune(self.config.max_retained_operations);
            if evicted > 0 {
                debug!(evicted, retained = operations.entries.len(), "finished operations evicted");
            }
        }

        if self.jobs.send(Job { machine, permit }).is_err() {
            self.operations.write().await.remove(&id);
            return Err(disposed());
        }

        info!(operation = %id, sequence, "operation submitted");
        Ok(OperationHandle(id))
    }

    /// Snapshot of the operation's current state.
    pub async fn get_state(&self, handle: &OperationHandle) -> Result<PaymentState, AvailError> {
        let operations = self.operations.read().await;
        let entry = operations.lookup(handle)?;
        let state = entry.state.borrow().clone();
        Ok(state)
    }

    /// Receiver that yields every state change of the operation.
    pub async fn subscribe_state(
        &self,
        handle: &OperationHandle,
    ) -> Result<watch::Receiver<PaymentState>, AvailError> {
        let operations = self.operations.read().await;
        Ok(operations.lookup(handle)?.state.clone())
    }

    /// Cancel an operation that is waiting for approval.
    ///
    /// In any other phase this fails with `CancellationNotAllowed` and the
    /// operation is left untouched. An accepted cancellation ends the
    /// operation as failed with `UserRejected`.
    pub async fn cancel(&self, handle: &OperationHandle) -> Result<(), AvailError> {
        let operations = self.operations.read().await;
        let entry = operations.lookup(handle)?;
        let phase = entry.state.borrow().phase;

        if !phase.accepts_cancellation() || !entry.gate.request() {
            let phase = entry.state.borrow().phase;
            return Err(AvailError::cancellation_not_allowed(phase));
        }
        info!(operation = %handle, phase = %phase, "cancellation accepted");
        Ok(())
    }

    /// Resolve with the frozen terminal state of the operation.
    pub async fn wait_for_completion(
        &self,
        handle: &OperationHandle,
    ) -> Result<PaymentState, AvailError> {
        let mut state = self.subscribe_state(handle).await?;
        let terminal = state
            .wait_for(PaymentState::is_frozen)
            .await
            .map_err(|_| AvailError::internal(format!("state of {handle} dropped before completion")))?;
        Ok(terminal.clone())
    }

    /// Aggregate `token` balances over `chain_ids`.
    pub async fn get_unified_balance(
        &self,
        token: impl Into<TokenSymbol>,
        chain_ids: &[ChainId],
    ) -> Result<UnifiedBalance, AvailError> {
        self.aggregator
            .get_unified_balance(&token.into(), chain_ids)
            .await
    }

    /// Subscribe to one event type.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&AvailEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.events.subscribe(kind, handler)
    }

    /// Subscribe to every event except handler failures.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AvailEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.events.subscribe(EventFilter::Any, handler)
    }

    /// Shut down: cancel everything that has not broadcast yet, wait for
    /// the rest to reach a terminal state, then drop all subscriptions.
    pub async fn dispose(self) {
        let NexusOrchestrator {
            ctx,
            slot,
            jobs,
            worker,
            operations,
            ..
        } = self;

        slot.close();
        drop(jobs);

        let operations = operations.into_inner().entries;
        let cancelled = operations
            .values()
            .filter(|entry| entry.gate.force())
            .count();
        info!(
            operations = operations.len(),
            cancelled, "disposing orchestrator"
        );

        if let Err(err) = worker.await {
            error!(error = %err, "execution loop terminated abnormally");
        }
        ctx.events.clear();
    }
}

fn disposed() -> AvailError {
    AvailError::invalid_operation("orchestrator has been disposed")
}

/// Runs queued operations one after another until the queue closes.
async fn run_loop(mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(Job { machine, permit }) = jobs.recv().await {
        let state = machine.run().await;
        drop(permit);
        info!(
            operation = %state.operation_id,
            phase = %state.phase,
            "operation finished"
        );
    }
}
