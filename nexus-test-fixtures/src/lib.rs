//! Shared test doubles for the orchestrator.
//!
//! [`MockChainConnector`] keeps balances, allowances and transactions in
//! memory and can be told to fail in the ways a real chain does.
//! [`ScriptedSigner`] answers approval requests from a script.
//! [`EventRecorder`] captures everything published on a bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use nexus_orchestrator::{
    Address, Amount, ApprovalDecision, ApprovalRequest, AvailEvent, BridgeOperation,
    ChainConnector, ChainId, ConnectorError, EventBus, EventFilter, EventKind, NetworkConditions,
    NexusOrchestrator, OrchestratorConfig, Receipt, Signer, SignerError, Subscription,
    TokenSymbol, TransactionPayload, TxHash,
};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::debug;

pub const OWNER: &str = "0x00000000000000000000000000000000000a11ce";
pub const BRIDGE_CONTRACT: &str = "0x0000000000000000000000000000000000b41d9e";

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG AND OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Config with the chains used across the tests and short timeouts.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        source_chains: vec![ChainId::ETHEREUM, ChainId::POLYGON, ChainId::OPTIMISM],
        bridge_contract: Address::from(BRIDGE_CONTRACT),
        confirmation_timeout_ms: 2_000,
        approval_timeout_ms: 5_000,
        balance_query_timeout_ms: 1_000,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 100,
        ..OrchestratorConfig::new(OWNER)
    }
}

pub fn amount(value: &str) -> Amount {
    Amount::parse(value).expect("valid amount literal")
}

pub fn decimal(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal literal")
}

pub fn usdc_operation(value: &str, destination: u64) -> BridgeOperation {
    BridgeOperation::new("USDC", value, destination).expect("valid operation")
}

/// Conditions that keep slippage well under the default 1% limit.
pub fn default_conditions() -> NetworkConditions {
    NetworkConditions {
        gas_price: decimal("0.00000002"),
        gas_limit: Decimal::from(150_000),
        bridge_fee_rate: decimal("0.001"),
        liquidity_depth: Decimal::from(10_000_000),
        source_finality_secs: 60,
        settlement_secs: 120,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHAIN CONNECTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// A transaction accepted by the mock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedTx {
    pub chain_id: ChainId,
    pub payload: TransactionPayload,
    pub tx_hash: TxHash,
}

struct MockState {
    balances: HashMap<(ChainId, TokenSymbol), Amount>,
    prices: HashMap<TokenSymbol, Decimal>,
    allowances: HashMap<(ChainId, TokenSymbol), Amount>,
    conditions: NetworkConditions,
    blocked_routes: HashSet<(ChainId, ChainId)>,
    failing_chains: HashMap<ChainId, ConnectorError>,
    price_failure: Option<ConnectorError>,
    confirmation_timeouts: HashMap<ChainId, u32>,
    reverting_chains: HashSet<ChainId>,
    hanging_chains: HashSet<ChainId>,
    hanging_conditions: bool,
    submit_failures: VecDeque<ConnectorError>,
    submitted: Vec<SubmittedTx>,
    confirmation_requests: Vec<(ChainId, TxHash)>,
    next_tx: u64,
    next_block: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            balances: HashMap::new(),
            prices: HashMap::new(),
            allowances: HashMap::new(),
            conditions: default_conditions(),
            blocked_routes: HashSet::new(),
            failing_chains: HashMap::new(),
            price_failure: None,
            confirmation_timeouts: HashMap::new(),
            reverting_chains: HashSet::new(),
            hanging_chains: HashSet::new(),
            hanging_conditions: false,
            submit_failures: VecDeque::new(),
            submitted: Vec::new(),
            confirmation_requests: Vec::new(),
            next_tx: 1,
            next_block: 1_000,
        }
    }
}

/// In-memory [`ChainConnector`].
pub struct MockChainConnector {
    state: Mutex<MockState>,
    /// While `true`, confirmations block until released.
    hold: watch::Sender<bool>,
    /// While `true`, submissions block until released.
    hold_submits: watch::Sender<bool>,
    /// Number of submissions currently blocked.
    pending_submits: watch::Sender<usize>,
}

impl Default for MockChainConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainConnector {
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        let (hold_submits, _) = watch::channel(false);
        let (pending_submits, _) = watch::channel(0);
        Self {
            state: Mutex::new(MockState::default()),
            hold,
            hold_submits,
            pending_submits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state poisoned")
    }

    pub fn with_balance(self, chain: impl Into<ChainId>, token: &str, value: &str) -> Self {
        self.set_balance(chain, token, value);
        self
    }

    pub fn with_price(self, token: &str, price: &str) -> Self {
        self.lock()
            .prices
            .insert(TokenSymbol::from(token), decimal(price));
        self
    }

    pub fn with_allowance(self, chain: impl Into<ChainId>, token: &str, value: &str) -> Self {
        self.lock()
            .allowances
            .insert((chain.into(), TokenSymbol::from(token)), amount(value));
        self
    }

    pub fn with_conditions(self, conditions: NetworkConditions) -> Self {
        self.lock().conditions = conditions;
        self
    }

    pub fn with_blocked_route(self, from: impl Into<ChainId>, to: impl Into<ChainId>) -> Self {
        self.lock().blocked_routes.insert((from.into(), to.into()));
        self
    }

    /// Balance reads on `chain` fail with an RPC error.
    pub fn with_failing_chain(self, chain: impl Into<ChainId>) -> Self {
        self.fail_chain(
            chain,
            ConnectorError::Rpc {
                code: Some(-32603),
                message: "upstream node unavailable".into(),
            },
        );
        self
    }

    pub fn with_failing_price(self) -> Self {
        self.lock().price_failure = Some(ConnectorError::Rpc {
            code: None,
            message: "price feed offline".into(),
        });
        self
    }

    /// Balance reads on `chain` never answer.
    pub fn with_hanging_chain(self, chain: impl Into<ChainId>) -> Self {
        self.lock().hanging_chains.insert(chain.into());
        self
    }

    /// Network condition queries never answer.
    pub fn with_hanging_conditions(self) -> Self {
        self.lock().hanging_conditions = true;
        self
    }

    /// Transactions confirmed on `chain` report a revert.
    pub fn with_reverting_chain(self, chain: impl Into<ChainId>) -> Self {
        self.lock().reverting_chains.insert(chain.into());
        self
    }

    pub fn set_balance(&self, chain: impl Into<ChainId>, token: &str, value: &str) {
        self.lock()
            .balances
            .insert((chain.into(), TokenSymbol::from(token)), amount(value));
    }

    pub fn fail_chain(&self, chain: impl Into<ChainId>, error: ConnectorError) {
        self.lock().failing_chains.insert(chain.into(), error);
    }

    /// The next `times` confirmation waits on `chain` time out.
    pub fn time_out_confirmations(&self, chain: impl Into<ChainId>, times: u32) {
        self.lock()
            .confirmation_timeouts
            .insert(chain.into(), times);
    }

    /// The next submission fails with `error`.
    pub fn fail_next_submit(&self, error: ConnectorError) {
        self.lock().submit_failures.push_back(error);
    }

    /// Block every confirmation until [`MockChainConnector::release_confirmations`].
    pub fn hold_confirmations(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_confirmations(&self) {
        self.hold.send_replace(false);
    }

    /// Block every submission until [`MockChainConnector::release_submissions`].
    pub fn hold_submissions(&self) {
        self.hold_submits.send_replace(true);
    }

    pub fn release_submissions(&self) {
        self.hold_submits.send_replace(false);
    }

    /// Resolve once `count` submissions are blocked by
    /// [`MockChainConnector::hold_submissions`].
    pub async fn wait_for_held_submissions(&self, count: usize) {
        let mut pending = self.pending_submits.subscribe();
        let _ = pending.wait_for(|n| *n >= count).await;
    }

    pub fn submitted(&self) -> Vec<SubmittedTx> {
        self.lock().submitted.clone()
    }

    pub fn allowance(&self, chain: impl Into<ChainId>, token: &str) -> Amount {
        self.lock()
            .allowances
            .get(&(chain.into(), TokenSymbol::from(token)))
            .cloned()
            .unwrap_or_else(Amount::zero)
    }

    pub fn confirmation_requests(&self) -> Vec<(ChainId, TxHash)> {
        self.lock().confirmation_requests.clone()
    }

    fn next_hash(state: &mut MockState) -> TxHash {
        let hash = TxHash::new(format!("0x{:064x}", state.next_tx));
        state.next_tx += 1;
        hash
    }
}

#[async_trait]
impl ChainConnector for MockChainConnector {
    async fn get_balance(
        &self,
        chain_id: ChainId,
        token: &TokenSymbol,
        _owner: &Address,
    ) -> Result<Amount, ConnectorError> {
        let hangs = self.lock().hanging_chains.contains(&chain_id);
        if hangs {
            std::future::pending::<()>().await;
        }

        let state = self.lock();
        if let Some(err) = state.failing_chains.get(&chain_id) {
            return Err(err.clone());
        }
        Ok(state
            .balances
            .get(&(chain_id, token.clone()))
            .cloned()
            .unwrap_or_else(Amount::zero))
    }

    async fn get_token_price(&self, token: &TokenSymbol) -> Result<Decimal, ConnectorError> {
        let state = self.lock();
        if let Some(err) = &state.price_failure {
            return Err(err.clone());
        }
        Ok(state.prices.get(token).copied().unwrap_or(Decimal::ONE))
    }

    async fn get_allowance(
        &self,
        chain_id: ChainId,
        token: &TokenSymbol,
        _owner: &Address,
        _spender: &Address,
    ) -> Result<Amount, ConnectorError> {
        Ok(self
            .lock()
            .allowances
            .get(&(chain_id, token.clone()))
            .cloned()
            .unwrap_or_else(Amount::zero))
    }

    async fn get_network_conditions(
        &self,
        from: ChainId,
        to: ChainId,
        token: &TokenSymbol,
    ) -> Result<NetworkConditions, ConnectorError> {
        let hangs = self.lock().hanging_conditions;
        if hangs {
            std::future::pending::<()>().await;
        }

        let state = self.lock();
        if state.blocked_routes.contains(&(from, to)) {
            return Err(ConnectorError::RouteUnavailable {
                from,
                to,
                token: token.clone(),
            });
        }
        Ok(state.conditions.clone())
    }

    async fn submit_transaction(
        &self,
        chain_id: ChainId,
        payload: TransactionPayload,
    ) -> Result<TxHash, ConnectorError> {
        let held = *self.hold_submits.borrow();
        if held {
            self.pending_submits.send_modify(|n| *n += 1);
            let mut hold = self.hold_submits.subscribe();
            let _ = hold.wait_for(|held| !*held).await;
            self.pending_submits.send_modify(|n| *n -= 1);
        }

        let mut state = self.lock();
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }

        if let TransactionPayload::Approve { token, amount, .. } = &payload {
            state
                .allowances
                .insert((chain_id, token.clone()), amount.clone());
        }

        let tx_hash = Self::next_hash(&mut state);
        debug!(chain = %chain_id, tx = %tx_hash, "mock transaction accepted");
        state.submitted.push(SubmittedTx {
            chain_id,
            payload,
            tx_hash: tx_hash.clone(),
        });
        Ok(tx_hash)
    }

    async fn wait_for_confirmation(
        &self,
        chain_id: ChainId,
        tx_hash: &TxHash,
        timeout: Duration,
    ) -> Result<Receipt, ConnectorError> {
        self.lock()
            .confirmation_requests
            .push((chain_id, tx_hash.clone()));

        let mut hold = self.hold.subscribe();
        let _ = hold.wait_for(|held| !*held).await;

        let mut state = self.lock();
        if let Some(remaining) = state.confirmation_timeouts.get_mut(&chain_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ConnectorError::Timeout {
                    operation: format!("confirmation of {tx_hash}"),
                    timeout,
                });
            }
        }

        let submitted_here = state
            .submitted
            .iter()
            .any(|tx| tx.chain_id == chain_id && &tx.tx_hash == tx_hash);
        // Anything not submitted on this chain is a destination settlement.
        let receipt_hash = if submitted_here {
            tx_hash.clone()
        } else {
            Self::next_hash(&mut state)
        };
        state.next_block += 1;

        Ok(Receipt {
            tx_hash: receipt_hash,
            chain_id,
            block_number: state.next_block,
            success: !state.reverting_chains.contains(&chain_id),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SIGNER
// ═══════════════════════════════════════════════════════════════════════════════

/// One scripted answer.
#[derive(Clone, Debug)]
pub enum SignerStep {
    Approve,
    Reject(Option<String>),
    Fail(String),
    /// Never answer.
    Hang,
}

/// [`Signer`] that answers from a script, then falls back to a default.
pub struct ScriptedSigner {
    script: Mutex<VecDeque<SignerStep>>,
    fallback: SignerStep,
    requests: Mutex<Vec<ApprovalRequest>>,
    seen: watch::Sender<usize>,
}

impl ScriptedSigner {
    pub fn new(script: Vec<SignerStep>, fallback: SignerStep) -> Self {
        let (seen, _) = watch::channel(0);
        Self {
            script: Mutex::new(script.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            seen,
        }
    }

    pub fn approving() -> Self {
        Self::new(Vec::new(), SignerStep::Approve)
    }

    pub fn rejecting() -> Self {
        Self::new(Vec::new(), SignerStep::Reject(Some("user declined".into())))
    }

    pub fn hanging() -> Self {
        Self::new(Vec::new(), SignerStep::Hang)
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests.lock().expect("signer poisoned").clone()
    }

    /// Resolve once at least `count` approval requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        let mut seen = self.seen.subscribe();
        let _ = seen.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl Signer for ScriptedSigner {
    async fn request_approval(
        &self,
        request: &ApprovalRequest,
    ) -> Result<ApprovalDecision, SignerError> {
        let step = {
            let mut requests = self.requests.lock().expect("signer poisoned");
            requests.push(request.clone());
            self.seen.send_replace(requests.len());
            self.script
                .lock()
                .expect("signer poisoned")
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        };

        match step {
            SignerStep::Approve => Ok(ApprovalDecision::Approved),
            SignerStep::Reject(reason) => Ok(ApprovalDecision::Rejected { reason }),
            SignerStep::Fail(message) => Err(SignerError::Unavailable(message)),
            SignerStep::Hang => std::future::pending().await,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Records every event delivered to a wildcard subscription.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<AvailEvent>>>,
    _subscription: Subscription,
}

impl EventRecorder {
    pub fn attach(orchestrator: &NexusOrchestrator) -> Self {
        Self::on_bus(orchestrator.events(), EventFilter::Any)
    }

    pub fn on_bus(bus: &EventBus, filter: EventFilter) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let subscription = bus.subscribe(filter, move |event| {
            sink.lock().expect("recorder poisoned").push(event.clone());
            Ok(())
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<AvailEvent> {
        self.events.lock().expect("recorder poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(AvailEvent::kind).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WIRING
// ═══════════════════════════════════════════════════════════════════════════════

/// Orchestrator plus handles on its doubles.
pub struct Harness {
    pub orchestrator: NexusOrchestrator,
    pub connector: Arc<MockChainConnector>,
    pub signer: Arc<ScriptedSigner>,
}

impl Harness {
    pub fn new(
        config: OrchestratorConfig,
        connector: MockChainConnector,
        signer: ScriptedSigner,
    ) -> Self {
        let connector = Arc::new(connector);
        let signer = Arc::new(signer);
        let orchestrator = NexusOrchestrator::new(config, connector.clone(), signer.clone())
            .expect("valid test configuration");
        Self {
            orchestrator,
            connector,
            signer,
        }
    }
}
