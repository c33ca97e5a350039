//! nexus-orchestrator
//!
//! Cross-chain bridge payment orchestration.
//!
//! # Overview
//!
//! The orchestrator drives a bridge payment (allowance, intent approval,
//! source deposit, destination settlement) through an explicit state
//! machine, reports progress as typed events, aggregates token balances
//! across chains and classifies failures into a stable error taxonomy.
//!
//! It holds no keys and speaks no RPC. The host provides a
//! [`ChainConnector`] for chain access and a [`Signer`] for user approval.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        NexusOrchestrator                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  submit ──► run loop ──► PaymentMachine ──► PaymentState (watch) │
//! │                              │    │                              │
//! │                 ┌────────────┘    └────────────┐                 │
//! │                 ▼                              ▼                 │
//! │        ┌─────────────────┐            ┌─────────────────┐        │
//! │        │ BridgeEstimator │            │    EventBus     │◄─ on() │
//! │        └────────┬────────┘            └────────▲────────┘        │
//! │                 │                              │                 │
//! │                 │        ┌───────────────────┐ │                 │
//! │                 │        │ BalanceAggregator ├─┘                 │
//! │                 │        └─────────┬─────────┘                   │
//! │                 ▼                  ▼                             │
//! │        ┌──────────────────────────────────────┐  ┌────────────┐  │
//! │        │        ChainConnector (host)         │  │Signer(host)│  │
//! │        └──────────────────────────────────────┘  └────────────┘  │
//! │                                                                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use nexus_orchestrator::*;
//! # async fn run(connector: Arc<dyn ChainConnector>, signer: Arc<dyn Signer>) -> Result<(), AvailError> {
//! let orchestrator =
//!     NexusOrchestrator::new(OrchestratorConfig::new("0xowner"), connector, signer)?;
//!
//! let _progress = orchestrator.on(EventKind::BridgeExecuteCompletedSteps, |event| {
//!     println!("{}", serde_json::to_string(event)?);
//!     Ok(())
//! });
//!
//! let handle = orchestrator
//!     .submit(BridgeOperation::new("USDC", "100", 137u64)?)
//!     .await?;
//! let state = orchestrator.wait_for_completion(&handle).await?;
//! println!("settled in {:?}", state.transaction_hash);
//!
//! orchestrator.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod balance;
mod cancel;
pub mod config;
pub mod connector;
pub mod error;
pub mod estimator;
pub mod events;
mod machine;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod steps;
pub mod types;

pub use balance::BalanceAggregator;
pub use config::{ConcurrentOperationPolicy, ConfigError, NetworkEnvironment, OrchestratorConfig};
pub use connector::{
    ApprovalDecision, ApprovalRequest, ApprovalSummary, ChainConnector, ConnectorError,
    NetworkConditions, Receipt, Signer, SignerError, TransactionPayload,
};
pub use error::{AvailError, ErrorClassifier, ErrorCode, RawFailure};
pub use estimator::{compute_estimate, BridgeEstimator};
pub use events::{AvailEvent, EventBus, EventData, EventFilter, EventKind, Subscription};
pub use orchestrator::{NexusOrchestrator, OperationHandle};
pub use retry::RetryPolicy;
pub use state::{progress_for, PaymentPhase, PaymentState};
pub use steps::{ProgressStep, StepData, StepKind, StepStatus, EXECUTION_STEPS};
pub use types::*;
