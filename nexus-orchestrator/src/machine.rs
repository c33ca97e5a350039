//! Drives one bridge operation through its lifecycle.
//!
//! ```text
//! Idle → Estimating → [AwaitingAllowanceApproval] → AwaitingIntentApproval
//!      → Executing → Confirming → Completed
//!                  (any) → Failed
//! ```
//!
//! The machine is the only writer of its [`PaymentState`]. Every transition
//! updates the state first and publishes the matching event second, so a
//! subscriber that reads the state from a handler sees the new phase.

use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cancel::CancelGate;
use crate::config::OrchestratorConfig;
use crate::connector::{
    ApprovalDecision, ApprovalRequest, ApprovalSummary, ChainConnector, ConnectorError, Receipt,
    Signer, TransactionPayload,
};
use crate::error::{AvailError, ErrorClassifier, RawFailure};
use crate::estimator::BridgeEstimator;
use crate::events::{AvailEvent, EventBus, EventData};
use crate::retry::{retry_on_timeout, RetryPolicy};
use crate::state::{progress_for, PaymentPhase, PaymentState, StateWriter};
use crate::steps::{ProgressStep, StepData, EXECUTION_STEPS};
use crate::types::{Amount, BridgeEstimate, BridgeOperation, ChainId, OperationId, TxHash};

/// Collaborators shared by every machine an orchestrator spawns.
#[derive(Clone)]
pub(crate) struct MachineContext {
    pub(crate) connector: Arc<dyn ChainConnector>,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) estimator: Arc<BridgeEstimator>,
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) events: EventBus,
    pub(crate) retry: RetryPolicy,
}

pub(crate) struct PaymentMachine {
    id: OperationId,
    operation: BridgeOperation,
    ctx: MachineContext,
    state: StateWriter,
    gate: Arc<CancelGate>,
}

impl PaymentMachine {
    pub(crate) fn new(
        id: OperationId,
        operation: BridgeOperation,
        ctx: MachineContext,
        state: StateWriter,
        gate: Arc<CancelGate>,
    ) -> Self {
        Self {
            id,
            operation,
            ctx,
            state,
            gate,
        }
    }

    /// Run to a terminal state and return the frozen snapshot.
    pub(crate) async fn run(self) -> PaymentState {
        match self.drive().await {
            Ok(state) => state,
            Err(err) => self.fail(err),
        }
    }

    async fn drive(&self) -> Result<PaymentState, AvailError> {
        self.state
            .begin(ProgressStep::pending(StepData::Estimating))?;
        info!(
            operation = %self.id,
            token = %self.operation.token,
            amount = %self.operation.amount,
            destination = %self.operation.chain_id,
            "operation started"
        );
        self.checkpoint()?;

        let estimate = self
            .cancellable(retry_on_timeout(self.ctx.retry, "estimate", |attempt| async move {
                self.note_attempt(attempt)?;
                self.ctx.estimator.estimate(&self.operation).await
            }))
            .await?;

        if self.ctx.config.requires_allowance(&self.operation.token) {
            let current = self.read_allowance(estimate.source_chain).await?;
            if current < estimate.required_allowance {
                self.approve_allowance(&estimate, current).await?;
            } else {
                info!(
                    operation = %self.id,
                    allowance = %current,
                    "allowance sufficient, skipping approval"
                );
            }
        }

        self.approve_intent(&estimate).await?;

        if self.gate.seal() {
            return Err(self.cancelled());
        }
        self.execute(&estimate).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // APPROVALS
    // ═══════════════════════════════════════════════════════════════════════════

    async fn read_allowance(&self, source: ChainId) -> Result<Amount, AvailError> {
        let config = &self.ctx.config;
        self.cancellable(retry_on_timeout(self.ctx.retry, "allowance", |attempt| async move {
            self.note_attempt(attempt)?;
            self.ctx
                .connector
                .get_allowance(
                    source,
                    &self.operation.token,
                    &config.owner_address,
                    &config.bridge_contract,
                )
                .await
                .map_err(classify)
        }))
        .await
    }

    async fn approve_allowance(
        &self,
        estimate: &BridgeEstimate,
        current: Amount,
    ) -> Result<(), AvailError> {
        let source = estimate.source_chain;
        let spender = self.ctx.config.bridge_contract.clone();
        let required = estimate.required_allowance.clone();

        self.advance(
            PaymentPhase::AwaitingAllowanceApproval,
            ProgressStep::pending(StepData::AllowanceApproval {
                chain_id: source,
                current: current.clone(),
                required: required.clone(),
            }),
        )?;
        self.gate.open();
        self.publish(EventData::AllowanceApprovalRequired {
            chain_id: source,
            token: self.operation.token.clone(),
            spender: spender.clone(),
            current: current.clone(),
            required: required.clone(),
        });

        self.await_approval(ApprovalSummary::Allowance {
            chain_id: source,
            token: self.operation.token.clone(),
            spender: spender.clone(),
            current,
            required: required.clone(),
        })
        .await?;

        self.advance(
            PaymentPhase::AwaitingAllowanceApproval,
            ProgressStep::pending(StepData::AllowanceConfirmation {
                chain_id: source,
                tx_hash: None,
            }),
        )?;
        self.checkpoint()?;

        let payload = TransactionPayload::Approve {
            token: self.operation.token.clone(),
            owner: self.ctx.config.owner_address.clone(),
            spender,
            amount: required,
        };
        // Re-approving the same amount is harmless, so timeouts are retried.
        let tx_hash = self
            .cancellable(self.submit(source, &payload, self.ctx.retry, "allowance submit"))
            .await?;
        self.advance(
            PaymentPhase::AwaitingAllowanceApproval,
            ProgressStep::pending(StepData::AllowanceConfirmation {
                chain_id: source,
                tx_hash: Some(tx_hash.clone()),
            }),
        )?;
        self.cancellable(self.confirm(source, &tx_hash)).await?;
        info!(operation = %self.id, chain = %source, tx = %tx_hash, "allowance confirmed");
        Ok(())
    }

    async fn approve_intent(&self, estimate: &BridgeEstimate) -> Result<(), AvailError> {
        self.advance(
            PaymentPhase::AwaitingIntentApproval,
            ProgressStep::pending(StepData::IntentApproval {
                estimate: Box::new(estimate.clone()),
            }),
        )?;
        self.gate.open();
        self.publish(EventData::IntentApprovalRequired {
            operation: self.operation.clone(),
            estimate: estimate.clone(),
        });

        self.await_approval(ApprovalSummary::Intent {
            operation: self.operation.clone(),
            estimate: estimate.clone(),
        })
        .await
    }

    async fn await_approval(&self, summary: ApprovalSummary) -> Result<(), AvailError> {
        let phase = self.state.phase();
        let timeout = self.ctx.config.approval_timeout();
        let request = ApprovalRequest {
            operation_id: self.id.clone(),
            summary,
        };

        let failure = tokio::select! {
            biased;
            _ = self.gate.cancelled() => RawFailure::Cancelled { phase },
            outcome = tokio::time::timeout(timeout, self.ctx.signer.request_approval(&request)) => {
                match outcome {
                    Ok(Ok(ApprovalDecision::Approved)) => {
                        info!(operation = %self.id, phase = %phase, "approval granted");
                        return Ok(());
                    }
                    Ok(Ok(ApprovalDecision::Rejected { reason })) => {
                        RawFailure::ApprovalRejected { phase, reason }
                    }
                    Ok(Err(err)) => RawFailure::Signer(err),
                    Err(_) => RawFailure::ApprovalTimeout { phase, timeout },
                }
            }
        };
        Err(ErrorClassifier::classify(&failure))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EXECUTION
    // ═══════════════════════════════════════════════════════════════════════════

    async fn execute(&self, estimate: &BridgeEstimate) -> Result<PaymentState, AvailError> {
        let source = estimate.source_chain;
        let destination = self.operation.chain_id;
        let expected = EXECUTION_STEPS.len();

        self.advance(
            PaymentPhase::Executing,
            ProgressStep::pending(StepData::IntentSubmitted {
                chain_id: source,
                tx_hash: None,
            }),
        )?;
        self.publish(EventData::BridgeExecuteExpectedSteps {
            steps: EXECUTION_STEPS.to_vec(),
        });

        let payload = TransactionPayload::BridgeDeposit {
            token: self.operation.token.clone(),
            amount: self.operation.amount.clone(),
            destination_chain: destination,
            recipient: self
                .operation
                .recipient_address
                .clone()
                .unwrap_or_else(|| self.ctx.config.owner_address.clone()),
        };
        // A deposit whose response timed out may still have been broadcast;
        // resubmitting it could bridge the funds twice.
        let source_hash = self
            .submit(source, &payload, RetryPolicy::none(), "bridge deposit")
            .await?;
        self.state.set_source_hash(source_hash.clone())?;

        let submitted = self.current_step()?.completed_with(StepData::IntentSubmitted {
            chain_id: source,
            tx_hash: Some(source_hash.clone()),
        });
        self.record_step(
            PaymentPhase::Confirming,
            submitted,
            1,
            ProgressStep::pending(StepData::SourceConfirmed {
                chain_id: source,
                tx_hash: source_hash.clone(),
            }),
        )?;

        self.confirm(source, &source_hash).await?;
        let confirmed = self.current_step()?.completed();
        self.record_step(
            PaymentPhase::Confirming,
            confirmed,
            2,
            ProgressStep::pending(StepData::DestinationSettled {
                chain_id: destination,
                tx_hash: None,
            }),
        )?;

        let settlement = self.confirm(destination, &source_hash).await?;
        let settled = self.current_step()?.completed_with(StepData::DestinationSettled {
            chain_id: destination,
            tx_hash: Some(settlement.tx_hash.clone()),
        });
        let state = self
            .state
            .complete(settled.clone(), settlement.tx_hash.clone())?;
        info!(
            operation = %self.id,
            source_tx = %source_hash,
            settlement_tx = %settlement.tx_hash,
            "operation completed"
        );

        self.publish(EventData::BridgeExecuteCompletedSteps {
            step: settled,
            completed: expected,
            expected,
            progress: 100,
        });
        self.publish(EventData::BridgeExecuteCompleted {
            source_transaction_hash: source_hash,
            transaction_hash: settlement.tx_hash,
        });
        Ok(state)
    }

    /// Record `done` as the `completed`-th execution step and make `next`
    /// the pending one, then announce it.
    fn record_step(
        &self,
        phase: PaymentPhase,
        done: ProgressStep,
        completed: usize,
        next: ProgressStep,
    ) -> Result<(), AvailError> {
        let expected = EXECUTION_STEPS.len();
        let progress = progress_for(completed, expected);
        self.state.advance_with_progress(phase, next, progress)?;
        info!(
            operation = %self.id,
            step = ?done.type_id(),
            progress,
            "step completed"
        );
        self.publish(EventData::BridgeExecuteCompletedSteps {
            step: done,
            completed,
            expected,
            progress,
        });
        Ok(())
    }

    /// Broadcast `payload`. Each attempt holds the cancellation window shut
    /// while the connector call is in flight.
    async fn submit(
        &self,
        chain: ChainId,
        payload: &TransactionPayload,
        retry: RetryPolicy,
        label: &str,
    ) -> Result<TxHash, AvailError> {
        let tx_hash = retry_on_timeout(retry, label, |attempt| async move {
            self.note_attempt(attempt)?;
            let _held = self.gate.hold().ok_or_else(|| self.cancelled())?;
            self.ctx
                .connector
                .submit_transaction(chain, payload.clone())
                .await
                .map_err(classify)
        })
        .await?;
        info!(operation = %self.id, chain = %chain, tx = %tx_hash, "{label} accepted");
        Ok(tx_hash)
    }

    /// Wait for `tx_hash` on `chain`, bounded by the confirmation timeout.
    async fn confirm(&self, chain: ChainId, tx_hash: &TxHash) -> Result<Receipt, AvailError> {
        let timeout = self.ctx.config.confirmation_timeout();
        retry_on_timeout(self.ctx.retry, "confirmation", |attempt| async move {
            self.note_attempt(attempt)?;
            let wait = self
                .ctx
                .connector
                .wait_for_confirmation(chain, tx_hash, timeout);
            let receipt = match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result.map_err(classify)?,
                Err(_) => {
                    return Err(ErrorClassifier::classify(&RawFailure::ConfirmationTimeout {
                        chain_id: chain,
                        timeout,
                    }))
                }
            };
            if !receipt.success {
                return Err(classify(ConnectorError::Reverted(format!(
                    "{} on chain {chain}",
                    receipt.tx_hash
                ))));
            }
            Ok(receipt)
        })
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════════════════

    fn advance(&self, phase: PaymentPhase, step: ProgressStep) -> Result<(), AvailError> {
        let from = self.state.phase();
        self.state.advance(phase, step)?;
        if from != phase {
            info!(operation = %self.id, from = %from, to = %phase, "phase transition");
        }
        Ok(())
    }

    fn current_step(&self) -> Result<ProgressStep, AvailError> {
        self.state
            .snapshot()
            .current_step
            .ok_or_else(|| AvailError::internal("no current step"))
    }

    /// A retry replaces the pending step with a fresh instance.
    fn note_attempt(&self, attempt: u32) -> Result<(), AvailError> {
        if attempt == 0 {
            return Ok(());
        }
        let retried = self.current_step()?.retried();
        self.state.advance(self.state.phase(), retried)?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), AvailError> {
        if self.gate.is_requested() {
            return Err(self.cancelled());
        }
        Ok(())
    }

    fn cancelled(&self) -> AvailError {
        ErrorClassifier::classify(&RawFailure::Cancelled {
            phase: self.state.phase(),
        })
    }

    /// Race `fut` against cancellation.
    async fn cancellable<T>(
        &self,
        fut: impl Future<Output = Result<T, AvailError>>,
    ) -> Result<T, AvailError> {
        tokio::select! {
            biased;
            _ = self.gate.cancelled() => Err(self.cancelled()),
            result = fut => result,
        }
    }

    fn publish(&self, data: EventData) {
        self.ctx
            .events
            .publish(AvailEvent::for_operation(self.id.clone(), data));
    }

    fn fail(&self, error: AvailError) -> PaymentState {
        let step = self
            .state
            .snapshot()
            .current_step
            .map(|step| step.type_id());

        match self.state.fail(&error) {
            Ok(state) => {
                warn!(
                    operation = %self.id,
                    code = %error.code,
                    error = %error.message,
                    "operation failed"
                );
                self.publish(EventData::BridgeExecuteFailed { error, step });
                state
            }
            Err(internal) => {
                error!(operation = %self.id, error = %internal, "could not record failure");
                self.state.snapshot()
            }
        }
    }
}

fn classify(err: ConnectorError) -> AvailError {
    ErrorClassifier::classify(&RawFailure::Connector(err))
}
