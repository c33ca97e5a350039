//! Payment lifecycle state and its single writer.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{AvailError, ErrorCode};
use crate::steps::ProgressStep;
use crate::types::{OperationId, TxHash};

/// Lifecycle phase of one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPhase {
    Idle,
    Estimating,
    AwaitingAllowanceApproval,
    AwaitingIntentApproval,
    Executing,
    Confirming,
    Completed,
    Failed,
}

impl PaymentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentPhase::Idle => "idle",
            PaymentPhase::Estimating => "estimating",
            PaymentPhase::AwaitingAllowanceApproval => "awaiting_allowance_approval",
            PaymentPhase::AwaitingIntentApproval => "awaiting_intent_approval",
            PaymentPhase::Executing => "executing",
            PaymentPhase::Confirming => "confirming",
            PaymentPhase::Completed => "completed",
            PaymentPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentPhase::Completed | PaymentPhase::Failed)
    }

    /// Phases in which the caller may still cancel.
    pub fn accepts_cancellation(&self) -> bool {
        matches!(
            self,
            PaymentPhase::AwaitingAllowanceApproval | PaymentPhase::AwaitingIntentApproval
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Staying in the same non-terminal phase is allowed so a phase can
    /// move through several steps.
    pub fn can_transition_to(&self, next: PaymentPhase) -> bool {
        use PaymentPhase::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed || next == *self {
            return *self != Idle || next == Failed;
        }
        matches!(
            (self, next),
            (Idle, Estimating)
                | (Estimating, AwaitingAllowanceApproval)
                | (Estimating, AwaitingIntentApproval)
                | (AwaitingAllowanceApproval, AwaitingIntentApproval)
                | (AwaitingIntentApproval, Executing)
                | (Executing, Confirming)
                | (Confirming, Completed)
        )
    }
}

impl fmt::Display for PaymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one operation's progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentState {
    pub operation_id: OperationId,
    pub phase: PaymentPhase,
    pub is_processing: bool,
    pub current_step: Option<ProgressStep>,
    /// Percentage of execution steps completed, 0 to 100.
    pub progress: u8,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// Source-chain deposit hash, once broadcast.
    pub source_transaction_hash: Option<TxHash>,
    /// Destination settlement hash; only set on completion.
    pub transaction_hash: Option<TxHash>,
}

impl PaymentState {
    pub fn idle(operation_id: OperationId) -> Self {
        Self {
            operation_id,
            phase: PaymentPhase::Idle,
            is_processing: false,
            current_step: None,
            progress: 0,
            error: None,
            error_code: None,
            source_transaction_hash: None,
            transaction_hash: None,
        }
    }

    /// Terminal snapshots never change again.
    pub fn is_frozen(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// `completed / expected` as a floored percentage.
pub fn progress_for(completed: usize, expected: usize) -> u8 {
    if expected == 0 {
        return 0;
    }
    let completed = completed.min(expected);
    ((completed * 100) / expected) as u8
}

/// Sole writer of an operation's [`PaymentState`].
///
/// Each method applies one atomic update; readers observe whole snapshots
/// through the paired `watch::Receiver`.
pub(crate) struct StateWriter {
    tx: watch::Sender<PaymentState>,
}

impl StateWriter {
    pub(crate) fn new(operation_id: OperationId) -> (Self, watch::Receiver<PaymentState>) {
        let (tx, rx) = watch::channel(PaymentState::idle(operation_id));
        (Self { tx }, rx)
    }

    pub(crate) fn snapshot(&self) -> PaymentState {
        self.tx.borrow().clone()
    }

    pub(crate) fn phase(&self) -> PaymentPhase {
        self.tx.borrow().phase
    }

    fn apply<F>(&self, update: F) -> Result<PaymentState, AvailError>
    where
        F: FnOnce(&mut PaymentState) -> Result<(), AvailError>,
    {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|state| {
            if state.is_frozen() {
                outcome = Err(AvailError::internal(format!(
                    "state of {} is frozen in phase {}",
                    state.operation_id, state.phase
                )));
                return false;
            }
            let mut next = state.clone();
            match update(&mut next) {
                Ok(()) => {
                    *state = next;
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });
        outcome.map(|()| self.snapshot())
    }

    /// `Idle -> Estimating`. Starts the processing interval at progress 0.
    pub(crate) fn begin(&self, step: ProgressStep) -> Result<PaymentState, AvailError> {
        self.apply(|state| {
            move_phase(state, PaymentPhase::Estimating)?;
            state.is_processing = true;
            state.progress = 0;
            state.current_step = Some(pending(step)?);
            Ok(())
        })
    }

    /// Move to `phase` (possibly the current one) with a new pending step.
    pub(crate) fn advance(
        &self,
        phase: PaymentPhase,
        step: ProgressStep,
    ) -> Result<PaymentState, AvailError> {
        self.apply(|state| {
            move_phase(state, phase)?;
            state.current_step = Some(pending(step)?);
            Ok(())
        })
    }

    /// Like [`StateWriter::advance`], also raising progress. Progress never
    /// decreases and stays below 100 until completion.
    pub(crate) fn advance_with_progress(
        &self,
        phase: PaymentPhase,
        step: ProgressStep,
        progress: u8,
    ) -> Result<PaymentState, AvailError> {
        self.apply(|state| {
            move_phase(state, phase)?;
            state.current_step = Some(pending(step)?);
            state.progress = state.progress.max(progress.min(99));
            Ok(())
        })
    }

    pub(crate) fn set_source_hash(&self, hash: TxHash) -> Result<PaymentState, AvailError> {
        self.apply(|state| {
            state.source_transaction_hash = Some(hash);
            Ok(())
        })
    }

    /// `Confirming -> Completed`; freezes the state.
    pub(crate) fn complete(
        &self,
        step: ProgressStep,
        transaction_hash: TxHash,
    ) -> Result<PaymentState, AvailError> {
        self.apply(|state| {
            move_phase(state, PaymentPhase::Completed)?;
            state.is_processing = false;
            state.progress = 100;
            state.current_step = Some(step);
            state.transaction_hash = Some(transaction_hash);
            Ok(())
        })
    }

    /// Any phase `-> Failed`; marks the current step failed and records the
    /// error in the same update. Freezes the state.
    pub(crate) fn fail(&self, error: &AvailError) -> Result<PaymentState, AvailError> {
        self.apply(|state| {
            move_phase(state, PaymentPhase::Failed)?;
            state.is_processing = false;
            state.current_step = state.current_step.as_ref().map(ProgressStep::failed);
            state.error = Some(error.message.clone());
            state.error_code = Some(error.code);
            Ok(())
        })
    }
}

fn move_phase(state: &mut PaymentState, next: PaymentPhase) -> Result<(), AvailError> {
    if !state.phase.can_transition_to(next) {
        return Err(AvailError::internal(format!(
            "illegal transition {} -> {next} for {}",
            state.phase, state.operation_id
        )));
    }
    state.phase = next;
    Ok(())
}

fn pending(step: ProgressStep) -> Result<ProgressStep, AvailError> {
    if !step.is_pending() {
        return Err(AvailError::internal(format!(
            "current step {:?} must be pending while processing",
            step.type_id()
        )));
    }
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{StepData, StepStatus};
    use crate::types::{BridgeOperation, ChainId};

    fn writer() -> (StateWriter, watch::Receiver<PaymentState>) {
        let op = BridgeOperation::new("USDC", "1", 10u64).unwrap();
        StateWriter::new(OperationId::derive(0, &op))
    }

    #[test]
    fn progress_is_floored() {
        assert_eq!(progress_for(0, 3), 0);
        assert_eq!(progress_for(1, 3), 33);
        assert_eq!(progress_for(2, 3), 66);
        assert_eq!(progress_for(3, 3), 100);
        assert_eq!(progress_for(5, 3), 100);
        assert_eq!(progress_for(1, 0), 0);
    }

    #[test]
    fn lifecycle_graph() {
        use PaymentPhase::*;
        assert!(Idle.can_transition_to(Estimating));
        assert!(Idle.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Idle));
        assert!(Estimating.can_transition_to(AwaitingIntentApproval));
        assert!(AwaitingAllowanceApproval.can_transition_to(AwaitingAllowanceApproval));
        assert!(!Executing.can_transition_to(AwaitingIntentApproval));
        assert!(!Estimating.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Estimating));
    }

    #[test]
    fn fail_is_atomic_and_freezes() {
        let (writer, rx) = writer();
        writer
            .begin(ProgressStep::pending(StepData::Estimating))
            .unwrap();
        assert!(rx.borrow().is_processing);

        let err = AvailError::user_rejected("declined");
        let state = writer.fail(&err).unwrap();
        assert!(!state.is_processing);
        assert_eq!(state.phase, PaymentPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("declined"));
        assert_eq!(state.error_code, Some(ErrorCode::UserRejected));
        assert_eq!(
            state.current_step.as_ref().map(|s| s.status()),
            Some(StepStatus::Failed)
        );

        assert!(writer.fail(&err).is_err());
        assert!(writer
            .advance(
                PaymentPhase::Executing,
                ProgressStep::pending(StepData::Estimating)
            )
            .is_err());
        assert_eq!(*rx.borrow(), state);
    }

    #[test]
    fn completed_steps_cannot_be_current_while_processing() {
        let (writer, _rx) = writer();
        let done = ProgressStep::pending(StepData::Estimating).completed();
        assert!(writer.begin(done).is_err());
        assert_eq!(writer.phase(), PaymentPhase::Idle);
    }

    #[test]
    fn progress_never_decreases() {
        let (writer, _rx) = writer();
        writer
            .begin(ProgressStep::pending(StepData::Estimating))
            .unwrap();
        writer
            .advance(
                PaymentPhase::AwaitingIntentApproval,
                ProgressStep::pending(StepData::Estimating),
            )
            .unwrap();
        let step = ProgressStep::pending(StepData::IntentSubmitted {
            chain_id: ChainId::ETHEREUM,
            tx_hash: None,
        });
        writer
            .advance_with_progress(PaymentPhase::Executing, step.clone(), 66)
            .unwrap();
        let state = writer
            .advance_with_progress(PaymentPhase::Confirming, step, 33)
            .unwrap();
        assert_eq!(state.progress, 66);
    }
}
