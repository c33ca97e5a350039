//! Progress steps reported while an operation runs.

use serde::{Deserialize, Serialize};

use crate::types::{Amount, BridgeEstimate, ChainId, TxHash};

/// Lifecycle of a single step instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

/// Step type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    Estimating,
    AllowanceApproval,
    AllowanceConfirmation,
    IntentApproval,
    IntentSubmitted,
    SourceConfirmed,
    DestinationSettled,
}

/// Steps announced by `BRIDGE_EXECUTE_EXPECTED_STEPS`, in execution order.
pub const EXECUTION_STEPS: [StepKind; 3] = [
    StepKind::IntentSubmitted,
    StepKind::SourceConfirmed,
    StepKind::DestinationSettled,
];

/// Step payload, keyed on the step type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typeID", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepData {
    Estimating,
    AllowanceApproval {
        chain_id: ChainId,
        current: Amount,
        required: Amount,
    },
    AllowanceConfirmation {
        chain_id: ChainId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_hash: Option<TxHash>,
    },
    IntentApproval {
        estimate: Box<BridgeEstimate>,
    },
    IntentSubmitted {
        chain_id: ChainId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_hash: Option<TxHash>,
    },
    SourceConfirmed {
        chain_id: ChainId,
        tx_hash: TxHash,
    },
    DestinationSettled {
        chain_id: ChainId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_hash: Option<TxHash>,
    },
}

impl StepData {
    pub fn kind(&self) -> StepKind {
        match self {
            StepData::Estimating => StepKind::Estimating,
            StepData::AllowanceApproval { .. } => StepKind::AllowanceApproval,
            StepData::AllowanceConfirmation { .. } => StepKind::AllowanceConfirmation,
            StepData::IntentApproval { .. } => StepKind::IntentApproval,
            StepData::IntentSubmitted { .. } => StepKind::IntentSubmitted,
            StepData::SourceConfirmed { .. } => StepKind::SourceConfirmed,
            StepData::DestinationSettled { .. } => StepKind::DestinationSettled,
        }
    }
}

/// One step instance.
///
/// Instances are never mutated: completing, failing or retrying a step
/// yields a new instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStep {
    #[serde(flatten)]
    data: StepData,
    status: StepStatus,
    /// Zero for the first try; incremented by [`ProgressStep::retried`].
    attempt: u32,
}

impl ProgressStep {
    pub fn pending(data: StepData) -> Self {
        Self {
            data,
            status: StepStatus::Pending,
            attempt: 0,
        }
    }

    pub fn type_id(&self) -> StepKind {
        self.data.kind()
    }

    pub fn data(&self) -> &StepData {
        &self.data
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    pub fn completed(&self) -> Self {
        Self {
            status: StepStatus::Completed,
            ..self.clone()
        }
    }

    /// Complete the step, replacing its payload with the final one
    /// (typically to attach a transaction hash).
    pub fn completed_with(&self, data: StepData) -> Self {
        debug_assert_eq!(data.kind(), self.type_id());
        Self {
            data,
            status: StepStatus::Completed,
            attempt: self.attempt,
        }
    }

    pub fn failed(&self) -> Self {
        Self {
            status: StepStatus::Failed,
            ..self.clone()
        }
    }

    /// Fresh pending instance for the next attempt.
    pub fn retried(&self) -> Self {
        Self {
            data: self.data.clone(),
            status: StepStatus::Pending,
            attempt: self.attempt + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_produce_new_instances() {
        let pending = ProgressStep::pending(StepData::IntentSubmitted {
            chain_id: ChainId::ETHEREUM,
            tx_hash: None,
        });
        let done = pending.completed_with(StepData::IntentSubmitted {
            chain_id: ChainId::ETHEREUM,
            tx_hash: Some(TxHash::new("0x01")),
        });

        assert!(pending.is_pending());
        assert_eq!(done.status(), StepStatus::Completed);
        assert_eq!(done.type_id(), StepKind::IntentSubmitted);

        let failed = pending.failed();
        assert_eq!(failed.status(), StepStatus::Failed);
        assert_eq!(pending.status(), StepStatus::Pending);
    }

    #[test]
    fn retry_increments_attempt() {
        let step = ProgressStep::pending(StepData::Estimating);
        let again = step.failed().retried();
        assert!(again.is_pending());
        assert_eq!(again.attempt(), 1);
        assert_eq!(again.retried().attempt(), 2);
    }

    #[test]
    fn step_serializes_with_type_tag() {
        let step = ProgressStep::pending(StepData::SourceConfirmed {
            chain_id: ChainId::OPTIMISM,
            tx_hash: TxHash::new("0xabc"),
        });
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["typeID"], "SOURCE_CONFIRMED");
        assert_eq!(json["data"]["chain_id"], 10);
        assert_eq!(json["status"], "pending");
        assert_eq!(json["attempt"], 0);
    }
}
