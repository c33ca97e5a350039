//! Error taxonomy and failure classification.
//!
//! Every failure the orchestrator surfaces, whether returned from a direct
//! call or recorded on a failed [`PaymentState`](crate::state::PaymentState),
//! is an [`AvailError`] carrying a stable [`ErrorCode`]. Raw failures coming
//! from the host's connector and signer are mapped onto that taxonomy by
//! [`ErrorClassifier`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connector::{ConnectorError, SignerError};
use crate::state::PaymentPhase;
use crate::types::ChainId;

/// EIP-1193 provider error code for a request the user declined.
pub const EIP1193_USER_REJECTED: i64 = 4001;

/// Stable, machine-readable error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The signer or the caller declined.
    UserRejected,
    InsufficientFunds,
    InsufficientLiquidity,
    UnsupportedRoute,
    /// A connector call exceeded its deadline. The only retryable code.
    NetworkTimeout,
    AggregationFailed,
    /// Catch-all; the raw failure is kept verbatim in `details`.
    UnknownChainError,
    OperationInFlight,
    CancellationNotAllowed,
    OperationNotFound,
    InvalidOperation,
    InvalidConfiguration,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UserRejected => "USER_REJECTED",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::InsufficientLiquidity => "INSUFFICIENT_LIQUIDITY",
            ErrorCode::UnsupportedRoute => "UNSUPPORTED_ROUTE",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::AggregationFailed => "AGGREGATION_FAILED",
            ErrorCode::UnknownChainError => "UNKNOWN_CHAIN_ERROR",
            ErrorCode::OperationInFlight => "OPERATION_IN_FLIGHT",
            ErrorCode::CancellationNotAllowed => "CANCELLATION_NOT_ALLOWED",
            ErrorCode::OperationNotFound => "OPERATION_NOT_FOUND",
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
            ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
        }
    }

    /// Whether the state machine retries a failure with this code.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::NetworkTimeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified orchestrator error.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AvailError {
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Raw detail, kept verbatim from the originating failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AvailError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn user_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UserRejected, message)
    }

    pub fn insufficient_funds(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientFunds, message)
    }

    pub fn insufficient_liquidity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InsufficientLiquidity, message)
    }

    pub fn unsupported_route(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedRoute, message)
    }

    pub fn network_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkTimeout, message)
    }

    pub fn aggregation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AggregationFailed, message)
    }

    pub fn operation_in_flight() -> Self {
        Self::new(
            ErrorCode::OperationInFlight,
            "another operation is already in flight on this orchestrator",
        )
    }

    pub fn cancellation_not_allowed(phase: PaymentPhase) -> Self {
        Self::new(
            ErrorCode::CancellationNotAllowed,
            format!("operation cannot be cancelled while {phase}"),
        )
    }

    pub fn operation_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::OperationNotFound, format!("unknown operation {id}"))
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidOperation, message)
    }

    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    /// Internal state-machine inconsistency, surfaced as an unknown error.
    pub(crate) fn internal(details: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UnknownChainError, "internal orchestrator error")
            .with_details(details.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLASSIFICATION
// ═══════════════════════════════════════════════════════════════════════════════

/// A failure observed while talking to the host, before classification.
#[derive(Debug)]
pub enum RawFailure {
    Connector(ConnectorError),
    Signer(SignerError),
    /// The signer answered with an explicit rejection.
    ApprovalRejected {
        phase: PaymentPhase,
        reason: Option<String>,
    },
    ApprovalTimeout {
        phase: PaymentPhase,
        timeout: Duration,
    },
    ConfirmationTimeout {
        chain_id: ChainId,
        timeout: Duration,
    },
    /// The caller cancelled before broadcast.
    Cancelled { phase: PaymentPhase },
}

/// Maps raw failures onto the [`ErrorCode`] taxonomy.
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn classify(failure: &RawFailure) -> AvailError {
        match failure {
            RawFailure::Connector(err) => Self::classify_connector(err),
            RawFailure::Signer(err) => match err {
                SignerError::Rejected(reason) => {
                    AvailError::user_rejected("signer rejected the request")
                        .with_details(reason.clone())
                }
                SignerError::Unavailable(reason) => {
                    AvailError::new(ErrorCode::UnknownChainError, "signer unavailable")
                        .with_details(reason.clone())
                }
            },
            RawFailure::ApprovalRejected { phase, reason } => {
                let err = AvailError::user_rejected(format!("approval rejected while {phase}"));
                match reason {
                    Some(reason) => err.with_details(reason.clone()),
                    None => err,
                }
            }
            RawFailure::ApprovalTimeout { phase, timeout } => AvailError::user_rejected(format!(
                "no approval received within {}ms while {phase}",
                timeout.as_millis()
            )),
            RawFailure::ConfirmationTimeout { chain_id, timeout } => {
                AvailError::network_timeout(format!(
                    "confirmation on chain {chain_id} not received within {}ms",
                    timeout.as_millis()
                ))
            }
            RawFailure::Cancelled { phase } => {
                AvailError::user_rejected(format!("operation cancelled by caller while {phase}"))
            }
        }
    }

    fn classify_connector(err: &ConnectorError) -> AvailError {
        match err {
            ConnectorError::Timeout { .. } => AvailError::network_timeout(err.to_string()),
            ConnectorError::InsufficientFunds(_) => AvailError::insufficient_funds(err.to_string()),
            ConnectorError::RouteUnavailable { .. } | ConnectorError::UnsupportedChain(_) => {
                AvailError::unsupported_route(err.to_string())
            }
            ConnectorError::Rpc { code, message } => {
                let classified = Self::classify_rpc(*code, message);
                let summary = match classified {
                    ErrorCode::UnknownChainError => "chain connector returned an error".to_string(),
                    _ => err.to_string(),
                };
                AvailError::new(classified, summary).with_details(message.clone())
            }
            ConnectorError::Reverted(details) | ConnectorError::InvalidResponse(details) => {
                AvailError::new(ErrorCode::UnknownChainError, err.to_string())
                    .with_details(details.clone())
            }
        }
    }

    /// Classify a JSON-RPC error by code and message text.
    pub fn classify_rpc(code: Option<i64>, message: &str) -> ErrorCode {
        if code == Some(EIP1193_USER_REJECTED) {
            return ErrorCode::UserRejected;
        }

        let lower = message.to_ascii_lowercase();
        if lower.contains("user rejected") || lower.contains("user denied") {
            ErrorCode::UserRejected
        } else if lower.contains("insufficient funds")
            || lower.contains("exceeds balance")
            || lower.contains("insufficient balance")
        {
            ErrorCode::InsufficientFunds
        } else if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("deadline exceeded")
        {
            ErrorCode::NetworkTimeout
        } else {
            ErrorCode::UnknownChainError
        }
    }

    /// Build the error returned when every requested chain failed.
    pub fn aggregation_failed(failures: &[(ChainId, AvailError)]) -> AvailError {
        let details = failures
            .iter()
            .map(|(chain, err)| format!("chain {chain}: {err}"))
            .collect::<Vec<_>>()
            .join("; ");
        AvailError::aggregation_failed(format!(
            "balance query failed on all {} requested chains",
            failures.len()
        ))
        .with_details(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenSymbol;

    #[test]
    fn only_network_timeout_is_retryable() {
        assert!(ErrorCode::NetworkTimeout.is_retryable());
        assert!(!ErrorCode::UserRejected.is_retryable());
        assert!(!ErrorCode::UnknownChainError.is_retryable());
        assert!(!ErrorCode::InsufficientLiquidity.is_retryable());
    }

    #[test]
    fn eip1193_code_means_user_rejected() {
        assert_eq!(
            ErrorClassifier::classify_rpc(Some(4001), "whatever"),
            ErrorCode::UserRejected
        );
        assert_eq!(
            ErrorClassifier::classify_rpc(None, "MetaMask Tx Signature: User denied transaction"),
            ErrorCode::UserRejected
        );
    }

    #[test]
    fn rpc_messages_map_to_taxonomy() {
        assert_eq!(
            ErrorClassifier::classify_rpc(
                Some(-32000),
                "insufficient funds for gas * price + value"
            ),
            ErrorCode::InsufficientFunds
        );
        assert_eq!(
            ErrorClassifier::classify_rpc(Some(-32603), "request timed out"),
            ErrorCode::NetworkTimeout
        );
        assert_eq!(
            ErrorClassifier::classify_rpc(Some(-32601), "method not found"),
            ErrorCode::UnknownChainError
        );
    }

    #[test]
    fn unknown_rpc_errors_keep_details_verbatim() {
        let raw = "execution reverted: 0x08c379a0 weird payload";
        let err = ErrorClassifier::classify(&RawFailure::Connector(ConnectorError::Rpc {
            code: Some(3),
            message: raw.to_string(),
        }));
        assert_eq!(err.code, ErrorCode::UnknownChainError);
        assert_eq!(err.details.as_deref(), Some(raw));
    }

    #[test]
    fn route_errors_are_unsupported_route() {
        let err = ErrorClassifier::classify(&RawFailure::Connector(
            ConnectorError::RouteUnavailable {
                from: ChainId(1),
                to: ChainId(56),
                token: TokenSymbol::from("USDC"),
            },
        ));
        assert_eq!(err.code, ErrorCode::UnsupportedRoute);
    }

    #[test]
    fn approval_timeout_is_user_rejected_but_confirmation_timeout_is_network() {
        let approval = ErrorClassifier::classify(&RawFailure::ApprovalTimeout {
            phase: PaymentPhase::AwaitingIntentApproval,
            timeout: Duration::from_secs(1),
        });
        assert_eq!(approval.code, ErrorCode::UserRejected);

        let confirmation = ErrorClassifier::classify(&RawFailure::ConfirmationTimeout {
            chain_id: ChainId(10),
            timeout: Duration::from_secs(1),
        });
        assert_eq!(confirmation.code, ErrorCode::NetworkTimeout);
        assert!(confirmation.is_retryable());
    }

    #[test]
    fn aggregation_failure_lists_every_chain() {
        let failures = vec![
            (ChainId(1), AvailError::network_timeout("slow")),
            (ChainId(10), AvailError::new(ErrorCode::UnknownChainError, "boom")),
        ];
        let err = ErrorClassifier::aggregation_failed(&failures);
        assert_eq!(err.code, ErrorCode::AggregationFailed);
        let details = err.details.unwrap();
        assert!(details.contains("chain 1"));
        assert!(details.contains("chain 10"));
    }

    #[test]
    fn error_serializes_with_stable_code() {
        let err = AvailError::user_rejected("nope");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "USER_REJECTED");
        assert!(json.get("details").is_none());
    }
}
