//! Host-provided seams: chain access and user approval.
//!
//! The orchestrator never speaks RPC or holds keys itself. Everything that
//! touches a chain goes through [`ChainConnector`]; everything that needs a
//! human decision goes through [`Signer`].

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, Amount, BridgeEstimate, BridgeOperation, ChainId, TokenSymbol, TxHash};

/// Errors raised by a [`ChainConnector`] implementation.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// JSON-RPC style failure as reported by the node or wallet provider.
    #[error("rpc error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    Rpc { code: Option<i64>, message: String },

    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout { operation: String, timeout: Duration },

    #[error("no bridge route from chain {from} to chain {to} for {token}")]
    RouteUnavailable {
        from: ChainId,
        to: ChainId,
        token: TokenSymbol,
    },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("unsupported chain {0}")]
    UnsupportedChain(ChainId),

    #[error("invalid connector response: {0}")]
    InvalidResponse(String),
}

/// Errors raised by a [`Signer`] implementation.
#[derive(Debug, Clone, Error)]
pub enum SignerError {
    #[error("signer unavailable: {0}")]
    Unavailable(String),

    #[error("signer rejected: {0}")]
    Rejected(String),
}

/// Bridge-route conditions used to price an estimate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// Source-chain gas price in native token units.
    pub gas_price: Decimal,
    /// Gas consumed by the bridge deposit.
    pub gas_limit: Decimal,
    /// Protocol fee as a fraction of the bridged amount.
    pub bridge_fee_rate: Decimal,
    /// Destination-side liquidity available for the token.
    pub liquidity_depth: Decimal,
    pub source_finality_secs: u64,
    pub settlement_secs: u64,
}

/// Transaction the orchestrator asks the connector to broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionPayload {
    /// ERC-20 style approval of `spender` for `amount`.
    Approve {
        token: TokenSymbol,
        owner: Address,
        spender: Address,
        amount: Amount,
    },
    /// Deposit into the bridge contract on the source chain.
    BridgeDeposit {
        token: TokenSymbol,
        amount: Amount,
        destination_chain: ChainId,
        recipient: Address,
    },
}

/// Receipt returned once a transaction is final.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub chain_id: ChainId,
    pub block_number: u64,
    /// False when the transaction was mined but reverted.
    pub success: bool,
}

/// Chain access supplied by the host.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// Balance of `token` held by `owner` on `chain_id`.
    async fn get_balance(
        &self,
        chain_id: ChainId,
        token: &TokenSymbol,
        owner: &Address,
    ) -> Result<Amount, ConnectorError>;

    /// Fiat price of one unit of `token`.
    async fn get_token_price(&self, token: &TokenSymbol) -> Result<Decimal, ConnectorError>;

    /// Allowance `owner` has granted `spender` on `chain_id`.
    async fn get_allowance(
        &self,
        chain_id: ChainId,
        token: &TokenSymbol,
        owner: &Address,
        spender: &Address,
    ) -> Result<Amount, ConnectorError>;

    /// Fee, gas and liquidity conditions for the route.
    async fn get_network_conditions(
        &self,
        from: ChainId,
        to: ChainId,
        token: &TokenSymbol,
    ) -> Result<NetworkConditions, ConnectorError>;

    /// Broadcast a transaction; returns its hash once accepted by the node.
    ///
    /// Approvals that time out are resubmitted. Bridge deposits are sent
    /// once: a `Timeout` on a deposit fails the operation, since the node may
    /// already have accepted it.
    async fn submit_transaction(
        &self,
        chain_id: ChainId,
        payload: TransactionPayload,
    ) -> Result<TxHash, ConnectorError>;

    /// Wait for `tx_hash` to reach finality on `chain_id`.
    ///
    /// For the destination chain `tx_hash` is the source deposit hash and the
    /// returned receipt carries the settlement transaction.
    async fn wait_for_confirmation(
        &self,
        chain_id: ChainId,
        tx_hash: &TxHash,
        timeout: Duration,
    ) -> Result<Receipt, ConnectorError>;
}

/// What the user is being asked to approve.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalSummary {
    Allowance {
        chain_id: ChainId,
        token: TokenSymbol,
        spender: Address,
        current: Amount,
        required: Amount,
    },
    Intent {
        operation: BridgeOperation,
        estimate: BridgeEstimate,
    },
}

/// Request handed to the [`Signer`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub operation_id: crate::types::OperationId,
    pub summary: ApprovalSummary,
}

/// The user's answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: Option<String> },
}

/// User-approval surface supplied by the host.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn request_approval(
        &self,
        request: &ApprovalRequest,
    ) -> Result<ApprovalDecision, SignerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_display_includes_code_when_present() {
        let err = ConnectorError::Rpc {
            code: Some(-32000),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "rpc error -32000: boom");

        let err = ConnectorError::Rpc {
            code: None,
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "rpc error: boom");
    }

    #[test]
    fn payload_is_tagged() {
        let payload = TransactionPayload::BridgeDeposit {
            token: TokenSymbol::from("USDC"),
            amount: Amount::parse("5").unwrap(),
            destination_chain: ChainId::BASE,
            recipient: Address::from("0xabc"),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "bridge_deposit");
        assert_eq!(json["destination_chain"], 8453);
    }
}
