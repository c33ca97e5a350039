//! Fee, time and slippage estimation for a prospective bridge.

use std::str::FromStr;
use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::OrchestratorConfig;
use crate::connector::{ChainConnector, ConnectorError, NetworkConditions};
use crate::error::{AvailError, ErrorClassifier, RawFailure};
use crate::types::{exact, Amount, BridgeEstimate, BridgeOperation, ChainId};

/// Computes [`BridgeEstimate`]s from live connector data.
///
/// Estimation has no side effects; calling it twice with unchanged network
/// conditions yields the same estimate.
pub struct BridgeEstimator {
    connector: Arc<dyn ChainConnector>,
    config: Arc<OrchestratorConfig>,
}

impl BridgeEstimator {
    pub fn new(connector: Arc<dyn ChainConnector>, config: Arc<OrchestratorConfig>) -> Self {
        Self { connector, config }
    }

    pub async fn estimate(&self, operation: &BridgeOperation) -> Result<BridgeEstimate, AvailError> {
        operation.validate()?;

        let source = self.select_source(operation).await?;
        let timeout = self.config.balance_query_timeout();
        let conditions = match tokio::time::timeout(
            timeout,
            self.connector
                .get_network_conditions(source, operation.chain_id, &operation.token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout {
                operation: format!("network conditions {source} -> {}", operation.chain_id),
                timeout,
            }),
        }
        .map_err(|e| ErrorClassifier::classify(&RawFailure::Connector(e)))?;

        let estimate = compute_estimate(operation, source, &conditions, self.config.max_slippage)?;
        info!(
            token = %operation.token,
            amount = %operation.amount,
            source = %source,
            destination = %operation.chain_id,
            bridge_fee = %estimate.bridge_fee,
            slippage = %estimate.slippage,
            "bridge estimated"
        );
        Ok(estimate)
    }

    /// Pick the candidate chain holding the largest balance that covers the
    /// amount. Ties go to the earlier configured chain.
    async fn select_source(&self, operation: &BridgeOperation) -> Result<ChainId, AvailError> {
        let candidates: Vec<ChainId> = self
            .config
            .effective_source_chains()
            .into_iter()
            .filter(|chain| *chain != operation.chain_id)
            .collect();

        if candidates.is_empty() {
            return Err(AvailError::unsupported_route(format!(
                "no source chain other than destination {} is configured",
                operation.chain_id
            )));
        }

        let timeout = self.config.balance_query_timeout();
        let reads = candidates.iter().map(|chain| {
            let chain = *chain;
            async move {
                let read = self
                    .connector
                    .get_balance(chain, &operation.token, &self.config.owner_address);
                let result = match tokio::time::timeout(timeout, read).await {
                    Ok(result) => result,
                    Err(_) => Err(ConnectorError::Timeout {
                        operation: format!("balance query on chain {chain}"),
                        timeout,
                    }),
                };
                (chain, result)
            }
        });
        let balances = join_all(reads).await;

        let mut best: Option<(ChainId, Amount)> = None;
        let mut first_failure = None;
        let mut readable = 0usize;
        for (chain, result) in balances {
            match result {
                Ok(balance) => {
                    readable += 1;
                    debug!(chain = %chain, balance = %balance, "source candidate");
                    let covers = balance >= operation.amount;
                    let better = best
                        .as_ref()
                        .map_or(true, |(_, current)| balance > *current);
                    if covers && better {
                        best = Some((chain, balance));
                    }
                }
                Err(err) => {
                    debug!(chain = %chain, error = %err, "source candidate unreadable");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }

        match (best, first_failure) {
            (Some((chain, _)), _) => Ok(chain),
            (None, Some(err)) if readable == 0 => {
                Err(ErrorClassifier::classify(&RawFailure::Connector(err)))
            }
            _ => Err(AvailError::insufficient_funds(format!(
                "no source chain holds {} {}",
                operation.amount, operation.token
            ))),
        }
    }
}

/// Price a bridge of `operation` from `source` under `conditions`.
///
/// Fees are computed exactly; only the slippage ratio is rounded, to the
/// 28 decimal places a [`Decimal`] can carry.
pub fn compute_estimate(
    operation: &BridgeOperation,
    source: ChainId,
    conditions: &NetworkConditions,
    max_slippage: Decimal,
) -> Result<BridgeEstimate, AvailError> {
    let amount = operation.amount.as_decimal();
    let invalid = |what: &str| {
        ErrorClassifier::classify(&RawFailure::Connector(ConnectorError::InvalidResponse(
            format!("{what} out of range in network conditions"),
        )))
    };

    if conditions.liquidity_depth <= Decimal::ZERO {
        return Err(AvailError::insufficient_liquidity(format!(
            "no {} liquidity on chain {}",
            operation.token, operation.chain_id
        )));
    }

    let bridge_fee = Amount::new(amount * &exact(conditions.bridge_fee_rate))
        .map_err(|_| invalid("bridge_fee_rate"))?;
    let gas_fee = Amount::new(exact(conditions.gas_price) * exact(conditions.gas_limit))
        .map_err(|_| invalid("gas_price"))?;

    let exact_slippage = amount / &(exact(conditions.liquidity_depth) + amount);
    if exact_slippage > exact(max_slippage) {
        return Err(AvailError::insufficient_liquidity(format!(
            "estimated slippage {} exceeds maximum {max_slippage}",
            exact_slippage.round(8).to_plain_string()
        )));
    }
    let slippage = Decimal::from_str(&exact_slippage.round(28).to_plain_string())
        .map_err(|_| invalid("liquidity_depth"))?
        .normalize();

    let estimated_time =
        Decimal::from(conditions.source_finality_secs) + Decimal::from(conditions.settlement_secs);

    Ok(BridgeEstimate {
        source_chain: source,
        destination_chain: operation.chain_id,
        token: operation.token.clone(),
        amount: operation.amount.clone(),
        received_amount: operation.amount.saturating_sub(&bridge_fee),
        bridge_fee,
        gas_fee,
        estimated_time,
        slippage,
        required_allowance: operation.amount.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::str::FromStr;

    fn conditions() -> NetworkConditions {
        NetworkConditions {
            gas_price: Decimal::from_str("0.00000002").unwrap(),
            gas_limit: Decimal::from(150_000),
            bridge_fee_rate: Decimal::from_str("0.001").unwrap(),
            liquidity_depth: Decimal::from(1_000_000),
            source_finality_secs: 60,
            settlement_secs: 120,
        }
    }

    fn op() -> BridgeOperation {
        BridgeOperation::new("USDC", "100", 137u64).unwrap()
    }

    #[test]
    fn applies_the_fee_formulae() {
        let estimate =
            compute_estimate(&op(), ChainId::ETHEREUM, &conditions(), Decimal::new(1, 2)).unwrap();
        assert_eq!(estimate.bridge_fee.to_string(), "0.1");
        assert_eq!(estimate.gas_fee.to_string(), "0.003");
        assert_eq!(estimate.estimated_time, Decimal::from(180));
        assert_eq!(estimate.received_amount.to_string(), "99.9");
        assert_eq!(estimate.required_allowance, op().amount);
        assert_eq!(
            estimate.slippage,
            Decimal::from_str("0.0000999900009999000099990001").unwrap()
        );
    }

    #[test]
    fn saturated_liquidity_does_not_overflow() {
        let mut deep = conditions();
        deep.liquidity_depth = Decimal::MAX;
        let big = BridgeOperation::new("USDC", "79228162514264337593543950335", 137u64).unwrap();
        let estimate = compute_estimate(&big, ChainId::ETHEREUM, &deep, Decimal::ONE).unwrap();
        assert_eq!(estimate.slippage, Decimal::new(5, 1));
    }

    #[test]
    fn eighteen_decimal_fees_are_exact() {
        let op = BridgeOperation::new("WETH", "123456789012.123456789012345678", 10u64).unwrap();
        let estimate = compute_estimate(&op, ChainId::ETHEREUM, &conditions(), Decimal::ONE).unwrap();
        assert_eq!(
            estimate.bridge_fee.to_string(),
            "123456789.012123456789012345678"
        );
        assert_eq!(
            (&estimate.received_amount + &estimate.bridge_fee),
            op.amount
        );
    }

    #[test]
    fn excessive_slippage_is_insufficient_liquidity() {
        let mut shallow = conditions();
        shallow.liquidity_depth = Decimal::from(1_000);
        let err = compute_estimate(&op(), ChainId::ETHEREUM, &shallow, Decimal::new(1, 2))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientLiquidity);

        shallow.liquidity_depth = Decimal::ZERO;
        let err = compute_estimate(&op(), ChainId::ETHEREUM, &shallow, Decimal::ONE).unwrap_err();
        assert_eq!(err.code, ErrorCode::InsufficientLiquidity);
    }

    #[test]
    fn negative_conditions_are_rejected() {
        let mut broken = conditions();
        broken.bridge_fee_rate = Decimal::from(-1);
        let err = compute_estimate(&op(), ChainId::ETHEREUM, &broken, Decimal::ONE).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownChainError);
    }

    #[test]
    fn estimate_is_deterministic() {
        let a = compute_estimate(&op(), ChainId::BASE, &conditions(), Decimal::ONE).unwrap();
        let b = compute_estimate(&op(), ChainId::BASE, &conditions(), Decimal::ONE).unwrap();
        assert_eq!(a, b);
    }
}
