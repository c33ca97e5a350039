//! Cross-chain balance aggregation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::connector::{ChainConnector, ConnectorError};
use crate::error::{AvailError, ErrorClassifier, RawFailure};
use crate::events::{AvailEvent, EventBus, EventData};
use crate::types::{exact, Amount, ChainBalance, ChainId, TokenSymbol, UnifiedBalance};

/// Merges per-chain balances of one token into a [`UnifiedBalance`].
pub struct BalanceAggregator {
    connector: Arc<dyn ChainConnector>,
    config: Arc<OrchestratorConfig>,
    events: EventBus,
}

impl BalanceAggregator {
    pub fn new(
        connector: Arc<dyn ChainConnector>,
        config: Arc<OrchestratorConfig>,
        events: EventBus,
    ) -> Self {
        Self {
            connector,
            config,
            events,
        }
    }

    /// Query every chain concurrently and sum the readable balances.
    ///
    /// Unreadable chains are reported as zero with a warning; the call only
    /// fails when no chain could be read at all.
    pub async fn get_unified_balance(
        &self,
        token: &TokenSymbol,
        chain_ids: &[ChainId],
    ) -> Result<UnifiedBalance, AvailError> {
        let chains = dedup_in_order(chain_ids);
        if chains.is_empty() {
            return Err(AvailError::aggregation_failed("no chains requested"));
        }
        let owner = &self.config.owner_address;
        let timeout = self.config.balance_query_timeout();

        let balances = join_all(chains.iter().map(|chain| {
            bounded(
                timeout,
                format!("balance query on chain {chain}"),
                self.connector.get_balance(*chain, token, owner),
            )
        }));
        let price = bounded(
            timeout,
            format!("price query for {token}"),
            self.connector.get_token_price(token),
        );
        let (balances, price) = tokio::join!(balances, price);

        let price = match price {
            Ok(price) if price.is_sign_negative() => {
                warn!(token = %token, price = %price, "negative token price ignored");
                None
            }
            Ok(price) => Some(price),
            Err(err) => {
                warn!(token = %token, error = %err, "token price unavailable");
                None
            }
        };

        let mut entries = Vec::with_capacity(chains.len());
        let mut failures = Vec::new();
        for (chain, result) in chains.iter().copied().zip(balances) {
            match result {
                Ok(balance) => {
                    let value =
                        price.and_then(|price| Amount::new(balance.as_decimal() * &exact(price)).ok());
                    let entry = match value {
                        Some(value) => ChainBalance {
                            chain_id: chain,
                            balance,
                            value,
                            warning: None,
                        },
                        None => ChainBalance {
                            chain_id: chain,
                            balance,
                            value: Amount::zero(),
                            warning: Some(format!("price unavailable for {token}")),
                        },
                    };
                    entries.push(entry);
                }
                Err(err) => {
                    let classified = ErrorClassifier::classify(&RawFailure::Connector(err));
                    warn!(
                        chain = %chain,
                        token = %token,
                        error = %classified,
                        "chain degraded to zero balance"
                    );
                    entries.push(ChainBalance::degraded(
                        chain,
                        format!("balance unavailable: {}", classified.message),
                    ));
                    failures.push((chain, classified));
                }
            }
        }

        if failures.len() == chains.len() {
            return Err(ErrorClassifier::aggregation_failed(&failures));
        }

        let unified = UnifiedBalance {
            token: token.clone(),
            total_balance: entries.iter().map(|e| &e.balance).sum(),
            total_value: entries.iter().map(|e| &e.value).sum(),
            chain_balances: entries,
            updated_at: Utc::now(),
        };

        info!(
            token = %token,
            chains = chains.len(),
            degraded = failures.len(),
            total = %unified.total_balance,
            "unified balance aggregated"
        );
        self.events.publish(AvailEvent::new(EventData::UnifiedBalanceUpdated {
            balance: unified.clone(),
        }));
        Ok(unified)
    }
}

fn dedup_in_order(chain_ids: &[ChainId]) -> Vec<ChainId> {
    let mut seen = Vec::with_capacity(chain_ids.len());
    for chain in chain_ids {
        if !seen.contains(chain) {
            seen.push(*chain);
        }
    }
    seen
}

async fn bounded<T>(
    timeout: Duration,
    operation: String,
    fut: impl Future<Output = Result<T, ConnectorError>>,
) -> Result<T, ConnectorError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Timeout { operation, timeout }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_collapse_to_first_occurrence() {
        let chains = [ChainId(10), ChainId(1), ChainId(10), ChainId(137), ChainId(1)];
        assert_eq!(
            dedup_in_order(&chains),
            vec![ChainId(10), ChainId(1), ChainId(137)]
        );
    }
}
