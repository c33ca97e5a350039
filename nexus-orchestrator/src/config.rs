//! Orchestrator configuration.

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AvailError;
use crate::types::{Address, ChainId, TokenSymbol};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for AvailError {
    fn from(err: ConfigError) -> Self {
        AvailError::invalid_configuration(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NETWORK ENVIRONMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Network environment (mainnet vs testnet).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkEnvironment {
    #[default]
    Mainnet,
    Testnet,
}

impl NetworkEnvironment {
    /// Chains scanned for source funds when none are configured.
    pub fn default_source_chains(&self) -> Vec<ChainId> {
        match self {
            NetworkEnvironment::Mainnet => vec![
                ChainId::ETHEREUM,
                ChainId::OPTIMISM,
                ChainId::POLYGON,
                ChainId::BASE,
                ChainId::ARBITRUM,
            ],
            NetworkEnvironment::Testnet => vec![
                ChainId::SEPOLIA,
                ChainId::OPTIMISM_SEPOLIA,
                ChainId::POLYGON_AMOY,
                ChainId::BASE_SEPOLIA,
                ChainId::ARBITRUM_SEPOLIA,
            ],
        }
    }

    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            NetworkEnvironment::Mainnet => "https://nexus.availproject.org",
            NetworkEnvironment::Testnet => "https://nexus-testnet.availproject.org",
        }
    }
}

/// What to do with a submission while another operation holds the
/// execution slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrentOperationPolicy {
    /// Wait for the slot, first come first served.
    #[default]
    Queue,
    /// Fail with `OperationInFlight`.
    Reject,
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub network: NetworkEnvironment,

    /// Overrides the network's default endpoint.
    #[serde(default)]
    pub rpc_url: Option<String>,

    /// Retries for `NetworkTimeout` failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,

    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,

    #[serde(default)]
    pub concurrent_operation_policy: ConcurrentOperationPolicy,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Bound on each per-chain balance or price query.
    #[serde(default = "default_balance_query_timeout_ms")]
    pub balance_query_timeout_ms: u64,

    /// Largest acceptable price impact, as a fraction.
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,

    /// Account whose funds are bridged.
    #[serde(default)]
    pub owner_address: Address,

    /// Spender approved for allowance-based tokens.
    #[serde(default = "default_bridge_contract")]
    pub bridge_contract: Address,

    /// Candidate source chains in preference order; empty means the
    /// network defaults.
    #[serde(default)]
    pub source_chains: Vec<ChainId>,

    /// Tokens that never need an allowance.
    #[serde(default = "default_native_tokens")]
    pub native_tokens: Vec<TokenSymbol>,

    /// Operations kept for lookup; the oldest finished ones are evicted
    /// past this count.
    #[serde(default = "default_max_retained_operations")]
    pub max_retained_operations: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_confirmation_timeout_ms() -> u64 {
    120_000
}

fn default_approval_timeout_ms() -> u64 {
    300_000
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_balance_query_timeout_ms() -> u64 {
    10_000
}

fn default_max_slippage() -> Decimal {
    Decimal::new(1, 2)
}

fn default_bridge_contract() -> Address {
    Address::new("0x0000000000000000000000000000000000b41d9e")
}

fn default_native_tokens() -> Vec<TokenSymbol> {
    vec![TokenSymbol::from("ETH")]
}

fn default_max_retained_operations() -> usize {
    256
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            network: NetworkEnvironment::default(),
            rpc_url: None,
            max_retries: default_max_retries(),
            confirmation_timeout_ms: default_confirmation_timeout_ms(),
            approval_timeout_ms: default_approval_timeout_ms(),
            concurrent_operation_policy: ConcurrentOperationPolicy::default(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            balance_query_timeout_ms: default_balance_query_timeout_ms(),
            max_slippage: default_max_slippage(),
            owner_address: Address::default(),
            bridge_contract: default_bridge_contract(),
            source_chains: Vec::new(),
            native_tokens: default_native_tokens(),
            max_retained_operations: default_max_retained_operations(),
        }
    }
}

impl OrchestratorConfig {
    /// Mainnet defaults for `owner`.
    pub fn new(owner: impl Into<Address>) -> Self {
        Self {
            owner_address: owner.into(),
            ..Self::default()
        }
    }

    /// Testnet defaults for `owner`.
    pub fn testnet(owner: impl Into<Address>) -> Self {
        Self {
            network: NetworkEnvironment::Testnet,
            ..Self::new(owner)
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner_address.is_empty() {
            return Err(ConfigError::Invalid("owner_address is required".into()));
        }
        if self.bridge_contract.is_empty() {
            return Err(ConfigError::Invalid("bridge_contract must not be empty".into()));
        }
        if self.confirmation_timeout_ms == 0 || self.approval_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than 0".into()));
        }
        if self.balance_query_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "balance_query_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.max_retained_operations == 0 {
            return Err(ConfigError::Invalid(
                "max_retained_operations must be greater than 0".into(),
            ));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        if self.max_slippage <= Decimal::ZERO || self.max_slippage > Decimal::ONE {
            return Err(ConfigError::Invalid(format!(
                "max_slippage must be in (0, 1], got {}",
                self.max_slippage
            )));
        }
        if let Some(url) = &self.rpc_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!("rpc_url is not http(s): {url}")));
            }
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> &str {
        self.rpc_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_rpc_url())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn balance_query_timeout(&self) -> Duration {
        Duration::from_millis(self.balance_query_timeout_ms)
    }

    /// Source chains to consider, in preference order.
    pub fn effective_source_chains(&self) -> Vec<ChainId> {
        if self.source_chains.is_empty() {
            self.network.default_source_chains()
        } else {
            self.source_chains.clone()
        }
    }

    /// Whether bridging `token` needs an ERC-20 style allowance.
    pub fn requires_allowance(&self, token: &TokenSymbol) -> bool {
        !self.native_tokens.contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config = OrchestratorConfig::from_json_str(r#"{"owner_address":"0xowner"}"#).unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(120));
        assert_eq!(config.concurrent_operation_policy, ConcurrentOperationPolicy::Queue);
        assert_eq!(config.rpc_url(), "https://nexus.availproject.org");
        assert_eq!(config.effective_source_chains().len(), 5);
        assert_eq!(config.max_retained_operations, 256);
    }

    #[test]
    fn parses_policy_and_network() {
        let config = OrchestratorConfig::from_json_str(
            r#"{
                "owner_address": "0xowner",
                "network": "testnet",
                "concurrent_operation_policy": "reject",
                "source_chains": [1, 10],
                "max_slippage": "0.05"
            }"#,
        )
        .unwrap();
        assert_eq!(config.network, NetworkEnvironment::Testnet);
        assert_eq!(config.concurrent_operation_policy, ConcurrentOperationPolicy::Reject);
        assert_eq!(config.effective_source_chains(), vec![ChainId(1), ChainId(10)]);
        assert_eq!(config.max_slippage, Decimal::new(5, 2));
    }

    #[test]
    fn missing_owner_is_invalid() {
        let err = OrchestratorConfig::from_json_str("{}").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let avail: AvailError = err.into();
        assert_eq!(avail.code, crate::error::ErrorCode::InvalidConfiguration);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = OrchestratorConfig::new("0xowner");
        config.max_slippage = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::new("0xowner");
        config.retry_base_delay_ms = 60_000;
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::new("0xowner");
        config.rpc_url = Some("ftp://nope".into());
        assert!(config.validate().is_err());

        let mut config = OrchestratorConfig::new("0xowner");
        config.max_retained_operations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn native_tokens_skip_allowance() {
        let config = OrchestratorConfig::testnet("0xowner");
        assert!(!config.requires_allowance(&TokenSymbol::from("eth")));
        assert!(config.requires_allowance(&TokenSymbol::from("USDC")));
    }
}
