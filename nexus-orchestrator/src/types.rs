//! Value types shared by every orchestrator component.

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use bigdecimal::{BigDecimal, Signed, Zero};
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AvailError;

// ═══════════════════════════════════════════════════════════════════════════════
// IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════════

/// EVM-style numeric chain identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl ChainId {
    pub const ETHEREUM: ChainId = ChainId(1);
    pub const OPTIMISM: ChainId = ChainId(10);
    pub const POLYGON: ChainId = ChainId(137);
    pub const BASE: ChainId = ChainId(8453);
    pub const ARBITRUM: ChainId = ChainId(42161);
    pub const SEPOLIA: ChainId = ChainId(11_155_111);
    pub const OPTIMISM_SEPOLIA: ChainId = ChainId(11_155_420);
    pub const POLYGON_AMOY: ChainId = ChainId(80_002);
    pub const BASE_SEPOLIA: ChainId = ChainId(84_532);
    pub const ARBITRUM_SEPOLIA: ChainId = ChainId(421_614);

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Human-readable network name, if the chain is a well-known one.
    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            Self::ETHEREUM => "ethereum",
            Self::OPTIMISM => "optimism",
            Self::POLYGON => "polygon",
            Self::BASE => "base",
            Self::ARBITRUM => "arbitrum",
            Self::SEPOLIA => "sepolia",
            Self::OPTIMISM_SEPOLIA => "optimism-sepolia",
            Self::POLYGON_AMOY => "polygon-amoy",
            Self::BASE_SEPOLIA => "base-sepolia",
            Self::ARBITRUM_SEPOLIA => "arbitrum-sepolia",
            _ => return None,
        };
        Some(name)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        ChainId(id)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token symbol, normalised to upper case.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TokenSymbol(String);

impl TokenSymbol {
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(symbol.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for TokenSymbol {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

impl From<String> for TokenSymbol {
    fn from(symbol: String) -> Self {
        Self::new(symbol)
    }
}

impl From<TokenSymbol> for String {
    fn from(symbol: TokenSymbol) -> Self {
        symbol.0
    }
}

impl fmt::Display for TokenSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Account or contract address on a connected chain.
///
/// Kept as the host hands it over; address checksumming belongs to the
/// connector.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for Address {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for Address {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction hash as reported by the chain connector.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl TxHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned to an operation when it is submitted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Derive a unique id from the operation fields, the orchestrator's
    /// submission sequence number and the current time.
    pub(crate) fn derive(sequence: u64, operation: &BridgeOperation) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"nexus_operation_v1");
        hasher.update(sequence.to_be_bytes());
        hasher.update(operation.token.as_str().as_bytes());
        hasher.update(operation.amount.to_string().as_bytes());
        hasher.update(operation.chain_id.as_u64().to_be_bytes());
        if let Some(recipient) = &operation.recipient_address {
            hasher.update(recipient.as_str().as_bytes());
        }
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        hasher.update(now.to_be_bytes());

        let digest = hasher.finalize();
        Self(format!("op_{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AMOUNTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Non-negative token amount with arbitrary decimal precision.
///
/// Sums never round, whatever the token's decimals. Serialized as a plain
/// decimal string so no precision is lost on the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(BigDecimal);

impl Amount {
    pub fn zero() -> Self {
        Self(BigDecimal::zero())
    }

    pub fn new(value: BigDecimal) -> Result<Self, AvailError> {
        if value.is_negative() {
            return Err(AvailError::invalid_operation(format!(
                "amount must not be negative (got {})",
                value.to_plain_string()
            )));
        }
        Ok(Self(value.normalized()))
    }

    pub fn parse(input: &str) -> Result<Self, AvailError> {
        let value = BigDecimal::from_str(input.trim()).map_err(|e| {
            AvailError::invalid_operation(format!("invalid decimal amount '{input}'"))
                .with_details(e.to_string())
        })?;
        Self::new(value)
    }

    pub fn as_decimal(&self) -> &BigDecimal {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Saturating subtraction; never goes below zero.
    pub fn saturating_sub(&self, other: &Amount) -> Amount {
        if other.0 >= self.0 {
            Amount::zero()
        } else {
            Amount((&self.0 - &other.0).normalized())
        }
    }
}

/// Lift a fixed-point value into the arbitrary-precision domain.
pub(crate) fn exact(value: Decimal) -> BigDecimal {
    BigDecimal::new(BigInt::from(value.mantissa()), i64::from(value.scale()))
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount((self.0 + rhs.0).normalized())
    }
}

impl<'a> Add<&'a Amount> for &'a Amount {
    type Output = Amount;

    fn add(self, rhs: &'a Amount) -> Amount {
        Amount((&self.0 + &rhs.0).normalized())
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::zero(), Add::add)
    }
}

impl<'a> std::iter::Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.fold(Amount::zero(), |total, next| &total + next)
    }
}

impl TryFrom<BigDecimal> for Amount {
    type Error = AvailError;

    fn try_from(value: BigDecimal) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AvailError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Amount::new(exact(value))
    }
}

impl TryFrom<String> for Amount {
    type Error = AvailError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Amount::parse(&value)
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

impl FromStr for Amount {
    type Err = AvailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_plain_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATIONS AND ESTIMATES
// ═══════════════════════════════════════════════════════════════════════════════

/// A request to move `amount` of `token` to `chain_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeOperation {
    /// Token to bridge.
    pub token: TokenSymbol,
    /// Amount to bridge; always strictly positive.
    pub amount: Amount,
    /// Destination chain.
    pub chain_id: ChainId,
    /// Recipient on the destination chain. Defaults to the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_address: Option<Address>,
}

impl BridgeOperation {
    /// Create an operation, parsing `amount` as a decimal string.
    pub fn new(
        token: impl Into<TokenSymbol>,
        amount: &str,
        chain_id: impl Into<ChainId>,
    ) -> Result<Self, AvailError> {
        let operation = Self {
            token: token.into(),
            amount: Amount::parse(amount)?,
            chain_id: chain_id.into(),
            recipient_address: None,
        };
        operation.validate()?;
        Ok(operation)
    }

    /// Send to a recipient other than the sender.
    pub fn with_recipient(mut self, recipient: impl Into<Address>) -> Self {
        self.recipient_address = Some(recipient.into());
        self
    }

    /// Validate an operation that may have bypassed [`BridgeOperation::new`].
    pub fn validate(&self) -> Result<(), AvailError> {
        if self.token.is_empty() {
            return Err(AvailError::invalid_operation("token symbol is empty"));
        }
        if self.amount.is_zero() {
            return Err(AvailError::invalid_operation("amount must be greater than 0"));
        }
        if let Some(recipient) = &self.recipient_address {
            if recipient.is_empty() {
                return Err(AvailError::invalid_operation("recipient address is empty"));
            }
        }
        Ok(())
    }
}

/// Cost, time and price-impact estimate for a prospective bridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeEstimate {
    /// Chain the funds are taken from.
    pub source_chain: ChainId,
    /// Destination chain.
    pub destination_chain: ChainId,
    pub token: TokenSymbol,
    pub amount: Amount,
    /// Protocol fee, denominated in the bridged token.
    pub bridge_fee: Amount,
    /// Source-chain gas cost, denominated in the native token.
    pub gas_fee: Amount,
    /// Expected seconds until destination settlement.
    pub estimated_time: Decimal,
    /// Expected price impact as a fraction (0.01 = 1%).
    pub slippage: Decimal,
    /// Amount expected to arrive after the bridge fee.
    pub received_amount: Amount,
    /// Allowance the bridge contract needs on the source chain.
    pub required_allowance: Amount,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BALANCES
// ═══════════════════════════════════════════════════════════════════════════════

/// One chain's contribution to a [`UnifiedBalance`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBalance {
    pub chain_id: ChainId,
    pub balance: Amount,
    /// Fiat-equivalent value of `balance`.
    pub value: Amount,
    /// Set when the entry was degraded because the chain could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl ChainBalance {
    pub(crate) fn degraded(chain_id: ChainId, warning: impl Into<String>) -> Self {
        Self {
            chain_id,
            balance: Amount::zero(),
            value: Amount::zero(),
            warning: Some(warning.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.warning.is_some()
    }
}

/// Aggregated holdings of one token across chains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedBalance {
    pub token: TokenSymbol,
    pub total_balance: Amount,
    pub total_value: Amount,
    /// Entries in the order the chains were requested.
    pub chain_balances: Vec<ChainBalance>,
    pub updated_at: DateTime<Utc>,
}

impl UnifiedBalance {
    pub fn balance_on(&self, chain_id: ChainId) -> Option<&ChainBalance> {
        self.chain_balances.iter().find(|b| b.chain_id == chain_id)
    }

    /// Chains whose entries were degraded to zero.
    pub fn degraded_chains(&self) -> Vec<ChainId> {
        self.chain_balances
            .iter()
            .filter(|b| b.is_degraded())
            .map(|b| b.chain_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn token_symbols_are_normalised() {
        assert_eq!(TokenSymbol::new(" usdc "), TokenSymbol::from("USDC"));
        assert_eq!(TokenSymbol::from("eth").to_string(), "ETH");
    }

    #[test]
    fn amount_parse_rejects_garbage_and_negatives() {
        assert_eq!(
            Amount::parse("abc").unwrap_err().code,
            ErrorCode::InvalidOperation
        );
        assert_eq!(
            Amount::parse("-1").unwrap_err().code,
            ErrorCode::InvalidOperation
        );
        assert_eq!(Amount::parse("100.50").unwrap().to_string(), "100.5");
    }

    #[test]
    fn amount_sum_keeps_full_precision() {
        let parts = ["0.1", "0.2", "0.000000000000000001"];
        let total: Amount = parts.iter().map(|p| Amount::parse(p).unwrap()).sum();
        assert_eq!(total.to_string(), "0.300000000000000001");
    }

    #[test]
    fn amount_serializes_as_string() {
        let amount = Amount::parse("12.345").unwrap();
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"12.345\"");
        let back: Amount = serde_json::from_str("\"12.345\"").unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn operation_requires_positive_amount() {
        let err = BridgeOperation::new("USDC", "0", 137u64).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOperation);

        let op = BridgeOperation::new("usdc", "100", 137u64).unwrap();
        assert_eq!(op.token.as_str(), "USDC");
        assert_eq!(op.chain_id, ChainId::POLYGON);
    }

    #[test]
    fn deserialized_operation_still_validates() {
        let op: BridgeOperation =
            serde_json::from_str(r#"{"token":"USDC","amount":"0","chain_id":10}"#).unwrap();
        assert!(op.validate().is_err());
    }

    #[test]
    fn operation_ids_differ_per_sequence() {
        let op = BridgeOperation::new("USDC", "1", 10u64).unwrap();
        let a = OperationId::derive(0, &op);
        let b = OperationId::derive(1, &op);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("op_"));
        assert_eq!(a.as_str().len(), 3 + 32);
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let small = Amount::parse("1.5").unwrap();
        let big = Amount::try_from(Decimal::from(3)).unwrap();
        assert_eq!(small.saturating_sub(&big), Amount::zero());
        assert_eq!(big.saturating_sub(&small).to_string(), "1.5");
    }

    #[test]
    fn wide_amounts_add_without_rounding() {
        let whole = Amount::parse("1000000000000").unwrap();
        let dust = Amount::parse("0.000000000000000001").unwrap();
        assert_eq!(dust.to_string(), "0.000000000000000001");
        assert_eq!(
            (&whole + &dust).to_string(),
            "1000000000000.000000000000000001"
        );

        let huge = Amount::parse("123456789012345678901234567890.123456789012345678").unwrap();
        let total: Amount = [huge.clone(), huge].iter().sum();
        assert_eq!(total.to_string(), "246913578024691357802469135780.246913578024691356");
    }

    #[test]
    fn fixed_point_values_lift_exactly() {
        let rate = Decimal::from_str("0.001").unwrap();
        assert_eq!(Amount::try_from(rate).unwrap().to_string(), "0.001");
        assert!(Amount::try_from(Decimal::from(-2)).is_err());
    }
}
