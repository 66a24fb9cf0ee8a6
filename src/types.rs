// src/types.rs
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// An ERC-4337 v0.6 user operation as submitted by a wallet.
///
/// Gas limits, `paymasterAndData` and `signature` may be omitted by the caller;
/// the paymaster fills in the first three before hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default)]
    pub init_code: Bytes,
    #[serde(default)]
    pub call_data: Bytes,
    #[serde(default)]
    pub call_gas_limit: U256,
    #[serde(default)]
    pub verification_gas_limit: U256,
    #[serde(default)]
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    #[serde(default)]
    pub max_priority_fee_per_gas: U256,
    #[serde(default)]
    pub paymaster_and_data: Bytes,
    #[serde(default)]
    pub signature: Bytes,
}

/// A sponsored account and its gas ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Lower-case `0x` address, the record key.
    pub address: String,
    pub enabled: bool,
    /// Allowance left, in gas * fee units.
    pub remaining_gas: U256,
    /// Everything ever deducted. Never decreases.
    pub used_gas: U256,
    /// Unix seconds of the last allowance grant, 0 if never granted.
    pub last_request: u64,
    pub vip_token_id: Option<U256>,
}

impl Account {
    /// A fresh, enabled account with an empty ledger.
    pub fn new(address: String) -> Self {
        Self {
            address,
            enabled: true,
            remaining_gas: U256::zero(),
            used_gas: U256::zero(),
            last_request: 0,
            vip_token_id: None,
        }
    }
}

/// Credential presented in the request path by API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub enabled: bool,
    #[serde(default)]
    pub label: String,
}

/// Gas limits the paymaster commits to when signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasLimits {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
}

impl GasLimits {
    /// The fixed estimates used for every sponsored operation.
    pub fn fixed() -> Self {
        Self {
            pre_verification_gas: U256::from(52_304u64),
            verification_gas_limit: U256::from(100_000u64),
            call_gas_limit: U256::from(33_100u64),
        }
    }

    pub fn total(&self) -> Option<U256> {
        self.pre_verification_gas
            .checked_add(self.verification_gas_limit)?
            .checked_add(self.call_gas_limit)
    }
}

/// Result of `pm_sponsorUserOperation`. All fields are hex strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterResponse {
    pub paymaster_and_data: String,
    pub pre_verification_gas: String,
    pub verification_gas_limit: String,
    pub call_gas_limit: String,
}

/// Result of `pm_gasRemain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasRemain {
    pub remain: String,
    pub last_request: i64,
    pub total_used: String,
}

impl GasRemain {
    pub fn empty() -> Self {
        Self {
            remain: "0".to_string(),
            last_request: 0,
            total_used: "0".to_string(),
        }
    }
}

/// Result of `pm_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfigResponse {
    pub max_gas: String,
    pub vip_contract: String,
    pub max_vip_gas: String,
}

/// Lower-case, `0x`-prefixed form used as the account key.
pub fn account_key(address: &Address) -> String {
    format!("{address:?}")
}

/// Hex-encodes the minimal big-endian bytes of `value` (`0` encodes as `0x`).
pub fn encode_quantity_bytes(value: U256) -> String {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(buf.len());
    format!("0x{}", hex::encode(&buf[first..]))
}
