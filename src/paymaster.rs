// src/paymaster.rs
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, U256};
use serde_json::{Map, Value};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::chain::ChainClient;
use crate::config::{PaymasterConfig, ONE_DAY_SECS};
use crate::error::PaymasterError;
use crate::store::AccountStore;
use crate::types::{
    account_key, encode_quantity_bytes, Account, GasLimits, GasRemain, PaymasterResponse,
    TierConfigResponse, UserOperation,
};

/// Length of an ECDSA `r || s || v` signature.
const SIGNATURE_LEN: usize = 65;

/// Keyed async mutexes serializing check-then-mutate sequences per account.
#[derive(Default)]
pub struct AccountLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AccountLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only referenced by the map are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Gas sponsorship engine: allowance grants, ledger deductions and signing.
pub struct Paymaster {
    config: PaymasterConfig,
    chain: Arc<dyn ChainClient>,
    accounts: Arc<dyn AccountStore>,
    locks: AccountLocks,
}

impl Paymaster {
    pub fn new(
        config: PaymasterConfig,
        chain: Arc<dyn ChainClient>,
        accounts: Arc<dyn AccountStore>,
    ) -> Self {
        info!(
            "Initialized paymaster {:?} for entry point {:?}",
            config.paymaster, config.entry_point
        );
        Self {
            config,
            chain,
            accounts,
            locks: AccountLocks::default(),
        }
    }

    pub fn config(&self) -> &PaymasterConfig {
        &self.config
    }

    /// Grants a fresh allowance to `address` according to its tier.
    pub async fn request_gas(&self, address: &str) -> Result<bool, PaymasterError> {
        let owner = parse_address(address)?;
        let key = account_key(&owner);
        let _guard = self.locks.lock(&key).await;

        let existing = self.find_account(&key).await?;

        let vip_token = match self
            .with_deadline("vip token query", self.chain.vip_token_of(owner))
            .await
        {
            Ok(token) => token,
            Err(e) => {
                debug!("Treating {} as non-VIP: {}", key, e);
                None
            }
        };

        let now = unix_now();
        let tiers = &self.config.tiers;

        // The VIP slot is per token: lock it so two holders cannot claim it at once.
        let _vip_guard = match vip_token {
            Some(token_id) => Some(self.locks.lock(&format!("vip:{token_id}")).await),
            None => None,
        };

        let allowance = match (&existing, vip_token) {
            (existing, Some(token_id)) => {
                let linked = self
                    .with_deadline("vip account lookup", self.accounts.find_by_vip_token(token_id))
                    .await
                    .map_err(into_lookup_failure)?;
                if let Some(linked) = linked {
                    if within_window(linked.last_request, now) {
                        warn!(
                            "VIP token {} already claimed by {} within the window",
                            token_id, linked.address
                        );
                        return Err(PaymasterError::FrequentRequest);
                    }
                }
                if existing.as_ref().is_some_and(|acc| !acc.enabled) {
                    return Err(PaymasterError::AccountDisabled);
                }
                tiers.max_vip_gas
            }
            (Some(acc), None) if within_window(acc.last_request, now) => {
                return Err(PaymasterError::FrequentRequest);
            }
            (Some(acc), None) if !acc.enabled => return Err(PaymasterError::AccountDisabled),
            (None, None) => tiers.create_gas,
            (Some(_), None) => tiers.max_gas,
        };

        let mut account = existing.unwrap_or_else(|| Account::new(key.clone()));
        account.remaining_gas = allowance;
        account.last_request = now;
        account.vip_token_id = vip_token;

        if let Err(e) = self.with_deadline("account save", self.accounts.save(&account)).await {
            error!("Failed to save allowance grant for {}: {}", key, e);
            return Err(e);
        }

        info!("Granted {} gas allowance to {}", allowance, key);
        Ok(true)
    }

    /// Deducts the operation's cost from the sender's allowance and signs it.
    ///
    /// A signature is only produced after the deduction has been persisted.
    pub async fn sponsor_user_operation(
        &self,
        raw_op: Map<String, Value>,
        entry_point: &str,
    ) -> Result<PaymasterResponse, PaymasterError> {
        let mut user_op: UserOperation = serde_json::from_value(Value::Object(raw_op))
            .map_err(|e| PaymasterError::InvalidParams(format!("invalid user operation: {e}")))?;

        let entry_point = parse_address(entry_point)?;
        if entry_point != self.config.entry_point {
            return Err(PaymasterError::InvalidParams(format!(
                "unsupported entry point {entry_point:?}"
            )));
        }

        let key = account_key(&user_op.sender);
        let _guard = self.locks.lock(&key).await;

        let mut account = match self.find_account(&key).await? {
            Some(account) if account.enabled => account,
            _ => {
                debug!("No sponsorable account for {}", key);
                return Err(PaymasterError::InsufficientGas);
            }
        };

        let limits = GasLimits::fixed();
        let total_cost = limits
            .total()
            .and_then(|gas| gas.checked_mul(user_op.max_fee_per_gas))
            .ok_or_else(|| PaymasterError::InvalidParams("gas cost overflow".to_string()))?;

        if total_cost > account.remaining_gas {
            debug!(
                "Refusing {}: cost {} exceeds remaining {}",
                key, total_cost, account.remaining_gas
            );
            return Err(PaymasterError::InsufficientGas);
        }

        account.used_gas = account.used_gas.saturating_add(total_cost);
        account.remaining_gas -= total_cost;
        if let Err(e) = self.with_deadline("account save", self.accounts.save(&account)).await {
            error!("Failed to save deduction of {} for {}: {}", total_cost, key, e);
            return Err(e);
        }

        let valid_after = unix_now();
        let valid_until = valid_after + ONE_DAY_SECS;
        let time_range = encode_time_range(valid_until, valid_after);

        user_op.pre_verification_gas = limits.pre_verification_gas;
        user_op.verification_gas_limit = limits.verification_gas_limit;
        user_op.call_gas_limit = limits.call_gas_limit;
        user_op.paymaster_and_data =
            self.paymaster_and_data(&time_range, &[0u8; SIGNATURE_LEN]);
        user_op.signature = Bytes::default();

        let hash = self
            .with_deadline(
                "operation hash",
                self.chain.operation_hash(&user_op, valid_until, valid_after),
            )
            .await
            .map_err(|e| {
                error!("Failed to compute operation hash for {}: {}", key, e);
                e
            })?;
        let signature = self
            .with_deadline("signing", self.chain.sign_hash(hash))
            .await
            .map_err(|e| {
                error!("Failed to sign operation hash for {}: {}", key, e);
                e
            })?;

        info!(
            "Sponsored operation from {} (cost {}, remaining {})",
            key, total_cost, account.remaining_gas
        );

        Ok(PaymasterResponse {
            paymaster_and_data: format!(
                "0x{}",
                hex::encode(self.paymaster_and_data(&time_range, &signature))
            ),
            pre_verification_gas: encode_quantity_bytes(limits.pre_verification_gas),
            verification_gas_limit: encode_quantity_bytes(limits.verification_gas_limit),
            call_gas_limit: encode_quantity_bytes(limits.call_gas_limit),
        })
    }

    /// Reports the allowance of `address`. Unknown and disabled accounts read as empty.
    pub async fn gas_remain(&self, address: &str) -> Result<GasRemain, PaymasterError> {
        let key = account_key(&parse_address(address)?);
        match self.find_account(&key).await? {
            Some(account) if account.enabled => Ok(GasRemain {
                remain: account.remaining_gas.to_string(),
                last_request: i64::try_from(account.last_request).unwrap_or(i64::MAX),
                total_used: account.used_gas.to_string(),
            }),
            _ => Ok(GasRemain::empty()),
        }
    }

    pub fn tier_config(&self) -> TierConfigResponse {
        TierConfigResponse {
            max_gas: self.config.tiers.max_gas.to_string(),
            vip_contract: format!("{:?}", self.config.vip_contract),
            max_vip_gas: self.config.tiers.max_vip_gas.to_string(),
        }
    }

    // paymaster address || abi.encode(validUntil, validAfter) || signature
    fn paymaster_and_data(&self, time_range: &[u8], signature: &[u8]) -> Bytes {
        let mut data = Vec::with_capacity(20 + time_range.len() + signature.len());
        data.extend_from_slice(self.config.paymaster.as_bytes());
        data.extend_from_slice(time_range);
        data.extend_from_slice(signature);
        Bytes::from(data)
    }

    async fn find_account(&self, key: &str) -> Result<Option<Account>, PaymasterError> {
        self.with_deadline("account lookup", self.accounts.find_by_address(key))
            .await
            .map_err(|e| {
                error!("Failed to query account {}: {}", key, e);
                into_lookup_failure(e)
            })
    }

    async fn with_deadline<T, E>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T, E>>,
    ) -> Result<T, PaymasterError>
    where
        PaymasterError: From<E>,
    {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                error!("{} exceeded {:?}", what, self.config.call_timeout);
                Err(PaymasterError::Timeout(what))
            }
        }
    }
}

/// ABI encoding of `(uint48 validUntil, uint48 validAfter)`.
pub fn encode_time_range(valid_until: u64, valid_after: u64) -> Vec<u8> {
    encode(&[
        Token::Uint(U256::from(valid_until)),
        Token::Uint(U256::from(valid_after)),
    ])
}

fn into_lookup_failure(e: PaymasterError) -> PaymasterError {
    match e {
        PaymasterError::Store(e) => PaymasterError::AccountLookupFailed(e),
        other => other,
    }
}

fn parse_address(address: &str) -> Result<Address, PaymasterError> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|_| PaymasterError::InvalidParams(format!("invalid address: {address}")))
}

fn within_window(last_request: u64, now: u64) -> bool {
    last_request.saturating_add(ONE_DAY_SECS) > now
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
