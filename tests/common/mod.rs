#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;

use verifying_paymaster::chain::{ChainClient, ChainError};
use verifying_paymaster::config::{GasTierConfig, PaymasterConfig, DEFAULT_ENTRY_POINT};
use verifying_paymaster::paymaster::Paymaster;
use verifying_paymaster::store::{AccountStore, SledStore, StoreError};
use verifying_paymaster::types::{Account, UserOperation};

pub const SIGNER_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const PAYMASTER: &str = "0x00000000000000000000000000000000000000cc";
pub const VIP_CONTRACT: &str = "0x00000000000000000000000000000000000000dd";
pub const SENDER: &str = "0x0000000000000000000000000000000000000aaa";
pub const OTHER: &str = "0x0000000000000000000000000000000000000bbb";

/// Gas units of the fixed estimates: 52304 + 100000 + 33100.
pub const FIXED_GAS: u64 = 185_404;

pub fn tiers() -> GasTierConfig {
    GasTierConfig {
        create_gas: U256::from(1_000_000u64),
        max_gas: U256::from(2_000_000u64),
        max_vip_gas: U256::from(3_000_000u64),
    }
}

pub fn config() -> PaymasterConfig {
    PaymasterConfig {
        paymaster: PAYMASTER.parse().unwrap(),
        entry_point: DEFAULT_ENTRY_POINT.parse().unwrap(),
        vip_contract: VIP_CONTRACT.parse().unwrap(),
        tiers: tiers(),
        call_timeout: Duration::from_secs(5),
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Chain client signing locally, with a deterministic stand-in for `getHash`.
pub struct MockChain {
    pub wallet: LocalWallet,
    vip_tokens: Mutex<HashMap<Address, U256>>,
    /// Every operation passed to `operation_hash`, with its window.
    pub hashed: Mutex<Vec<(UserOperation, u64, u64)>>,
    pub hang: AtomicBool,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            wallet: SIGNER_KEY.parse().unwrap(),
            vip_tokens: Mutex::new(HashMap::new()),
            hashed: Mutex::new(Vec::new()),
            hang: AtomicBool::new(false),
        }
    }

    pub fn give_vip(&self, owner: &str, token_id: u64) {
        self.vip_tokens
            .lock()
            .unwrap()
            .insert(owner.parse().unwrap(), U256::from(token_id));
    }

    pub fn hash_of(op: &UserOperation, valid_until: u64, valid_after: u64) -> H256 {
        H256::from(keccak256(encode(&[
            Token::Address(op.sender),
            Token::Uint(op.nonce),
            Token::Bytes(op.paymaster_and_data.to_vec()),
            Token::Uint(op.call_gas_limit),
            Token::Uint(U256::from(valid_until)),
            Token::Uint(U256::from(valid_after)),
        ])))
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn operation_hash(
        &self,
        op: &UserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<H256, ChainError> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.hashed
            .lock()
            .unwrap()
            .push((op.clone(), valid_until, valid_after));
        Ok(Self::hash_of(op, valid_until, valid_after))
    }

    async fn sign_hash(&self, hash: H256) -> Result<Bytes, ChainError> {
        let signature = self.wallet.sign_message(hash.as_bytes()).await?;
        Ok(Bytes::from(signature.to_vec()))
    }

    async fn vip_token_of(&self, owner: Address) -> Result<Option<U256>, ChainError> {
        match self.vip_tokens.lock().unwrap().get(&owner) {
            Some(token) => Ok(Some(*token)),
            None => Err(ChainError::Contract("execution reverted".to_string())),
        }
    }
}

/// Sled store that counts writes and can be told to fail them.
pub struct FlakyStore {
    pub inner: SledStore,
    pub fail_saves: AtomicBool,
    pub saves: AtomicUsize,
    /// Pause after each `find_by_address`, in milliseconds.
    pub read_delay_ms: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SledStore::temporary().unwrap(),
            fail_saves: AtomicBool::new(false),
            saves: AtomicUsize::new(0),
            read_delay_ms: AtomicU64::new(0),
        }
    }

    pub async fn seed(&self, account: &Account) {
        self.inner.save(account).await.unwrap();
    }

    pub async fn get(&self, address: &str) -> Option<Account> {
        self.inner.find_by_address(address).await.unwrap()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountStore for FlakyStore {
    async fn find_by_address(&self, address: &str) -> Result<Option<Account>, StoreError> {
        let found = self.inner.find_by_address(address).await;
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            // Widens the gap between a read and the write that follows it.
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        found
    }

    async fn find_by_vip_token(&self, token_id: U256) -> Result<Option<Account>, StoreError> {
        self.inner.find_by_vip_token(token_id).await
    }

    async fn save(&self, account: &Account) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound(account.address.clone()));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(account).await
    }
}

pub struct Harness {
    pub paymaster: Arc<Paymaster>,
    pub chain: Arc<MockChain>,
    pub store: Arc<FlakyStore>,
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: PaymasterConfig) -> Harness {
    let chain = Arc::new(MockChain::new());
    let store = Arc::new(FlakyStore::new());
    let paymaster = Arc::new(Paymaster::new(config, chain.clone(), store.clone()));
    Harness {
        paymaster,
        chain,
        store,
    }
}

pub fn funded_account(address: &str, remaining: U256) -> Account {
    let mut account = Account::new(address.to_string());
    account.remaining_gas = remaining;
    account.last_request = unix_now() - 3_600;
    account
}

/// A user operation from `sender` paying `max_fee_per_gas` (hex quantity).
pub fn user_op(sender: &str, max_fee_per_gas: &str) -> serde_json::Map<String, serde_json::Value> {
    match serde_json::json!({
        "sender": sender,
        "nonce": "0x0",
        "initCode": "0x",
        "callData": "0xb61d27f6",
        "maxFeePerGas": max_fee_per_gas,
        "maxPriorityFeePerGas": "0x1",
        "paymasterAndData": "0x",
        "signature": "0x",
    }) {
        serde_json::Value::Object(map) => map,
        _ => unreachable!(),
    }
}
