// src/store.rs
use std::path::Path;

use async_trait::async_trait;
use ethers::types::U256;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;
use tracing::debug;

use crate::types::{Account, ApiKey};

const ACCOUNTS_TREE: &str = "accounts";
const VIP_INDEX_TREE: &str = "vip_index";
const API_KEYS_TREE: &str = "api_keys";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(#[from] sled::Error),

    #[error("corrupt record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("no record for {0}")]
    NotFound(String),
}

/// Durable account records. `save` is the unit of atomicity for ledger changes.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_address(&self, address: &str) -> Result<Option<Account>, StoreError>;

    /// The account that most recently claimed `token_id`, if it still holds it.
    async fn find_by_vip_token(&self, token_id: U256) -> Result<Option<Account>, StoreError>;

    /// Persists `account`. Returns only once the write is durable.
    async fn save(&self, account: &Account) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn find_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError>;
}

/// Account and API key store on top of sled.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    accounts: Tree,
    vip_index: Tree,
    api_keys: Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// A throwaway database, removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            accounts: db.open_tree(ACCOUNTS_TREE)?,
            vip_index: db.open_tree(VIP_INDEX_TREE)?,
            api_keys: db.open_tree(API_KEYS_TREE)?,
            db,
        })
    }

    pub async fn put_api_key(&self, api_key: &ApiKey) -> Result<(), StoreError> {
        let value = serde_json::to_vec(api_key)?;
        self.api_keys.insert(api_key.key.as_bytes(), value)?;
        self.db.flush_async().await?;
        Ok(())
    }

    pub async fn set_api_key_enabled(&self, key: &str, enabled: bool) -> Result<(), StoreError> {
        let mut api_key = self
            .find_key(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        api_key.enabled = enabled;
        self.put_api_key(&api_key).await
    }

    pub async fn set_account_enabled(&self, address: &str, enabled: bool) -> Result<(), StoreError> {
        let mut account = self
            .find_by_address(address)
            .await?
            .ok_or_else(|| StoreError::NotFound(address.to_string()))?;
        account.enabled = enabled;
        self.save(&account).await
    }

    fn decode_account(bytes: &[u8]) -> Result<Account, StoreError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn token_key(token_id: U256) -> [u8; 32] {
    let mut key = [0u8; 32];
    token_id.to_big_endian(&mut key);
    key
}

#[async_trait]
impl AccountStore for SledStore {
    async fn find_by_address(&self, address: &str) -> Result<Option<Account>, StoreError> {
        match self.accounts.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_account(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_by_vip_token(&self, token_id: U256) -> Result<Option<Account>, StoreError> {
        let Some(address) = self.vip_index.get(token_key(token_id))? else {
            return Ok(None);
        };
        let Some(bytes) = self.accounts.get(&address)? else {
            return Ok(None);
        };
        let account = Self::decode_account(&bytes)?;
        if account.vip_token_id != Some(token_id) {
            debug!("Stale vip index entry for token {} -> {}", token_id, account.address);
            return Ok(None);
        }
        Ok(Some(account))
    }

    async fn save(&self, account: &Account) -> Result<(), StoreError> {
        let value = serde_json::to_vec(account)?;
        let address = account.address.as_bytes();

        (&self.accounts, &self.vip_index)
            .transaction(|(accounts, vip_index)| {
                let previous = accounts.insert(address, value.as_slice())?;

                // Drop the index entry of a token this account no longer holds.
                if let Some(previous) = previous {
                    let previous: Account = serde_json::from_slice(&previous)
                        .map_err(ConflictableTransactionError::Abort)?;
                    if let Some(old) = previous.vip_token_id {
                        if Some(old) != account.vip_token_id {
                            let key = token_key(old);
                            if vip_index.get(key)?.as_deref() == Some(address) {
                                vip_index.remove(&key[..])?;
                            }
                        }
                    }
                }

                if let Some(token_id) = account.vip_token_id {
                    vip_index.insert(&token_key(token_id)[..], address)?;
                }
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => StoreError::Codec(e),
                TransactionError::Storage(e) => StoreError::Backend(e),
            })?;

        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for SledStore {
    async fn find_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError> {
        match self.api_keys.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
