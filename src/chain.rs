// src/chain.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer, WalletError};
use thiserror::Error;
use tracing::info;

use crate::types::UserOperation;

mod contracts {
    use ethers::prelude::abigen;

    abigen!(
        VerifyingPaymaster,
        r#"[
            struct UserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; uint256 callGasLimit; uint256 verificationGasLimit; uint256 preVerificationGas; uint256 maxFeePerGas; uint256 maxPriorityFeePerGas; bytes paymasterAndData; bytes signature; }
            function getHash(UserOperation userOp, uint48 validUntil, uint48 validAfter) external view returns (bytes32)
        ]"#
    );

    abigen!(
        VipNft,
        r#"[
            function tokenOfOwnerByIndex(address owner, uint256 index) external view returns (uint256)
        ]"#
    );
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("contract call failed: {0}")]
    Contract(String),

    #[error("signing failed: {0}")]
    Signing(#[from] WalletError),
}

/// Everything the paymaster needs from the chain and the signing key.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// The hash the on-chain paymaster verifies for `op` and the validity window.
    async fn operation_hash(
        &self,
        op: &UserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<H256, ChainError>;

    /// Signs `hash` with the paymaster key. Returns the 65-byte `r || s || v` signature.
    async fn sign_hash(&self, hash: H256) -> Result<Bytes, ChainError>;

    /// First VIP token held by `owner`, if any.
    async fn vip_token_of(&self, owner: Address) -> Result<Option<U256>, ChainError>;
}

/// [`ChainClient`] backed by a JSON-RPC node and a local private key.
pub struct EthersChainClient {
    wallet: LocalWallet,
    paymaster: contracts::VerifyingPaymaster<Provider<Http>>,
    vip: contracts::VipNft<Provider<Http>>,
}

impl EthersChainClient {
    pub async fn new(
        private_key: &str,
        chain_id: u64,
        eth_rpc_url: &str,
        paymaster_address: Address,
        vip_address: Address,
    ) -> anyhow::Result<Self> {
        let wallet = private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()?
            .with_chain_id(chain_id);

        let provider = Provider::<Http>::try_from(eth_rpc_url)?;
        let node_chain_id = provider.get_chainid().await?;
        if node_chain_id != U256::from(chain_id) {
            anyhow::bail!("node reports chain id {node_chain_id}, expected {chain_id}");
        }
        let client = Arc::new(provider);

        info!(
            "Initialized chain client: signer {:?}, paymaster {:?}, vip contract {:?}",
            wallet.address(),
            paymaster_address,
            vip_address
        );

        Ok(Self {
            wallet,
            paymaster: contracts::VerifyingPaymaster::new(paymaster_address, client.clone()),
            vip: contracts::VipNft::new(vip_address, client),
        })
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn operation_hash(
        &self,
        op: &UserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<H256, ChainError> {
        let packed = contracts::UserOperation {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.init_code.clone(),
            call_data: op.call_data.clone(),
            call_gas_limit: op.call_gas_limit,
            verification_gas_limit: op.verification_gas_limit,
            pre_verification_gas: op.pre_verification_gas,
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            paymaster_and_data: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        };

        let hash = self
            .paymaster
            .get_hash(packed, valid_until, valid_after)
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(H256::from(hash))
    }

    async fn sign_hash(&self, hash: H256) -> Result<Bytes, ChainError> {
        let signature = self.wallet.sign_message(hash.as_bytes()).await?;
        Ok(Bytes::from(signature.to_vec()))
    }

    async fn vip_token_of(&self, owner: Address) -> Result<Option<U256>, ChainError> {
        // Reverts when the owner holds no token.
        let token = self
            .vip
            .token_of_owner_by_index(owner, U256::zero())
            .call()
            .await
            .map_err(|e| ChainError::Contract(e.to_string()))?;

        Ok(Some(token))
    }
}
