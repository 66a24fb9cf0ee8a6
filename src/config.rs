// src/config.rs
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use ethers::types::{Address, U256};

/// Fixed length of the allowance rate-limit window and of every authorization.
pub const ONE_DAY_SECS: u64 = 86_400;

/// The v0.6 entry point the paymaster contract is deployed against.
pub const DEFAULT_ENTRY_POINT: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Verifying paymaster for ERC-4337 user operations", long_about = None)]
pub struct Cli {
    /// Path of the account and API key database
    #[clap(long, env = "PAYMASTER_DB_PATH", default_value = "./data/paymaster.db", global = true)]
    pub db_path: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the JSON-RPC service
    Serve(ServeArgs),

    /// Manage API keys
    #[clap(subcommand)]
    ApiKey(ApiKeyCommand),

    /// Enable or disable sponsored accounts
    #[clap(subcommand)]
    Account(AccountCommand),
}

#[derive(Subcommand, Debug)]
pub enum ApiKeyCommand {
    Add {
        key: String,
        #[clap(long, default_value = "")]
        label: String,
    },
    Disable {
        key: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum AccountCommand {
    Enable { address: String },
    Disable { address: String },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[clap(short, long, env = "PAYMASTER_RPC_ADDR", default_value = "127.0.0.1:8545")]
    pub rpc_server_addr: String,

    #[clap(short, long, env = "PAYMASTER_PRIVATE_KEY", hide_env_values = true)]
    pub private_key: String,

    #[clap(short, long, env = "PAYMASTER_CHAIN_ID")]
    pub chain_id: u64,

    #[clap(short, long, env = "PAYMASTER_ETH_RPC_URL")]
    pub eth_rpc_url: String,

    /// Address of the deployed VerifyingPaymaster contract
    #[clap(long, env = "PAYMASTER_CONTRACT", value_parser = parse_address)]
    pub paymaster_contract: Address,

    #[clap(long, env = "PAYMASTER_ENTRY_POINT", default_value = DEFAULT_ENTRY_POINT, value_parser = parse_address)]
    pub entry_point: Address,

    #[clap(long, env = "PAYMASTER_VIP_CONTRACT", value_parser = parse_address)]
    pub vip_contract: Address,

    /// Allowance granted to a brand-new, non-VIP account (decimal)
    #[clap(long, env = "PAYMASTER_CREATE_GAS", value_parser = parse_gas)]
    pub create_gas: U256,

    /// Standard allowance ceiling (decimal)
    #[clap(long, env = "PAYMASTER_MAX_GAS", value_parser = parse_gas)]
    pub max_gas: U256,

    /// VIP allowance ceiling (decimal)
    #[clap(long, env = "PAYMASTER_MAX_VIP_GAS", value_parser = parse_gas)]
    pub max_vip_gas: U256,

    /// Deadline for every chain and store call, in milliseconds
    #[clap(long, env = "PAYMASTER_CALL_TIMEOUT_MS", default_value_t = 10_000)]
    pub call_timeout_ms: u64,
}

impl ServeArgs {
    pub fn paymaster_config(&self) -> PaymasterConfig {
        PaymasterConfig {
            paymaster: self.paymaster_contract,
            entry_point: self.entry_point,
            vip_contract: self.vip_contract,
            tiers: GasTierConfig {
                create_gas: self.create_gas,
                max_gas: self.max_gas,
                max_vip_gas: self.max_vip_gas,
            },
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

/// Allowance ceilings per tier, in gas * fee units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasTierConfig {
    pub create_gas: U256,
    pub max_gas: U256,
    pub max_vip_gas: U256,
}

/// Immutable settings of the sponsorship engine.
#[derive(Debug, Clone)]
pub struct PaymasterConfig {
    pub paymaster: Address,
    pub entry_point: Address,
    pub vip_contract: Address,
    pub tiers: GasTierConfig,
    pub call_timeout: Duration,
}

fn parse_address(s: &str) -> Result<Address, String> {
    s.parse::<Address>().map_err(|e| format!("invalid address {s}: {e}"))
}

fn parse_gas(s: &str) -> Result<U256, String> {
    U256::from_dec_str(s).map_err(|e| format!("invalid decimal amount {s}: {e}"))
}
