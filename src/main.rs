// src/main.rs
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use ethers::types::Address;
use tracing::info;
use tracing_subscriber::EnvFilter;

use verifying_paymaster::chain::EthersChainClient;
use verifying_paymaster::config::{AccountCommand, ApiKeyCommand, Cli, Command, ServeArgs};
use verifying_paymaster::paymaster::Paymaster;
use verifying_paymaster::rpc;
use verifying_paymaster::server::{self, AppState};
use verifying_paymaster::store::SledStore;
use verifying_paymaster::types::{account_key, ApiKey};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let store = SledStore::open(&cli.db_path)?;

    match cli.command {
        Command::Serve(args) => serve(args, store).await,
        Command::ApiKey(ApiKeyCommand::Add { key, label }) => {
            store
                .put_api_key(&ApiKey {
                    key,
                    enabled: true,
                    label,
                })
                .await?;
            info!("API key added");
            Ok(())
        }
        Command::ApiKey(ApiKeyCommand::Disable { key }) => {
            store.set_api_key_enabled(&key, false).await?;
            info!("API key disabled");
            Ok(())
        }
        Command::Account(AccountCommand::Enable { address }) => {
            set_account_enabled(&store, &address, true).await
        }
        Command::Account(AccountCommand::Disable { address }) => {
            set_account_enabled(&store, &address, false).await
        }
    }
}

async fn serve(args: ServeArgs, store: SledStore) -> anyhow::Result<()> {
    let config = args.paymaster_config();
    let chain = EthersChainClient::new(
        &args.private_key,
        args.chain_id,
        &args.eth_rpc_url,
        config.paymaster,
        config.vip_contract,
    )
    .await?;

    let key_timeout = config.call_timeout;
    let store = Arc::new(store);
    let paymaster = Arc::new(Paymaster::new(config, Arc::new(chain), store.clone()));
    let dispatcher = Arc::new(rpc::paymaster_dispatcher(paymaster)?);

    let app = server::router(AppState {
        dispatcher,
        api_keys: store,
        key_timeout,
    });

    let server_addr: SocketAddr = args.rpc_server_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(server_addr).await?;
    info!("Starting verifying paymaster RPC server on {}", server_addr);

    // Keep the server running until Ctrl+C is pressed
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    info!("Server stopped");

    Ok(())
}

async fn set_account_enabled(store: &SledStore, address: &str, enabled: bool) -> anyhow::Result<()> {
    let address = address
        .parse::<Address>()
        .map_err(|e| anyhow::anyhow!("invalid address {address}: {e}"))?;
    let key = account_key(&address);
    store.set_account_enabled(&key, enabled).await?;
    info!("Account {} {}", key, if enabled { "enabled" } else { "disabled" });
    Ok(())
}
