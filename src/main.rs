//! FilTube entry point
//!
//! Serves the catalog API and runs uploads and tips from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use filtube::config::AppConfig;
use filtube::storage::gateway::GatewayConnector;
use filtube::storage::memory::InMemoryNetwork;
use filtube::storage::{
    retrieval_url, truncate_address, Network, SessionOptions, StaticSigner, StorageConnector,
    StorageContext, WalletSigner,
};
use filtube::upload::{FileKind, UploadFile, UploadObserver, UploadOrchestrator, UploadState};
use filtube::{api, telemetry, tip};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "filtube", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(long, env = "FILTUBE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the catalog RPC server
    Serve,
    /// Store a video or image on Filecoin
    Upload {
        path: PathBuf,
        /// Wallet paying for the storage
        #[arg(long)]
        address: String,
        /// Inferred from the file extension when omitted
        #[arg(long)]
        kind: Option<FileKind>,
        /// Simulate the storage network in memory
        #[arg(long)]
        dry_run: bool,
    },
    /// Send a USDFC tip to a channel owner
    Tip {
        recipient: String,
        amount: String,
        #[arg(long)]
        address: String,
        #[arg(long, default_value_t = 314159)]
        chain_id: u64,
    },
    /// Print the CDN retrieval URL for a stored piece
    Url { wallet: String, commp: String },
}

/// Prints each status change on stderr
struct ConsoleObserver;

impl UploadObserver for ConsoleObserver {
    fn on_state(&self, state: &UploadState) {
        eprintln!("[{:>3}%] {:<17} {}", state.progress, state.phase.to_string(), state.status_message);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.log_json)?;

    let config = AppConfig::load(args.config.as_deref())?;
    info!(
        "Starting FilTube v{} ({}) on {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_SHA"),
        config.network
    );

    let outcome = run(args.command, config).await;
    telemetry::shutdown_telemetry();
    outcome
}

async fn run(command: Command, config: AppConfig) -> anyhow::Result<()> {
    match command {
        Command::Serve => api::run_server(&config).await?,
        Command::Upload {
            path,
            address,
            kind,
            dry_run,
        } => upload(&config, path, address, kind, dry_run).await?,
        Command::Tip {
            recipient,
            amount,
            address,
            chain_id,
        } => send_tip(&config, &recipient, &amount, address, chain_id).await?,
        Command::Url { wallet, commp } => {
            println!("{}", retrieval_url(&wallet, config.network, &commp)?);
        }
    }
    Ok(())
}

async fn upload(
    config: &AppConfig,
    path: PathBuf,
    address: String,
    kind: Option<FileKind>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let connector: Arc<dyn StorageConnector> = if dry_run {
        info!("Dry run: using the in-memory storage network");
        Arc::new(InMemoryNetwork::new())
    } else {
        Arc::new(GatewayConnector::new(config.gateway_url()?))
    };
    let signer: Arc<dyn WalletSigner> =
        Arc::new(StaticSigner::new(address.clone(), config.network.chain_id()));

    let context = Arc::new(StorageContext::new(
        connector,
        Some(signer),
        config.network,
        &config.storage,
    ));
    context
        .connect()
        .await
        .with_context(|| format!("connecting wallet {}", truncate_address(&address)))?;

    let orchestrator = UploadOrchestrator::from_config(context, config)?;
    orchestrator.add_observer(Arc::new(ConsoleObserver));

    let file = UploadFile::from_path(&path, kind, &config.upload_limits()).await?;
    let result = orchestrator.upload(file).await?;
    let url = retrieval_url(&address, config.network, &result.commp)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "result": result,
            "url": url.as_str(),
        }))?
    );
    Ok(())
}

async fn send_tip(
    config: &AppConfig,
    recipient: &str,
    amount: &str,
    address: String,
    chain_id: u64,
) -> anyhow::Result<()> {
    let request = tip::prepare_tip(true, chain_id, recipient, amount)?;

    let connector = GatewayConnector::new(config.gateway_url()?);
    let signer = StaticSigner::new(address, chain_id);
    let session = connector
        .open(
            &signer,
            SessionOptions {
                network: Network::from_chain_id(chain_id).unwrap_or(config.network),
                with_cdn: config.storage.with_cdn,
            },
        )
        .await?;

    let tx = tip::send_tip(&session, &request).await?;
    println!("Tip sent! Transaction: {}", tx.hash);
    Ok(())
}
