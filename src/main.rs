//! Mimble node and wallet binary.
//!
//! Usage:
//!   mimble node                          # run a full node
//!   mimble wallet init                   # create an encrypted wallet seed
//!   mimble wallet receive --slate s.json # receiver round of a slate
//!
//! Exit codes: 0 normal, 1 configuration error, 2 database-open failure,
//! 3 unrecoverable consensus corruption.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use mimble::config::MimbleConfig;
use mimble::node::{Server, ServerError};
use mimble::wallet::{builder, seed, slate::Slate};

/// Mimblewimble full node and wallet.
#[derive(Parser, Debug)]
#[command(name = "mimble", version, about = "Mimblewimble full node and wallet")]
struct Cli {
    /// Data directory for chain state and wallet files.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log filter (overrides config and RUST_LOG), e.g. "debug".
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full node.
    Node {
        /// P2P listen port.
        #[arg(long)]
        port: Option<u16>,

        /// Seed peer addresses (comma-separated host:port).
        #[arg(long, value_delimiter = ',')]
        seeds: Vec<String>,
    },

    /// Manage the wallet.
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
}

#[derive(Subcommand, Debug)]
enum WalletAction {
    /// Create a new encrypted wallet seed.
    Init {
        /// Password protecting the seed file.
        #[arg(long)]
        password: String,
    },

    /// Receiver round: add our output and partial signature to a slate.
    Receive {
        /// Incoming slate JSON file.
        #[arg(long)]
        slate: PathBuf,

        /// Where to write the countersigned slate.
        #[arg(long)]
        out: PathBuf,

        /// Password for the seed file.
        #[arg(long)]
        password: String,

        /// Keychain index for the receiving output.
        #[arg(long, default_value = "0")]
        key_index: u32,
    },
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let base_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("./mimble-data"));
    let mut config = MimbleConfig::load(&base_dir);
    if let Some(dir) = &cli.data_dir {
        config.node.data_dir = dir.display().to_string();
    }
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.node.log_level.clone());
    init_tracing(&log_level);

    let command = cli.command;
    match command {
        Some(Command::Wallet { action }) => run_wallet(config, action),
        node_command => {
            if let Some(Command::Node { port, seeds }) = node_command {
                if let Some(port) = port {
                    config.p2p.port = port;
                }
                if !seeds.is_empty() {
                    config.p2p.seeds = seeds;
                }
            }
            run_node(config).await
        }
    }
}

async fn run_node(config: MimbleConfig) -> ExitCode {
    let server = match Server::new(config) {
        Ok(server) => server,
        Err(ServerError::DbOpen(e)) => {
            error!("cannot open database: {e}");
            return ExitCode::from(2);
        }
        Err(ServerError::ChainInit(e)) => {
            error!("chain state unrecoverable: {e}");
            return ExitCode::from(3);
        }
    };

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(ServerError::DbOpen(e)) => {
            error!("database failure: {e}");
            ExitCode::from(2)
        }
        Err(ServerError::ChainInit(e)) => {
            error!("fatal: {e}");
            ExitCode::from(3)
        }
    }
}

fn run_wallet(config: MimbleConfig, action: WalletAction) -> ExitCode {
    let wallet_dir = config.data_dir().join("wallet");
    match action {
        WalletAction::Init { password } => match seed::init(&wallet_dir, &password) {
            Ok(_) => {
                println!("wallet seed created in {}", wallet_dir.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("wallet init failed: {e}");
                ExitCode::from(1)
            }
        },
        WalletAction::Receive {
            slate,
            out,
            password,
            key_index,
        } => {
            let result = (|| -> Result<(), String> {
                let wallet_seed =
                    seed::open(&wallet_dir, &password).map_err(|e| e.to_string())?;
                let keychain = wallet_seed.keychain();
                let json = std::fs::read_to_string(&slate).map_err(|e| e.to_string())?;
                let mut slate = Slate::from_json(&json).map_err(|e| e.to_string())?;
                let owned =
                    builder::receive(&keychain, &mut slate, key_index).map_err(|e| e.to_string())?;
                let json = slate.to_json().map_err(|e| e.to_string())?;
                std::fs::write(&out, json).map_err(|e| e.to_string())?;
                println!(
                    "received {} to output {} (key index {})",
                    owned.value,
                    owned.commitment.to_hex(),
                    owned.key_index
                );
                Ok(())
            })();
            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("receive failed: {e}");
                    ExitCode::from(1)
                }
            }
        }
    }
}
