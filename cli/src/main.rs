//! chainledger CLI — run the scanner and inspect ledger state.
//!
//! Usage:
//! ```bash
//! chainledger run     --config ledger.json
//! chainledger head
//! chainledger balance --address 0xabc… [--token 0xdef…] [--live]
//! chainledger history --address 0xabc… [--token 0xdef…] --page 0 --page-size 20
//! chainledger token   --address 0xdef…
//! chainledger send-raw --tx 0xf86b…
//! chainledger info    [--probe]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use chainledger_core::types::token_key;
use chainledger_core::{
    Amount, ChainSource, LedgerView, MemorySink, PersistenceSink, Pipeline, ScannerBuilder,
};
use chainledger_node::NodeClient;
use chainledger_storage::SqliteSink;

mod config;
mod logging;

use config::{AppConfig, Overrides, StorageConfig, MEMORY_DATABASE};

#[derive(Parser)]
#[command(
    name = "chainledger",
    about = "Reorg-safe address ledger for a block-producing chain",
    version
)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, env = "CHAINLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Node JSON-RPC endpoint
    #[arg(long, global = true, env = "CHAINLEDGER_RPC_URL")]
    rpc_url: Option<String>,

    /// SQLite database path, or `:memory:`
    #[arg(long, global = true, env = "CHAINLEDGER_DATABASE")]
    database: Option<String>,

    /// Global log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the chain until interrupted or a fatal error occurs
    Run {
        /// Blocks kept in memory before they are committed
        #[arg(long)]
        confirmation_depth: Option<usize>,
        /// Lowest height to ingest
        #[arg(long)]
        start_height: Option<u64>,
    },

    /// Print the durable chain head
    Head,

    /// Print stored balances of an address
    Balance {
        #[arg(long)]
        address: String,
        /// Only this token's sub-ledger
        #[arg(long)]
        token: Option<String>,
        /// Also ask the node for its current balance and nonce
        #[arg(long)]
        live: bool,
    },

    /// Print an address history, newest first
    History {
        #[arg(long)]
        address: String,
        /// Token leg instead of the native leg
        #[arg(long)]
        token: Option<String>,
        /// 0-based page number
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        page_size: usize,
    },

    /// Print resolved token metadata
    Token {
        #[arg(long)]
        address: String,
    },

    /// Broadcast a signed transaction
    #[command(name = "send-raw")]
    SendRaw {
        /// Hex-encoded signed transaction
        #[arg(long)]
        tx: String,
    },

    /// Show the effective configuration
    Info {
        /// Query the node's gas price to check connectivity
        #[arg(long)]
        probe: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (confirmation_depth, start_height) = match &cli.command {
        Commands::Run { confirmation_depth, start_height } => (*confirmation_depth, *start_height),
        _ => (None, None),
    };
    let overrides = Overrides {
        rpc_url: cli.rpc_url.clone(),
        database: cli.database.clone(),
        confirmation_depth,
        start_height,
        log_level: cli.log_level.clone(),
        log_json: cli.log_json,
    };
    let config = AppConfig::load(cli.config.as_deref(), &overrides)?;
    logging::init_tracing(&config.log);

    match cli.command {
        Commands::Run { .. } => cmd_run(config).await,
        Commands::Head => cmd_head(&config).await,
        Commands::Balance { address, token, live } => {
            cmd_balance(&config, &address, token.as_deref(), live).await
        }
        Commands::History { address, token, page, page_size } => {
            cmd_history(&config, &address, token.as_deref(), page, page_size).await
        }
        Commands::Token { address } => cmd_token(&config, &address).await,
        Commands::SendRaw { tx } => cmd_send_raw(&config, &tx).await,
        Commands::Info { probe } => cmd_info(&config, probe).await,
    }
}

async fn open_sink(storage: &StorageConfig) -> Result<Arc<dyn PersistenceSink>> {
    if storage.database == MEMORY_DATABASE {
        let sink: Arc<dyn PersistenceSink> = MemorySink::shared();
        return Ok(sink);
    }
    let sink = SqliteSink::open(&storage.database)
        .await
        .with_context(|| format!("opening database {}", storage.database))?;
    Ok(Arc::new(sink))
}

fn open_source(config: &AppConfig) -> Result<Arc<dyn ChainSource>> {
    let client: Arc<dyn ChainSource> =
        NodeClient::shared(&config.node).context("creating node client")?;
    Ok(client)
}

async fn open_pipeline(config: &AppConfig, cancel: CancellationToken) -> Result<Pipeline> {
    let source = open_source(config)?;
    let sink = open_sink(&config.storage).await?;
    let pipeline = ScannerBuilder::new()
        .config(config.scanner.clone())
        .build(source, sink, cancel)?;
    Ok(pipeline)
}

async fn open_view(config: &AppConfig) -> Result<LedgerView> {
    Ok(open_pipeline(config, CancellationToken::new()).await?.view)
}

// ─── run ──────────────────────────────────────────────────────────────────────

async fn cmd_run(config: AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let Pipeline { mut scanner, commit, resolver, .. } =
        open_pipeline(&config, cancel.clone()).await?;

    info!(
        rpc_url = %config.node.rpc_url,
        database = %config.storage.database,
        confirmation_depth = config.scanner.confirmation_depth,
        start_height = config.scanner.start_height,
        "starting chainledger"
    );

    let mut commit_task = tokio::spawn(commit.run());
    let resolver_task = tokio::spawn(resolver.run());
    let mut commit_done = false;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        res = scanner.run() => res.context("scanner stopped"),
        res = &mut commit_task => {
            commit_done = true;
            match res {
                Ok(res) => res.context("commit worker stopped"),
                Err(e) => Err(anyhow!(e)).context("commit worker panicked"),
            }
        }
    };

    cancel.cancel();
    if !commit_done {
        if let Ok(Err(e)) = commit_task.await {
            error!(error = %e, "commit worker failed during shutdown");
        }
    }
    if let Err(e) = resolver_task.await {
        error!(error = %e, "token resolver panicked");
    }

    if let Err(e) = &outcome {
        error!(error = %format!("{e:#}"), "chainledger stopped");
    }
    outcome
}

// ─── read-only commands ───────────────────────────────────────────────────────

async fn cmd_head(config: &AppConfig) -> Result<()> {
    let view = open_view(config).await?;
    match view.chain_head().await? {
        Some(head) => println!("{}", serde_json::to_string_pretty(&head)?),
        None => println!("no blocks committed yet"),
    }
    Ok(())
}

async fn cmd_balance(
    config: &AppConfig,
    address: &str,
    token: Option<&str>,
    live: bool,
) -> Result<()> {
    let view = open_view(config).await?;

    let tokens = match token {
        Some(token) => vec![token.to_string()],
        None => view.token_keys(address).await?,
    };
    if token.is_none() {
        let native = view.balance(address, false).await?.unwrap_or(Amount::ZERO);
        println!("native        {native}");
    }
    for token in &tokens {
        let balance = view
            .balance(&token_key(address, token), false)
            .await?
            .unwrap_or(Amount::ZERO);
        let label = match view.token_info(token).await? {
            Some(info) if !info.symbol.is_empty() => info.symbol,
            _ => token.clone(),
        };
        println!("{label:<13} {balance}");
    }

    if live {
        let source = open_source(config)?;
        let remote = source.balance(address, token).await?;
        println!("node balance  {remote}");
        if token.is_none() {
            println!("node nonce    {}", source.nonce(address).await?);
        }
    }
    Ok(())
}

async fn cmd_history(
    config: &AppConfig,
    address: &str,
    token: Option<&str>,
    page: usize,
    page_size: usize,
) -> Result<()> {
    let view = open_view(config).await?;
    let entries = view
        .history_entries(address, token, page_size, page)
        .await?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

async fn cmd_token(config: &AppConfig, address: &str) -> Result<()> {
    let view = open_view(config).await?;
    match view.token_info(address).await? {
        Some(info) => println!("{}", serde_json::to_string_pretty(&info)?),
        None => println!("token {address} not resolved yet"),
    }
    Ok(())
}

async fn cmd_send_raw(config: &AppConfig, tx: &str) -> Result<()> {
    let source = open_source(config)?;
    let hash = source
        .send_raw_transaction(tx)
        .await
        .context("broadcasting transaction")?;
    println!("{hash}");
    Ok(())
}

async fn cmd_info(config: &AppConfig, probe: bool) -> Result<()> {
    println!("chainledger v{}", env!("CARGO_PKG_VERSION"));
    println!("{}", serde_json::to_string_pretty(config)?);
    if probe {
        let source = open_source(config)?;
        let started = std::time::Instant::now();
        let gas_price = source.gas_price().await.context("probing node")?;
        println!(
            "node {} answered in {}ms, gas price {gas_price}",
            config.node.rpc_url,
            started.elapsed().as_millis()
        );
    }
    Ok(())
}
