//! Zero protocol monitor
//!
//! Follows the protocol block by block through the state store and logs
//! every change, or answers one-off questions about the current state:
//! - CLI arguments and TOML config file support
//! - Structured logging with tracing
//! - Redemption quotes with hints and fee ceiling

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use zero_rust_sdk::{
    init_logging, AddressBook, ClientConfig, Decimal, JsonRpcClient, LogFormat, StoreMode,
    ZeroClient,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser)]
#[command(name = "zero_monitor")]
#[command(version, about = "Zero protocol state monitor", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "zero.toml", env = "ZERO_CONFIG")]
    config: String,

    /// Override the JSON-RPC endpoint
    #[arg(long, env = "ZERO_RPC_URL")]
    rpc_url: Option<String>,

    /// Log filter for stdout (e.g. "info,zero_rust_sdk::store=debug")
    #[arg(long)]
    log_level: Option<String>,

    /// Output format (pretty, json, compact)
    #[arg(long)]
    log_format: Option<String>,

    /// Directory for rolling log files
    #[arg(long)]
    log_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a sample config file
    GenerateConfig {
        /// Output file path
        #[arg(short, long, default_value = "zero.toml")]
        output: String,
    },
    /// Validate config without running
    ValidateConfig,
    /// Show price, totals and fees once
    Status,
    /// Size a redemption and print its hints and fee ceiling
    QuoteRedemption {
        /// ZUSD to redeem
        amount: String,
        /// Maximum redemption rate, defaults to the quoted rate plus slippage
        #[arg(long)]
        max_rate: Option<String>,
    },
    /// Follow the store and log changes (default)
    Run,
}

// ============================================================================
// Configuration
// ============================================================================

fn load_config(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = ClientConfig::from_file(&cli.config)?;

    if let Some(url) = &cli.rpc_url {
        config.rpc_url = url.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.stdout_format = parse_log_format(format)?;
    }
    if let Some(dir) = &cli.log_dir {
        config.logging.log_dir = Some(dir.into());
    }

    config.validate()?;
    Ok(config)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value.to_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        "compact" => Ok(LogFormat::Compact),
        other => Err(format!("Unknown log format '{other}'. Use: pretty, json, compact")),
    }
}

fn generate_sample_config(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut sample = ClientConfig::new("https://public-node.rsk.co", AddressBook::default());
    sample.store = StoreMode::BlockPolled {
        poll_interval_ms: 30_000,
    };
    let content = sample.to_toml_string()?;

    let with_comments = format!(
        r#"# Zero protocol monitor configuration
# See: cargo run --bin zero_monitor -- --help
#
# Fill in every contract address under [addresses] before running.
# Set user_address to follow one account's position and balances.

{content}"#
    );

    std::fs::write(path, with_comments)?;
    println!("Sample config written to {path}");
    Ok(())
}

fn format_timestamp(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|time| time.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}

// ============================================================================
// Commands
// ============================================================================

async fn show_status(config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = ZeroClient::connect(&ClientConfig {
        store: StoreMode::None,
        ..config.clone()
    })?;
    let reader = client.client().reader();

    let (price, total, fees, positions) = tokio::try_join!(
        reader.price(None),
        reader.total(None),
        reader.fees(None),
        reader.number_of_positions(None),
    )?;

    println!("Price:              {price}");
    println!("Open positions:     {positions}");
    println!("Total collateral:   {}", total.collateral);
    println!("Total debt:         {}", total.debt);
    println!("Total ratio:        {}", total.collateral_ratio(price));
    println!("Recovery mode:      {}", fees.is_recovery_mode());
    println!("Borrowing rate:     {}", fees.borrowing_rate(None));
    println!("Redemption rate:    {}", fees.redemption_rate(Decimal::ZERO, None));
    println!("Fees evaluated at:  {}", format_timestamp(fees.block_timestamp()));

    if config.user_address.is_some() {
        let position = reader.position(None, None).await?;
        println!("Position status:    {:?}", position.status);
        println!("Position:           {} / {}", position.position.collateral, position.position.debt);
    }

    Ok(())
}

async fn quote_redemption(
    config: &ClientConfig,
    amount: &str,
    max_rate: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let amount: Decimal = amount.parse()?;
    let max_rate = max_rate.map(str::parse::<Decimal>).transpose()?;

    let client = ZeroClient::connect(&ClientConfig {
        store: StoreMode::None,
        ..config.clone()
    })?;
    let redemption = client.client().prepare_redemption(amount, max_rate).await?;

    println!("Attempted amount:   {}", redemption.attempted_amount);
    println!("Redeemable amount:  {}", redemption.truncated_amount);
    if redemption.is_truncated {
        println!("                    (truncated, increase to redeem more)");
    }
    println!("Max redemption fee: {}", redemption.max_redemption_rate);
    println!("First hint:         {}", redemption.hints.first_redemption_hint);
    println!(
        "Partial hints:      {} / {}",
        redemption.hints.partial_upper_hint, redemption.hints.partial_lower_hint
    );
    println!("Partial hint NICR:  {}", redemption.hints.partial_nominal_ratio);

    if let Some(redeemer) = config.user_address {
        let call = client.client().populator().redemption(&redemption);
        let rpc = JsonRpcClient::new(reqwest::Client::new(), config.rpc_url.clone());
        match call.estimate_gas(&rpc, redeemer).await {
            Ok(gas) => println!("Gas limit:          {gas}"),
            Err(err) => warn!(%redeemer, error = %err, "Gas estimate failed"),
        }
    }
    Ok(())
}

async fn run(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = ZeroClient::connect(&config)?;
    let Some(store) = client.store().cloned() else {
        return Err("store mode 'none' has nothing to follow; set [store] mode in the config".into());
    };

    let mut changes = store.on_change();
    let handle = store.start().await?;
    info!(config_store = ?config.store, "Store started, waiting for first snapshot");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    let state = &change.state;
                    if change.is_load() {
                        info!(
                            block = ?state.block_tag(),
                            price = %state.price(),
                            positions = state.base.number_of_positions,
                            "Store loaded"
                        );
                        continue;
                    }
                    info!(
                        block = ?state.block_tag(),
                        time = %format_timestamp(state.extra.block_timestamp),
                        changed = ?change.changed,
                        price = %state.price(),
                        borrowing_rate = %state.derived.borrowing_rate,
                        redemption_rate = %state.derived.redemption_rate,
                        "Store updated"
                    );
                    if state.derived.have_undercollateralized_positions {
                        warn!(block = ?state.block_tag(), "Undercollateralized positions present");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Monitor fell behind the store");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    handle.stop().await;
    info!("Store stopped");
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Commands::GenerateConfig { output }) = &cli.command {
        return generate_sample_config(output);
    }

    let config = load_config(&cli)?;
    let _guards = init_logging(&config.logging, cli.log_level.as_deref())?;

    match &cli.command {
        Some(Commands::ValidateConfig) => {
            println!("Configuration is valid:\n{config:#?}");
            Ok(())
        }
        Some(Commands::Status) => show_status(&config).await,
        Some(Commands::QuoteRedemption { amount, max_rate }) => {
            quote_redemption(&config, amount, max_rate.as_deref()).await
        }
        Some(Commands::GenerateConfig { .. }) => Ok(()),
        Some(Commands::Run) | None => run(config).await,
    }
}
