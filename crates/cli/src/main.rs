use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use perppilot_agents::llm::OpenAiCompatClient;
use perppilot_core::config_loader::ConfigLoader;
use perppilot_exchange::binance::BinanceFuturesTrader;
use perppilot_exchange::mock::MockTrader;
use perppilot_exchange::Trader;
use perppilot_market_data::{BinanceMarketClient, MarketDataService};
use perppilot_trader::auto_trader::{AutoTrader, AutoTraderDeps};
use perppilot_trader::price_paths::MarketPricePaths;
use perppilot_trader::StaticUniverse;

#[derive(Parser)]
#[command(name = "perppilot", about = "LLM-driven perp futures trading agent")]
struct Cli {
    /// Configuration profile overlay (config/Config.<profile>.toml).
    #[arg(long)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trading loop.
    Run,
    /// Print the resolved configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = match &cli.profile {
        Some(profile) => ConfigLoader::load_with_profile(profile)?,
        None => ConfigLoader::load()?,
    };

    match cli.command {
        Command::CheckConfig => {
            println!(
                "trader id: {} | venue: {} | scan interval: {}s | kline: {} | gate: {:?}",
                config.trader.id,
                config.exchange.venue,
                config.trader.scan_interval_secs,
                config.trader.kline_interval,
                config.gate.policy,
            );
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: perppilot_core::AppConfig) -> Result<()> {
    let trader: Arc<dyn Trader> = match config.exchange.venue.as_str() {
        "binance" => {
            info!("live Binance futures venue");
            Arc::new(BinanceFuturesTrader::new(
                config.exchange.api_key.clone(),
                config.exchange.api_secret.clone(),
                config.exchange.testnet,
            ))
        }
        "mock" => {
            info!("paper venue (mock trader)");
            Arc::new(MockTrader::new(
                Decimal::try_from(config.trader.initial_balance).unwrap_or(Decimal::ONE_THOUSAND),
            ))
        }
        other => anyhow::bail!("unsupported venue: {other}"),
    };

    let market = Arc::new(MarketDataService::new(
        Arc::new(BinanceMarketClient::new()),
        config.trader.kline_interval.clone(),
    ));
    let llm = Arc::new(OpenAiCompatClient::new(&config.llm));
    let universe = Arc::new(StaticUniverse::new(config.trader.candidate_symbols.clone()));
    let price_paths = Arc::new(MarketPricePaths::new(Arc::clone(&market)));

    let mut auto_trader = AutoTrader::new(AutoTraderDeps {
        config,
        trader,
        llm,
        snapshots: market,
        universe,
        price_paths: Some(price_paths),
    })
    .await?;

    auto_trader.run().await
}
