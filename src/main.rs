use clap::{Parser, Subcommand};
use std::sync::Arc;

use orderbot::config::Config;
use orderbot::exchange::{BinanceFutures, PaperExchange, SharedGateway};
use orderbot::strategy::{GridParams, OcoParams, TwapParams};
use orderbot::{GridSpacing, Side, Supervisor};

#[derive(Parser)]
#[command(name = "orderbot", about = "Advanced order execution engine (OCO / TWAP / grid)")]
struct Cli {
    /// Run against the simulated in-memory exchange instead of Binance
    #[arg(long, global = true)]
    paper: bool,

    /// Starting mark price for paper mode
    #[arg(long, global = true, default_value_t = 50000.0)]
    mark: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Place a linked take-profit / stop-loss pair and monitor it
    Oco {
        symbol: String,
        /// Exit side: buy or sell
        side: String,
        quantity: f64,
        take_profit: f64,
        stop_loss: f64,
    },
    /// Slice a parent order into timed child orders
    Twap {
        symbol: String,
        side: String,
        quantity: f64,
        /// Execution horizon in seconds
        horizon: u64,
        slices: usize,
        /// Use passively pegged limit slices instead of market orders
        #[arg(long)]
        limit: bool,
    },
    /// Run a ladder of resting limit orders between two bounds
    Grid {
        symbol: String,
        upper: f64,
        lower: f64,
        levels: usize,
        /// Total quote-currency investment, split equally across levels
        investment: f64,
        /// Geometric (constant-ratio) spacing instead of arithmetic
        #[arg(long)]
        geometric: bool,
    },
    /// Print the current price for a symbol
    Price { symbol: String },
}

#[tokio::main]
async fn main() -> orderbot::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = Config::from_env();

    let symbol = match &cli.command {
        Command::Oco { symbol, .. }
        | Command::Twap { symbol, .. }
        | Command::Grid { symbol, .. }
        | Command::Price { symbol } => symbol.to_uppercase(),
    };

    let gateway: SharedGateway = if cli.paper {
        tracing::info!("paper mode: {} seeded at {}", symbol, cli.mark);
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_price(&symbol, cli.mark);
        exchange
    } else {
        if !config.has_credentials() {
            return Err("BINANCE_API_KEY / BINANCE_API_SECRET not set (or pass --paper)".into());
        }
        Arc::new(BinanceFutures::new(&config))
    };

    if let Command::Price { .. } = &cli.command {
        let price = gateway.current_price(&symbol).await?;
        println!("{} {}", symbol, price);
        return Ok(());
    }

    let mut supervisor = Supervisor::new(gateway.clone(), config.tick_interval_secs);

    let id = match cli.command {
        Command::Oco {
            side,
            quantity,
            take_profit,
            stop_loss,
            ..
        } => {
            supervisor
                .create_oco(OcoParams {
                    symbol: symbol.clone(),
                    side: parse_side(&side)?,
                    quantity,
                    take_profit_price: take_profit,
                    stop_loss_price: stop_loss,
                })
                .await?
        }
        Command::Twap {
            side,
            quantity,
            horizon,
            slices,
            limit,
            ..
        } => {
            supervisor
                .create_twap(TwapParams {
                    symbol: symbol.clone(),
                    side: parse_side(&side)?,
                    total_quantity: quantity,
                    horizon_secs: horizon,
                    slice_count: slices,
                    limit_mode: limit,
                    limit_offset: config.limit_offset,
                    slippage_tolerance: config.slippage_tolerance,
                    jitter: config.twap_jitter,
                })
                .await?
        }
        Command::Grid {
            upper,
            lower,
            levels,
            investment,
            geometric,
            ..
        } => {
            supervisor
                .create_grid(GridParams {
                    symbol: symbol.clone(),
                    upper_bound: upper,
                    lower_bound: lower,
                    level_count: levels,
                    investment,
                    spacing: if geometric {
                        GridSpacing::Geometric
                    } else {
                        GridSpacing::Arithmetic
                    },
                })
                .await?
        }
        Command::Price { .. } => unreachable!(),
    };

    tracing::info!("strategy {} created, press Ctrl+C to cancel", id);
    supervisor.run_until_idle().await?;

    if let Some(snapshot) = supervisor.status(id) {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    // Everything terminal by now; anything still on the book is a leak
    match gateway.open_orders(&symbol).await {
        Ok(open) if !open.is_empty() => {
            tracing::warn!("{} orders still open on {} after shutdown", open.len(), symbol);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("could not verify open orders on exit: {}", e),
    }

    Ok(())
}

fn parse_side(s: &str) -> orderbot::Result<Side> {
    match s.to_ascii_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        other => Err(format!("invalid side '{}': expected buy or sell", other).into()),
    }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orderbot=info".into()),
        )
        .init();
}
