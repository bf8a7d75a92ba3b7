use anyhow::Context;
use clap::{Parser, Subcommand};
use okxbot::config::BotConfig;
use okxbot::exchange::{open_position, ClientPool, Exchange, PooledExchange};
use okxbot::monitor::Monitor;
use okxbot::notify::Notifier;
use okxbot::persistence::PositionStore;
use okxbot::strategy::{detect_signal, BollingerBreakout, EntryPlanner};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "okxbot")]
#[command(about = "Trigger-order execution bot for OKX perpetual swaps", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config/okxbot.toml")]
    config: PathBuf,

    /// Check the signal on the latest closed bar; no orders are sent
    #[arg(long)]
    dry_run: bool,

    /// Print the persisted position and the account summary
    #[arg(long)]
    status: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the monitor (default)
    Run,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    setup_logging();
    let cli = Cli::parse();

    let config = match BotConfig::load_with_credentials(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, path = %cli.config.display(), "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.execution.workers.max(2))
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "cannot start runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        if cli.status {
            status(config).await
        } else if cli.dry_run {
            dry_run(config).await
        } else {
            match cli.command.unwrap_or(Commands::Run) {
                Commands::Run => run(config).await,
            }
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("okxbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_exchange(config: &BotConfig) -> Arc<dyn Exchange> {
    let pool = ClientPool::new(config.exchange.clone(), config.credentials.clone());
    Arc::new(PooledExchange::new(Arc::new(pool)))
}

async fn run(config: BotConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    tracing::info!(
        inst_id = %config.exchange.inst_id,
        simulated = config.exchange.simulated,
        state_dir = %config.state_dir.display(),
        "🚀 okxbot starting"
    );

    let exchange = build_exchange(&config);
    let notifier = Arc::new(Notifier::from_settings(&config.notify));
    let planner = Box::new(BollingerBreakout::new(config.strategy.clone()));
    let monitor = Monitor::new(config.clone(), exchange, notifier, planner);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            let _ = stop_tx.send(true);
        }
    });

    monitor.run(stop_rx).await.context("monitor stopped")?;
    tracing::info!("👋 okxbot stopped");
    Ok(())
}

async fn status(config: BotConfig) -> anyhow::Result<()> {
    let store = PositionStore::new(config.state_dir.clone());
    match store.load_position() {
        Some(p) => println!(
            "Tracked position: {} {} @ {:.2}  SL {:.2} ({})  TP {:.2} ({})  since {}",
            p.direction,
            p.size,
            p.entry_price,
            p.sl_price,
            p.sl_order_id,
            p.tp_price,
            p.tp_order_id.as_deref().unwrap_or("-"),
            p.entry_time.format("%Y-%m-%d %H:%M UTC")
        ),
        None => println!("Tracked position: none"),
    }
    let pending = store.load_pending();
    if !pending.is_empty() {
        for (direction, algo_id) in pending.entries() {
            println!("Pending trigger: {} {}", direction, algo_id);
        }
    }
    if let Some(danger) = store.load_danger() {
        println!(
            "⚠️  DANGER record: {} {} {} at {} ({})",
            danger.inst_id, danger.direction, danger.size, danger.time, danger.reason
        );
    }
    println!("Trades recorded: {}", store.load_trades().len());

    let exchange = build_exchange(&config);
    let balance = exchange.get_balance().await.context("balance query failed")?;
    println!(
        "Equity: {:.2} USDT (available {:.2})",
        balance.total_equity, balance.usdt_available
    );
    let positions = exchange.get_positions().await.context("position query failed")?;
    match open_position(&positions) {
        Some(p) => println!(
            "Exchange position: {} {} @ {:.2}",
            p.direction(),
            p.size(),
            p.avg_px
        ),
        None => println!("Exchange position: flat"),
    }
    Ok(())
}

async fn dry_run(config: BotConfig) -> anyhow::Result<()> {
    let exchange = build_exchange(&config);
    let candles = exchange
        .get_candles(&config.exchange.bar, config.strategy.initial_candles)
        .await
        .context("candle fetch failed")?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let Some(last) = candles.last() else {
        anyhow::bail!("no closed candles returned");
    };
    println!(
        "{} {}: {} closed bars, last close {:.2} at {}",
        config.exchange.inst_id,
        config.exchange.bar,
        closes.len(),
        last.close,
        last.timestamp
    );

    match detect_signal(&closes, closes.len() - 1, &config.strategy) {
        Some(direction) => println!("Breakout on last bar: {}", direction),
        None => println!("Breakout on last bar: none"),
    }

    let planner = BollingerBreakout::new(config.strategy.clone());
    match planner.plan(&closes) {
        Some(plan) => println!(
            "Would place {} trigger @ {:.2} -> limit {:.2}",
            plan.direction, plan.trigger_px, plan.order_px
        ),
        None => println!("Would place no trigger"),
    }
    Ok(())
}
