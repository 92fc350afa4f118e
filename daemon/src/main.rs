use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::sleep;

use hydrascan_common::{network::Network, token::load_tokens};
use hydrascan_daemon::{
    config::{Command, Config, FUND_BATCH_SIZE, REVALIDATE_BATCH_SIZE},
    funds::FundUpdater,
    prices::PriceCache,
    revalidator::{RevalidateMode, Revalidator},
    rpc::EndpointRegistry,
    scanner::Scanner,
    scheduler::RateLimiter,
    storage::Store,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    let timeout_seconds = config.timeout_seconds;

    let outcome = if timeout_seconds > 0 {
        tokio::select! {
            result = run(config) => result,
            _ = sleep(Duration::from_secs(timeout_seconds)) => {
                Err(anyhow!("run exceeded the {}s timeout", timeout_seconds))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                Ok(())
            }
        }
    } else {
        tokio::select! {
            result = run(config) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                Ok(())
            }
        }
    };

    match outcome {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            error!("{:#}", error);
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    if let Some(address) = &config.metrics_bind_address {
        let listener: std::net::SocketAddr = address
            .parse()
            .with_context(|| format!("invalid metrics bind address '{}'", address))?;
        PrometheusBuilder::new()
            .with_http_listener(listener)
            .install()
            .context("cannot start the metrics exporter")?;
        info!("metrics exporter listening on {}", address);
    }

    let networks = config.selected_networks()?;
    info!(
        "hydrascan {} starting for {} networks",
        hydrascan_common::config::VERSION,
        networks.len()
    );

    Store::ensure_database(&config.database)
        .await
        .context("database existence check failed")?;
    let store = Arc::new(
        Store::connect(&config.database)
            .await
            .context("cannot connect to the database")?,
    );
    store.init_schema().await.context("schema bootstrap failed")?;

    let endpoints = Arc::new(EndpointRegistry::default());
    let limiter = RateLimiter::with_defaults();

    let command = config.command.clone().unwrap_or(Command::Scan);
    match command {
        Command::Scan => scan(&config, networks, store, endpoints, limiter).await,
        Command::UpdateFunds => update_funds(&config, networks, store, endpoints, limiter).await,
        Command::Revalidate { recent } => {
            let mode = if recent {
                RevalidateMode::Recent { days: config.recent_days }
            } else {
                RevalidateMode::Standard
            };
            revalidate(&config, networks, store, endpoints, limiter, mode).await
        }
        Command::RefreshPrices { file } => {
            let prices = hydrascan_daemon::prices::read_price_file(Path::new(&file))?;
            let count = prices.len();
            hydrascan_daemon::prices::refresh_prices(&store, prices).await?;
            info!("refreshed {} symbol prices from {}", count, file);
            Ok(())
        }
    }
}

// All networks in parallel; one failing network is reported but does
// not abort the others
async fn scan(
    config: &Config,
    networks: Vec<Network>,
    store: Arc<Store>,
    endpoints: Arc<EndpointRegistry>,
    limiter: Arc<RateLimiter>,
) -> Result<()> {
    let mut handles = Vec::with_capacity(networks.len());
    for network in networks {
        let store = Arc::clone(&store);
        let endpoints = Arc::clone(&endpoints);
        let limiter = Arc::clone(&limiter);
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let scanner = Scanner::bootstrap(network, store, endpoints, limiter, &config)
                .await
                .with_context(|| format!("{}: scanner bootstrap failed", network))?;
            scanner
                .run_once()
                .await
                .with_context(|| format!("{}: scan cycle failed", network))
        }));
    }
    join_network_tasks(handles).await
}

async fn update_funds(
    config: &Config,
    networks: Vec<Network>,
    store: Arc<Store>,
    endpoints: Arc<EndpointRegistry>,
    limiter: Arc<RateLimiter>,
) -> Result<()> {
    let prices = PriceCache::load(&store).await?;
    if prices.is_empty() {
        warn!("symbol_prices is empty; only zero funds can be computed");
    }
    let update_delay = config.fund_update_delay_secs();

    let mut handles = Vec::with_capacity(networks.len());
    for network in networks {
        let store = Arc::clone(&store);
        let endpoints = Arc::clone(&endpoints);
        let limiter = Arc::clone(&limiter);
        let config = config.clone();
        let prices = prices.clone();
        handles.push(tokio::spawn(async move {
            let scanner =
                Scanner::bootstrap(network, Arc::clone(&store), endpoints, limiter, &config)
                    .await
                    .with_context(|| format!("{}: bootstrap failed", network))?;
            let tokens = load_tokens(Path::new(&config.tokens_dir), network)
                .with_context(|| format!("{}: token config", network))?;
            let updater = FundUpdater::new(
                network,
                scanner.reader(),
                store,
                tokens,
                update_delay,
                FUND_BATCH_SIZE as i64,
            );
            // drain the stale backlog batch by batch
            while updater.run_once(&prices).await? > 0 {}
            Ok(Default::default())
        }));
    }
    join_network_tasks(handles).await
}

async fn revalidate(
    config: &Config,
    networks: Vec<Network>,
    store: Arc<Store>,
    endpoints: Arc<EndpointRegistry>,
    limiter: Arc<RateLimiter>,
    mode: RevalidateMode,
) -> Result<()> {
    let mut handles = Vec::with_capacity(networks.len());
    for network in networks {
        let store = Arc::clone(&store);
        let endpoints = Arc::clone(&endpoints);
        let limiter = Arc::clone(&limiter);
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let scanner =
                Scanner::bootstrap(network, Arc::clone(&store), endpoints, limiter, &config)
                    .await
                    .with_context(|| format!("{}: bootstrap failed", network))?;
            let revalidator = Revalidator::new(
                network,
                store,
                scanner.reader(),
                scanner.deployment_resolver(),
                scanner.name_resolver(),
                REVALIDATE_BATCH_SIZE as i64,
            );
            let repaired = revalidator.run(mode).await?;
            info!("{}: revalidation pass repaired {} records", network, repaired);
            Ok(Default::default())
        }));
    }
    join_network_tasks(handles).await
}

// Wait for every per-network task; fail the run only when no network
// succeeded
async fn join_network_tasks(
    handles: Vec<tokio::task::JoinHandle<Result<hydrascan_daemon::scanner::ScanStats>>>,
) -> Result<()> {
    let total = handles.len();
    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                failures += 1;
                error!("{:#}", error);
            }
            Err(join_error) => {
                failures += 1;
                error!("network task panicked: {}", join_error);
            }
        }
    }
    if failures == total && total > 0 {
        return Err(anyhow!("every network failed"));
    }
    if failures > 0 {
        warn!("{} of {} networks failed this run", failures, total);
    }
    Ok(())
}
