//! 'main' for the Lattice pool node process
//!
//! Runs a block pool over an in-memory ledger, fed by simulated peers
//! and a local producer, and reports how the two ledgers converge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use config::{Config, Environment, File};
use lattice_common::ChainReader;
use lattice_module_block_pool::{BlockPool, Collaborators, PoolConfig};
use lattice_module_ledger_store::{LedgerConfig, LedgerVerifier, MemoryLedger};
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::SpanExporter;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter, fmt, EnvFilter, Registry};

mod network;
mod producer;

use network::{RemoteChains, SimulatedNetwork};
use producer::Producer;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Debug, clap::Parser)]
#[command(name = "pool-node")]
#[command(about = "Lattice block pool against simulated peers")]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["pool_node.toml".to_string()])]
    config: Vec<String>,

    /// Remote accounts to simulate
    #[arg(long, default_value = "4")]
    accounts: usize,

    /// Blocks on each remote account chain
    #[arg(long, default_value = "20")]
    blocks: u64,

    /// Share of gossiped blocks lost on the way
    #[arg(long, default_value = "0.1")]
    loss: f64,

    /// Run time before shutting down
    #[arg(long, default_value = "10")]
    duration_secs: u64,
}

/// The `name` table of `config` as a config of its own. Environment
/// overrides arrive with underscores, so both spellings are merged.
fn section(config: &Config, name: &str) -> Result<Config> {
    let mut builder = Config::builder();
    for table_name in [name.to_string(), name.replace('-', "_")] {
        if let Ok(table) = config.get_table(&table_name) {
            for (key, value) in table {
                builder = builder.set_override(key.replace('_', "-"), value)?;
            }
        }
    }
    Ok(builder.build()?)
}

fn init_tracing() -> Result<()> {
    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());

    // Only turn on tracing if some OTEL environment variables exist
    if std::env::vars().any(|(name, _)| name.starts_with("OTEL_")) {
        let otel_exporter = SpanExporter::builder().with_tonic().build()?;
        let otel_tracer = SdkTracerProvider::builder()
            .with_batch_exporter(otel_exporter)
            .build()
            .tracer("lattice-pool-node");
        let otel_layer = OpenTelemetryLayer::new(otel_tracer)
            .with_filter(
                EnvFilter::from_default_env().add_directive(filter::LevelFilter::INFO.into()),
            )
            .with_filter(filter::filter_fn(|meta| meta.is_span()));
        Registry::default().with(fmt_layer).with(otel_layer).init();
    } else {
        Registry::default().with(fmt_layer).init();
    }
    Ok(())
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;
    info!("Lattice pool node");

    // Read the config
    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file).required(false));
    }
    let config = builder
        .add_source(Environment::with_prefix("LATTICE").separator("__"))
        .build()?;
    let pool_config = PoolConfig::try_load(&section(&config, "block-pool")?)?;
    let ledger_config = LedgerConfig::try_load(&section(&config, "ledger-store")?)?;

    // Wire the pool to its collaborators
    let ledger = Arc::new(MemoryLedger::new());
    let (network, outbound) = SimulatedNetwork::new();
    let network = Arc::new(network);
    let pool = Arc::new(BlockPool::new(
        pool_config,
        Collaborators {
            reader: ledger.clone(),
            writer: ledger.clone(),
            verifier: Arc::new(LedgerVerifier::new(ledger.clone(), &ledger_config)),
            fetcher: network.clone(),
            broadcaster: network,
        },
    ));

    let own = producer::own_address();
    let remote = Arc::new(RemoteChains::generate(args.accounts, args.blocks, own)?);
    let (shutdown, watcher) = watch::channel(false);

    pool.start()?;
    let tasks = vec![
        tokio::spawn(
            network::serve(pool.clone(), remote.clone(), outbound, watcher.clone())
                .instrument(info_span!("peers")),
        ),
        tokio::spawn(
            network::gossip(
                pool.clone(),
                remote.clone(),
                args.loss,
                Duration::from_millis(5),
                watcher.clone(),
            )
            .instrument(info_span!("gossip")),
        ),
        tokio::spawn(
            Producer {
                pool: pool.clone(),
                ledger: ledger.clone(),
                own,
                payees: remote.addresses.clone(),
            }
            .run(Duration::from_millis(250), watcher.clone())
            .instrument(info_span!("producer")),
        ),
    ];

    // Report until told to stop
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs));
    tokio::pin!(deadline);
    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                info!(pool = %serde_json::to_string(&pool.info())?, "Pool state");
            }
        }
    }

    let _ = shutdown.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            warn!(%err, "Task ended abnormally");
        }
    }
    if let Err(err) = pool.stop().await {
        warn!(%err, "Block pool stopped with an error");
    }

    let converged = remote
        .addresses
        .iter()
        .filter(|a| ledger.account_head(a) == remote.ledger.account_head(a))
        .count();
    info!(
        converged,
        accounts = remote.addresses.len(),
        ledger = %serde_json::to_string(&ledger.stats())?,
        "Exiting"
    );

    Ok(())
}
