//! CLI entry point.

// Use mimalloc as global allocator for better p99 latency.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use proxy_engine::{Config, Engine};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "proxy-engine")]
#[command(author = "Tsang")]
#[command(about = "Pluggable asynchronous TCP/UDP proxy engine")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Validate configuration and exit without starting any listener
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    // Build optimized tokio runtime for low-latency proxy workloads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .max_blocking_threads(32)
        .enable_all()
        // Reduce I/O polling overhead - check for new events every 61 ticks.
        .event_interval(61)
        // Reduce cross-thread work stealing frequency for better cache locality.
        .global_queue_interval(31)
        .thread_name("proxy-engine-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxy_engine=info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("loading configuration from {}", args.config.display());
    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if args.test {
        info!("configuration is valid");
        return Ok(());
    }

    let engine = Engine::new(config);
    if let Err(e) = engine.run().await {
        error!("engine error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
