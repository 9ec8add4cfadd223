//! cachegate - a per-client caching reverse proxy
//!
//! sits between a browser and an http origin and provides:
//! - per-client response caching keyed by path and parameters
//! - short ttls for dynamic pages, long ttls for static ones
//! - a background sweep of expired entries
//! - cache management pages and an operator console
//!

use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

mod admin;
mod cache;
mod config;
mod console;
mod fetcher;
mod protocol;
mod server;
mod session;
mod sweeper;
mod util;

use cache::CacheStore;
use config::{Config, Settings};
use console::Console;
use fetcher::OriginFetcher;
use server::AppState;
use session::SessionRegistry;
use util::Result;

fn main() {
    util::setup_logger();

    let config = Config::load();
    let num_workers = num_cpus::get();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_workers)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(serve(config, num_workers));
    // stdin is read on a blocking thread that may still be parked in a read
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Err(e) = result {
        error!("cachegate stopped with error: {}", e);
        std::process::exit(1);
    }
}

async fn serve(config: Config, num_workers: usize) -> Result<()> {
    let settings = Arc::new(Settings::from_config(&config));
    let cache = Arc::new(CacheStore::new());
    let sessions = Arc::new(SessionRegistry::new());
    let fetcher = OriginFetcher::new_or_default(&config.origin_url)?;

    info!("proxying requests to: {}", fetcher.base_url());
    info!(
        "ttls: dynamic {}ms, static {}ms, sweep every {}s",
        settings.dynamic_ttl().as_millis(),
        settings.static_ttl().as_millis(),
        config.cleanup_interval().as_secs()
    );

    let (shutdown_tx, shutdown) = server::shutdown_channel();

    let sweeper = tokio::spawn(sweeper::run(
        Arc::clone(&cache),
        Arc::clone(&settings),
        sweeper::INITIAL_DELAY,
        config.cleanup_interval(),
        shutdown.clone(),
    ));

    let console = Console::new(
        Arc::clone(&settings),
        Arc::clone(&cache),
        Arc::clone(&sessions),
        shutdown_tx,
    );
    tokio::spawn(async move {
        let input = tokio::io::BufReader::new(tokio::io::stdin());
        if let Err(e) = console.run(input, tokio::io::stdout()).await {
            error!("console failed: {}", e);
        }
    });

    let state = Arc::new(AppState {
        settings,
        cache,
        sessions,
        fetcher,
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
    info!(
        "cachegate starting on {} with {} workers",
        config.listen_addr(),
        num_workers
    );

    server::run(listener, state, shutdown).await?;
    if let Err(e) = sweeper.await {
        error!("sweeper task failed: {}", e);
    }
    info!("cachegate stopped");
    Ok(())
}
