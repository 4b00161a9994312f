use std::io::Result;
use std::sync::Arc;

use clap::Parser;
use env_logger::Builder;
use log::{debug, info, LevelFilter};
use tokio::runtime::Builder as RuntimeBuilder;

use bgplsd::{BgpConfig, Rfc7752Decoder, SessionManager};

#[derive(Parser, Debug)]
#[clap(name = "bgplsd", version)]
/// BGP Link-State speaker
pub struct Args {
    /// Path to BGP-LS speaker config.toml
    config_path: String,
    /// Worker threads for session I/O (defaults to one per core)
    #[clap(long)]
    io_threads: Option<usize>,
    /// Show debug logs (additive for trace logs)
    #[clap(short, parse(from_occurrences))]
    verbose: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let (bgplsd_level, other_level) = match args.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgplsd"), bgplsd_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", bgplsd_level, other_level);

    let config = Arc::new(BgpConfig::from_file(&args.config_path)?);
    debug!(
        "Found {} peers in {}",
        config.peers().len(),
        args.config_path
    );

    let mut runtime = RuntimeBuilder::new_multi_thread();
    runtime.enable_all();
    if let Some(threads) = args.io_threads {
        runtime.worker_threads(threads.max(1));
    }
    runtime.build()?.block_on(serve(config))
}

async fn serve(config: Arc<BgpConfig>) -> Result<()> {
    let manager = SessionManager::new(config, Arc::new(Rfc7752Decoder));
    manager.start().await?;
    info!("{}", manager.system_stats());

    tokio::signal::ctrl_c().await?;
    info!("Stopping bgplsd...");
    manager.stop().await;
    info!("{}", manager.system_stats());
    Ok(())
}
