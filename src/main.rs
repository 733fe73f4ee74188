use std::sync::Arc;
use std::time::Instant;

use target_indexer::{api, cancel_pair, config, report, rpc::RpcEventSource, StreamConsumer, StreamQuery};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr) // stdout carries the JSON report
        .with_target(false)
        .init();

    info!("Target indexer starting...");

    let cfg = config::load()?;
    info!("  Target: {}", cfg.target_hex());
    info!("  Mode: {:?}", cfg.mode);
    info!("  RPC URL: {}", cfg.rpc_http_url);
    info!("  From block: {}", cfg.from_block);

    let source = RpcEventSource::new(&cfg)?;
    let consumer = StreamConsumer::for_config(&cfg)?;
    let query = StreamQuery::for_config(&cfg);

    // Ctrl-C stops fetching; whatever was applied is still reported
    let (cancel, signal_rx) = cancel_pair();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, stopping stream...");
                cancel.cancel();
            }
        }
    });

    let started = Instant::now();
    let outcome = match consumer.run(&source, &query, signal_rx).await {
        Ok(outcome) => outcome,
        Err(aborted) => {
            error!(
                "Run aborted, discarding partial state ({} batches): {}",
                aborted.partial.stats.batches, aborted.cause
            );
            return Err(aborted.into());
        }
    };
    info!("Script execution time: {:.2?}", started.elapsed());
    if outcome.cancelled {
        warn!("Report covers only blocks before {}", outcome.state.stats.last_block);
    }

    let view = report(&outcome.state, &cfg.thresholds);
    println!("{}", serde_json::to_string_pretty(&view)?);

    if let Some(port) = cfg.port {
        let view = Arc::new(view);
        tokio::select! {
            res = api::serve(port, view) => match res {
                Ok(_) => info!("API exited cleanly"),
                Err(e) => error!("API error: {:?}", e),
            },
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received, stopping...");
            }
        }
    }

    info!("Target indexer stopped.");
    Ok(())
}
