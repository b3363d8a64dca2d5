use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use vitalsdb::api::rest::RestApi;
use vitalsdb::config::load_config;
use vitalsdb::events::LoggingPublisher;
use vitalsdb::{AggregationEngine, ObservationService, QueryEngine, StorageEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config(Path::new("config.yaml"))?;

    // RUST_LOG wins over the configured level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        path = %config.storage.path,
        persist = config.storage.persist,
        environment = ?config.environment,
        "starting vitalsdb"
    );

    let storage = Arc::new(StorageEngine::new(&config)?);

    // Periodic snapshots keep the WAL, and startup replay, bounded.
    let flusher = config.storage.flush_interval().map(|period| {
        let storage = Arc::clone(&storage);
        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let storage = Arc::clone(&storage);
                match tokio::task::spawn_blocking(move || storage.flush_all()).await {
                    Ok(Ok(())) => debug!("periodic flush complete"),
                    Ok(Err(e)) => error!(error = %e, "periodic flush failed"),
                    Err(e) => error!(error = %e, "periodic flush task failed"),
                }
            }
        })
    });
    let service = Arc::new(ObservationService::new(
        Arc::clone(&storage),
        Arc::new(LoggingPublisher),
    ));
    let query_engine = Arc::new(QueryEngine::new(Arc::clone(&storage)));
    let aggregation = Arc::new(AggregationEngine::new(Arc::clone(&storage)));
    let api = RestApi::new(service, query_engine, aggregation, config.environment);

    let host: IpAddr = config.api.host.parse()?;
    let addr = SocketAddr::new(host, config.api.port);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (bound, server) = warp::serve(api.routes())
        .try_bind_with_graceful_shutdown(addr, async move {
            shutdown_rx.await.ok();
            info!("shutting down server");
        })?;
    info!(%bound, "listening");

    let server_handle = tokio::spawn(server);

    signal::ctrl_c().await?;
    info!("Ctrl+C received, starting graceful shutdown");
    shutdown_tx.send(()).ok();
    server_handle.await?;
    if let Some(flusher) = flusher {
        flusher.abort();
    }

    info!("flushing observation store to disk");
    if let Err(e) = storage.flush_all() {
        error!(error = %e, "error flushing data");
    }

    info!("server shutdown complete");
    Ok(())
}
