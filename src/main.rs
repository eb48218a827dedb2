mod commands;
mod config;
mod error;
mod gate;
mod keys;
mod object;
mod replica;
mod resp;
mod server;
mod store;
mod synclog;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info};

use crate::resp::WireLimits;
use crate::server::{ServerLimits, Shared};
use crate::store::{RocksStore, StoreAdapter};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env();

    let metrics_addr: SocketAddr = config
        .metrics_listen_addr()
        .parse()
        .expect("invalid metrics listen address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("failed to install Prometheus exporter");

    metrics::describe_histogram!(
        "shale_command_duration_seconds",
        "Command processing latency in seconds"
    );
    metrics::describe_gauge!("shale_connected_slaves", "Live slave sync sessions");
    metrics::describe_gauge!("shale_synclog_min_seq", "Oldest retained sync log sequence");
    metrics::describe_gauge!("shale_synclog_max_seq", "Newest sync log sequence");
    metrics::describe_gauge!(
        "shale_keys_total",
        "Logical keys created this run minus keys dropped, per kind"
    );

    let store = match RocksStore::open(Path::new(&config.data_dir)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, data_dir = %config.data_dir, "failed to open store");
            return;
        }
    };
    let shared = match Shared::new(
        Arc::clone(&store) as Arc<dyn StoreAdapter>,
        config.sync_log_cap,
        config.data_dir.clone(),
    ) {
        Ok(shared) => shared,
        Err(e) => {
            error!(error = %e, "failed to recover sync log state");
            return;
        }
    };
    let limits = ServerLimits {
        wire: WireLimits::default(),
    };

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await.expect("failed to bind");
    info!(addr = %addr, data_dir = %config.data_dir, "shale listening");

    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    loop {
        #[cfg(unix)]
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(server::handle_connection(stream, Arc::clone(&shared), limits));
                    }
                    Err(e) => error!(?e, "accept error"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
        }

        #[cfg(not(unix))]
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(server::handle_connection(stream, Arc::clone(&shared), limits));
                    }
                    Err(e) => error!(?e, "accept error"),
                }
            }
            _ = signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    match store.flush() {
        Ok(()) => info!("store flushed"),
        Err(e) => error!(error = %e, "failed to flush store on shutdown"),
    }
}
