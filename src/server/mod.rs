pub mod admin;
pub mod bootstrap;
pub mod connection;
pub mod runtime;

pub use bootstrap::{run, BootstrapArgs};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::filter::FilterConfig;
use crate::metrics::Metrics;
use crate::upstream::ClusterManager;

/// Shared state handed to the proxy and admin servers.
#[derive(Clone)]
pub struct ProxyState {
    pub filter: Arc<FilterConfig>,
    pub clusters: Arc<ClusterManager>,
    pub metrics: Metrics,
    pub started: Instant,
}

/// Run the proxy listener with graceful shutdown support.
///
/// When `shutdown` is notified the server stops accepting new connections
/// and waits up to `DRAIN_TIMEOUT` for in-flight connections to finish.
pub async fn run_proxy_server(
    listen: &str,
    state: ProxyState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: proxy listening, addr={}", addr);

    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: proxy: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                continue;
            }
        };

        let stats = &state.filter.stats;
        stats.downstream_cx_total.increment(1);
        stats.downstream_cx_active.increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let filter = state.filter.clone();
        let clusters = state.clusters.clone();
        let active_conns = active_conns.clone();

        tokio::spawn(async move {
            connection::serve_connection(stream, filter.clone(), clusters).await;
            filter.stats.downstream_cx_active.decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!("server: proxy: connection closed, peer={}", peer_addr);
        });
    }

    // Drain phase: wait for in-flight connections to finish (or time out).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: proxy: waiting for {} active connections to drain", active);
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => info!(
                "server: proxy: drain timeout ({}s), {} connections still active",
                DRAIN_TIMEOUT.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// Run the admin server for health, readiness, metrics and topology
/// introspection.
pub async fn run_admin_server(listen: &str, state: ProxyState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
