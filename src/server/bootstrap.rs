use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::access_log::{AccessLog, FileAccessLog, TracingAccessLog};
use crate::config::{AccessLogConfig, LogConfig, ProxyConfig};
use crate::filter::stats::FilterStats;
use crate::filter::FilterConfig;
use crate::metrics::Metrics;
use crate::route::{RouteConfigProvider, RouteTable};
use crate::server::{self, ProxyState};
use crate::upstream::health::HealthChecker;
use crate::upstream::ClusterManager;

/// CLI arguments forwarded from `main()`. Addresses given on the command
/// line take precedence over the config file.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
    /// Worker count the runtime was built with; logged here because the
    /// runtime is sized before tracing exists.
    pub worker_threads: usize,
}

/// Proxy lifecycle: load config → build state → spawn health checkers and
/// admin → serve → drain on shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let config = ProxyConfig::load(&args.config_path)?;
    init_tracing(&config.log);
    info!("server: runtime started, worker_threads={}", args.worker_threads);

    let metrics = Metrics::install();
    FilterStats::describe(&config.stat_prefix);

    let listen = args.listen.unwrap_or_else(|| config.listen.clone());
    let admin_listen = args
        .admin_listen
        .unwrap_or_else(|| config.admin_listen.clone());

    let clusters = Arc::new(ClusterManager::new(&config.clusters));

    let table = RouteTable::build(&config.route_config)?;
    info!(
        "route config '{}' loaded, routes={}",
        config.route_config.name,
        table.routes().len()
    );
    let route_provider = Arc::new(RouteConfigProvider::with_table(table, "1"));

    let filter = Arc::new(FilterConfig::new(
        config.stat_prefix.clone(),
        route_provider,
        build_access_logs(&config.access_log)?,
    ));

    let state = ProxyState {
        filter,
        clusters: clusters.clone(),
        metrics,
        started: Instant::now(),
    };

    start_health_checkers(&clusters);

    {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_admin_server(&admin_listen, state).await {
                error!("server: admin server failed: {}", e);
            }
        });
    }

    let shutdown = Arc::new(Notify::new());
    let proxy_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        let state = state.clone();
        async move { server::run_proxy_server(&listen, state, shutdown).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("server: shutdown signal received");
    shutdown.notify_waiters();

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("server: proxy error: {}", e),
        Err(e) => error!("server: proxy task error: {}", e),
    }

    info!("server: shutdown complete");
    Ok(())
}

fn start_health_checkers(clusters: &Arc<ClusterManager>) {
    clusters.for_each(|name, cluster| {
        if let Some(hc) = cluster.config().health_check.clone() {
            info!("health: active checker started, cluster={}", name);
            let checker = Arc::new(HealthChecker::new(cluster.clone(), hc));
            tokio::spawn(checker.run());
        }
    });
}

fn build_access_logs(config: &AccessLogConfig) -> Result<Vec<Arc<dyn AccessLog>>> {
    if !config.enabled {
        return Ok(Vec::new());
    }
    match &config.path {
        Some(path) => Ok(vec![Arc::new(FileAccessLog::new(std::path::Path::new(
            path,
        ))?)]),
        None => Ok(vec![Arc::new(TracingAccessLog)]),
    }
}

fn init_tracing(config: &LogConfig) {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .json(),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false),
            )
            .init();
    }

    std::mem::forget(guard);
}
