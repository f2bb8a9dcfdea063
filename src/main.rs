#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use trpc_proxy::server;

#[derive(Parser)]
#[command(name = "trpc-proxy", about = "Layer-4 proxy for the tRPC wire protocol")]
struct Cli {
    /// Path to the proxy config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (overrides the config file)
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_thread_count();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::run(server::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
        worker_threads,
    }))
}
