pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl ProxyConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. A missing file yields built-in defaults so the
    /// proxy can start with zero configuration for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            ProxyConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variable overrides for infrastructure settings. Routing
    /// and cluster topology come only from the file (or a runtime update
    /// through the provider).
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRPC_PROXY_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("TRPC_PROXY_ADMIN_LISTEN") {
            self.admin_listen = v;
        }
        if let Ok(v) = std::env::var("TRPC_PROXY_STAT_PREFIX") {
            self.stat_prefix = v;
        }
        if let Ok(v) = std::env::var("TRPC_PROXY_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("TRPC_PROXY_LOG_FORMAT") {
            self.log.format = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stat_prefix.is_empty() {
            anyhow::bail!("stat_prefix cannot be empty");
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                anyhow::bail!("cluster name cannot be empty");
            }
            if !names.insert(cluster.name.as_str()) {
                anyhow::bail!("duplicate cluster '{}'", cluster.name);
            }
            for host in &cluster.hosts {
                if host.address.is_empty() {
                    anyhow::bail!("cluster '{}' has a host with an empty address", cluster.name);
                }
            }
            if cluster.max_connections == 0 {
                anyhow::bail!("cluster '{}': max_connections must be positive", cluster.name);
            }
        }

        for route in &self.route_config.routes {
            if route.name.is_empty() {
                anyhow::bail!("route name cannot be empty");
            }
            if route.clusters.is_empty() {
                anyhow::bail!("route '{}' has no clusters", route.name);
            }
        }

        Ok(())
    }
}
