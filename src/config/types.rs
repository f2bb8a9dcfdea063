use serde::{Deserialize, Serialize};

/// Top-level proxy configuration, loaded from a TOML or JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Prefix for every stat the filter emits (`trpc.<stat_prefix>.*`).
    pub stat_prefix: String,
    pub listen: String,
    pub admin_listen: String,
    pub log: LogConfig,
    pub access_log: AccessLogConfig,
    pub route_config: RouteConfigDef,
    pub clusters: Vec<ClusterConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            stat_prefix: "ingress".into(),
            listen: "0.0.0.0:6000".into(),
            admin_listen: "0.0.0.0:9901".into(),
            log: LogConfig::default(),
            access_log: AccessLogConfig::default(),
            route_config: RouteConfigDef::default(),
            clusters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// "text" or "json".
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    pub enabled: bool,
    /// Log file path; when unset access records go to the main log stream.
    pub path: Option<String>,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// Static route configuration (the `route_config` branch of the route
/// specifier; dynamic tables arrive through the provider at runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfigDef {
    pub name: String,
    pub routes: Vec<RouteDef>,
}

impl Default for RouteConfigDef {
    fn default() -> Self {
        Self {
            name: "local_routes".into(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDef {
    pub name: String,
    #[serde(default)]
    pub r#match: RouteMatchDef,
    pub clusters: Vec<WeightedClusterDef>,
    #[serde(default)]
    pub hash_policy: Option<HashPolicyDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteMatchDef {
    /// Exact match on the callee service name; unset matches any service.
    pub service: Option<String>,
    /// Match on the function name; unset matches any function.
    pub func: Option<PathMatchDef>,
    /// Regex matchers over the request's header view.
    pub headers: Vec<HeaderMatchDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathMatchDef {
    Exact { exact: String },
    Prefix { prefix: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderMatchDef {
    pub name: String,
    /// Anchored regex applied to the header value.
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedClusterDef {
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HashPolicyDef {
    pub header: Option<String>,
    pub source_ip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<HostDef>,
    /// Upstream connect timeout, seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    /// Hard cap on concurrent upstream connections for this cluster;
    /// acquisitions beyond it fail with overflow.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle connections kept per host for reuse.
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDef {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Seconds between check rounds.
    pub interval: f64,
    /// Per-probe timeout, seconds.
    pub timeout: f64,
    /// Callee service name stamped into the ping request.
    pub callee: String,
    /// Caller identity stamped into the ping request.
    pub caller: String,
    /// Consider a successful TCP connect healthy; skip the tRPC ping.
    pub only_verify_connect: bool,
    /// Keep the probe connection open between rounds.
    pub reuse_connection: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: 5.0,
            timeout: 2.0,
            callee: String::new(),
            caller: "trpc.proxy.health".into(),
            only_verify_connect: false,
            reuse_connection: false,
        }
    }
}

fn default_weight() -> u32 {
    100
}

fn default_connect_timeout() -> f64 {
    5.0
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_idle_per_host() -> usize {
    8
}
