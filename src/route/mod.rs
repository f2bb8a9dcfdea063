//! Route table and matcher.
//!
//! tRPC requests are routed on an HTTP-shaped view of the request header so
//! that the matcher grammar stays RDS-shaped: `:path` carries the function
//! name, `:authority` the callee service. Routes are compiled once from
//! config and swapped atomically; matching runs against an immutable
//! snapshot.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use regex::Regex;

use crate::config::{HashPolicyDef, PathMatchDef, RouteConfigDef};
use crate::proto::RequestProtocol;

pub const HEADER_PATH: &str = ":path";
pub const HEADER_AUTHORITY: &str = ":authority";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_CALLER: &str = "x-caller";

/// HTTP-shaped view of a tRPC request header.
///
/// The key set is fixed and must stay stable across versions: it is the
/// contract between the protocol layer and the route matcher (and hash
/// policies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteHeaders {
    path: String,
    authority: String,
    request_id: String,
    caller: String,
}

impl RouteHeaders {
    pub fn from_request(request: &RequestProtocol) -> Self {
        Self {
            path: request.func.clone(),
            authority: request.callee.clone(),
            request_id: request.request_id.to_string(),
            caller: request.caller.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            HEADER_PATH => Some(&self.path),
            HEADER_AUTHORITY => Some(&self.authority),
            HEADER_REQUEST_ID => Some(&self.request_id),
            HEADER_CALLER => Some(&self.caller),
            _ => None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            (HEADER_PATH, self.path.as_str()),
            (HEADER_AUTHORITY, self.authority.as_str()),
            (HEADER_REQUEST_ID, self.request_id.as_str()),
            (HEADER_CALLER, self.caller.as_str()),
        ]
        .into_iter()
    }
}

/// Consistent-hash policy attached to a route entry.
#[derive(Debug, Clone, Default)]
pub struct HashPolicy {
    pub header: Option<String>,
    pub use_source_ip: bool,
}

impl HashPolicy {
    fn from_def(def: &HashPolicyDef) -> Self {
        Self {
            header: def.header.clone(),
            use_source_ip: def.source_ip,
        }
    }

    /// Hash the configured request properties. Returns `None` when nothing
    /// the policy names is present, which sends the request through the
    /// default (round-robin) balancer.
    pub fn generate_hash(&self, headers: &RouteHeaders, remote: SocketAddr) -> Option<u64> {
        let mut hasher = DefaultHasher::new();
        let mut hashed = false;

        if let Some(ref name) = self.header {
            if let Some(value) = headers.get(name) {
                value.hash(&mut hasher);
                hashed = true;
            }
        }
        if self.use_source_ip {
            remote.ip().hash(&mut hasher);
            hashed = true;
        }

        hashed.then(|| hasher.finish())
    }
}

enum PathMatch {
    Exact(String),
    Prefix(String),
    Any,
}

struct HeaderMatcher {
    name: String,
    regex: Regex,
}

pub struct WeightedCluster {
    pub name: Arc<str>,
    pub weight: u32,
}

/// One compiled route: matchers plus the weighted cluster set it resolves to.
pub struct CompiledRoute {
    pub name: String,
    service: Option<String>,
    path: PathMatch,
    headers: Vec<HeaderMatcher>,
    clusters: Vec<WeightedCluster>,
    prefix_sum: Vec<u64>,
    total_weight: u64,
    pub hash_policy: Option<HashPolicy>,
}

impl CompiledRoute {
    fn matches(&self, headers: &RouteHeaders) -> bool {
        if let Some(ref service) = self.service {
            if headers.authority() != service {
                return false;
            }
        }

        match &self.path {
            PathMatch::Exact(p) => {
                if headers.path() != p {
                    return false;
                }
            }
            PathMatch::Prefix(p) => {
                if !headers.path().starts_with(p.as_str()) {
                    return false;
                }
            }
            PathMatch::Any => {}
        }

        self.headers.iter().all(|m| {
            headers
                .get(&m.name)
                .map(|v| m.regex.is_match(v))
                .unwrap_or(false)
        })
    }

    /// Pick a cluster from the weighted set using the per-request random
    /// value. With a single cluster the value is irrelevant.
    pub fn cluster_name(&self, random: u64) -> Arc<str> {
        if self.clusters.len() == 1 {
            return self.clusters[0].name.clone();
        }
        let target = random % self.total_weight;
        let idx = self.prefix_sum.partition_point(|&s| s <= target);
        self.clusters[idx].name.clone()
    }

    pub fn clusters(&self) -> &[WeightedCluster] {
        &self.clusters
    }
}

/// A matched route: the route itself plus the cluster chosen for this
/// request.
pub struct MatchedRoute {
    pub route: Arc<CompiledRoute>,
    pub cluster_name: Arc<str>,
}

/// Immutable snapshot of all compiled routes, matched in declaration order.
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn build(def: &RouteConfigDef) -> anyhow::Result<Self> {
        let mut routes = Vec::with_capacity(def.routes.len());

        for route in &def.routes {
            if route.clusters.is_empty() {
                anyhow::bail!("route '{}' has no clusters", route.name);
            }

            let path = match &route.r#match.func {
                Some(PathMatchDef::Exact { exact }) => PathMatch::Exact(exact.clone()),
                Some(PathMatchDef::Prefix { prefix }) => PathMatch::Prefix(prefix.clone()),
                None => PathMatch::Any,
            };

            let headers = route
                .r#match
                .headers
                .iter()
                .map(|h| {
                    Regex::new(&h.value)
                        .map(|regex| HeaderMatcher {
                            name: h.name.clone(),
                            regex,
                        })
                        .map_err(|e| {
                            anyhow::anyhow!(
                                "route '{}': bad header matcher '{}': {}",
                                route.name,
                                h.value,
                                e
                            )
                        })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let clusters: Vec<WeightedCluster> = route
                .clusters
                .iter()
                .map(|c| WeightedCluster {
                    name: Arc::from(c.name.as_str()),
                    weight: c.weight.max(1),
                })
                .collect();

            let mut prefix_sum = Vec::with_capacity(clusters.len());
            let mut total: u64 = 0;
            for c in &clusters {
                total += u64::from(c.weight);
                prefix_sum.push(total);
            }

            routes.push(Arc::new(CompiledRoute {
                name: route.name.clone(),
                service: route.r#match.service.clone(),
                path,
                headers,
                clusters,
                prefix_sum,
                total_weight: total,
                hash_policy: route.hash_policy.as_ref().map(HashPolicy::from_def),
            }));
        }

        Ok(Self { routes })
    }

    /// First route whose matchers accept the headers, in declaration order.
    pub fn match_route(&self, headers: &RouteHeaders, random: u64) -> Option<MatchedRoute> {
        self.routes
            .iter()
            .find(|r| r.matches(headers))
            .map(|r| MatchedRoute {
                route: r.clone(),
                cluster_name: r.cluster_name(random),
            })
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }
}

/// Version information published alongside a route-table snapshot.
#[derive(Debug, Clone)]
pub struct ConfigInfo {
    pub version: String,
    pub route_count: usize,
}

/// Snapshot-based route-config provider.
///
/// A static provider is populated at startup; a dynamic one starts empty and
/// receives tables through [`RouteConfigProvider::update`]. Consumers only
/// ever observe complete snapshots.
pub struct RouteConfigProvider {
    table: ArcSwapOption<RouteTable>,
    info: ArcSwapOption<ConfigInfo>,
}

impl RouteConfigProvider {
    /// A provider with no route table yet; `config()` returns `None` until
    /// the first update arrives.
    pub fn empty() -> Self {
        Self {
            table: ArcSwapOption::from(None),
            info: ArcSwapOption::from(None),
        }
    }

    pub fn with_table(table: RouteTable, version: impl Into<String>) -> Self {
        let provider = Self::empty();
        provider.update(table, version);
        provider
    }

    pub fn update(&self, table: RouteTable, version: impl Into<String>) {
        let info = ConfigInfo {
            version: version.into(),
            route_count: table.routes().len(),
        };
        self.table.store(Some(Arc::new(table)));
        self.info.store(Some(Arc::new(info)));
    }

    pub fn config(&self) -> Option<Arc<RouteTable>> {
        self.table.load_full()
    }

    pub fn config_info(&self) -> Option<Arc<ConfigInfo>> {
        self.info.load_full()
    }
}
