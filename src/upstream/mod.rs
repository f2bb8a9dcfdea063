//! Upstream clusters and host selection.

pub mod health;
pub mod pool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::config::ClusterConfig;
use pool::ConnPool;

/// One upstream endpoint.
#[derive(Debug)]
pub struct Host {
    address: String,
    weight: u32,
}

impl Host {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Per-request context consulted during host selection.
///
/// The router implements this: the hash key comes from the matched route's
/// hash policy, and `should_select_another_host` steers the balancer away
/// from hosts that already failed for this request.
pub trait LoadBalancerContext {
    fn compute_hash_key(&mut self) -> Option<u64>;

    /// Consulted for each candidate; returning `true` asks the balancer to
    /// try a different host.
    fn should_select_another_host(&mut self, host: &Host) -> bool;

    /// Budget of re-picks before the balancer gives up and returns the last
    /// candidate regardless.
    fn host_selection_retry_count(&self) -> u32 {
        10
    }
}

/// Weighted host snapshot; prefix sums make a weighted pick one
/// `partition_point`.
struct HostSet {
    hosts: Vec<Arc<Host>>,
    prefix_sum: Vec<u64>,
    total_weight: u64,
}

impl HostSet {
    fn build(hosts: Vec<Arc<Host>>) -> Self {
        let mut prefix_sum = Vec::with_capacity(hosts.len());
        let mut total: u64 = 0;
        for host in &hosts {
            total += u64::from(host.weight.max(1));
            prefix_sum.push(total);
        }
        Self {
            hosts,
            prefix_sum,
            total_weight: total,
        }
    }

    fn index_for(&self, value: u64) -> usize {
        let target = value % self.total_weight;
        self.prefix_sum.partition_point(|&s| s <= target)
    }
}

/// Runtime state of one upstream cluster: host set, health view, and the
/// TCP connection pool.
pub struct Cluster {
    name: Arc<str>,
    config: Arc<ClusterConfig>,
    host_set: ArcSwap<HostSet>,
    rr_counter: AtomicU64,
    host_health: DashMap<String, bool>,
    pool: ConnPool,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        let hosts = config
            .hosts
            .iter()
            .map(|h| {
                Arc::new(Host {
                    address: h.address.clone(),
                    weight: h.weight,
                })
            })
            .collect();

        let pool = ConnPool::new(
            config.max_connections,
            Duration::from_secs_f64(config.connect_timeout),
            config.max_idle_per_host,
        );

        Self {
            name: Arc::from(config.name.as_str()),
            config: Arc::new(config),
            host_set: ArcSwap::from_pointee(HostSet::build(hosts)),
            rr_counter: AtomicU64::new(0),
            host_health: DashMap::new(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.host_set.load().hosts.clone()
    }

    // ---- Health view (written by the active health checker) ----

    pub fn is_host_healthy(&self, address: &str) -> bool {
        self.host_health.get(address).map(|v| *v.value()).unwrap_or(true)
    }

    pub fn mark_host_health(&self, address: &str, healthy: bool) {
        self.host_health.insert(address.to_string(), healthy);
    }

    // ---- Host selection ----

    /// Weighted selection honoring the request's LB context. Candidates the
    /// context rejects (or that active health checking marked down) are
    /// skipped by probing subsequent hosts, up to the context's retry
    /// budget; past the budget the last candidate is returned anyway so a
    /// fully-degraded cluster still routes.
    pub fn select_host(&self, ctx: &mut dyn LoadBalancerContext) -> Option<Arc<Host>> {
        let set = self.host_set.load();
        if set.hosts.is_empty() {
            return None;
        }

        let base = match ctx.compute_hash_key() {
            Some(hash) => hash,
            None => self.rr_counter.fetch_add(1, Ordering::Relaxed),
        };

        let start = set.index_for(base);
        let n = set.hosts.len();
        let mut last = None;

        for attempt in 0..=ctx.host_selection_retry_count() as usize {
            let host = &set.hosts[(start + attempt) % n];
            last = Some(host.clone());

            if !self.is_host_healthy(host.address()) {
                continue;
            }
            if ctx.should_select_another_host(host) {
                continue;
            }
            return last;
        }

        last
    }
}

/// Registry of all live clusters. Thread-safe, shared across connections.
pub struct ClusterManager {
    clusters: DashMap<String, Arc<Cluster>>,
}

impl ClusterManager {
    pub fn new(configs: &[ClusterConfig]) -> Self {
        let clusters = DashMap::new();
        for config in configs {
            clusters.insert(config.name.clone(), Arc::new(Cluster::new(config.clone())));
        }
        Self { clusters }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|entry| entry.value().clone())
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, &Arc<Cluster>)) {
        for entry in self.clusters.iter() {
            f(entry.key(), entry.value());
        }
    }
}
