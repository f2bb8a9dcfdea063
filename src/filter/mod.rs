//! The tRPC proxy filter core.
//!
//! Single-threaded per downstream connection: the connection manager owns the
//! request buffer and the list of in-flight messages, the request checker
//! splits the byte stream into frames, and each active message drives its own
//! router through routing, upstream acquisition and response correlation.
//! All I/O is expressed as [`conn_manager::Action`]s executed by the server
//! driver.

pub mod checker;
pub mod conn_manager;
pub mod message;
pub mod metadata;
pub mod router;
pub mod stats;
pub mod stream_info;

pub use conn_manager::{Action, ConnectionEvent, ConnectionManager, MessageId, UpstreamEvent};

use std::sync::Arc;

use crate::access_log::AccessLog;
use crate::route::RouteConfigProvider;
use stats::FilterStats;

/// Per-listener filter configuration shared by all downstream connections.
pub struct FilterConfig {
    pub stat_prefix: String,
    pub stats: FilterStats,
    pub route_provider: Arc<RouteConfigProvider>,
    pub access_logs: Vec<Arc<dyn AccessLog>>,
}

impl FilterConfig {
    pub fn new(
        stat_prefix: impl Into<String>,
        route_provider: Arc<RouteConfigProvider>,
        access_logs: Vec<Arc<dyn AccessLog>>,
    ) -> Self {
        let stat_prefix = stat_prefix.into();
        let stats = FilterStats::new(&stat_prefix);
        Self {
            stat_prefix,
            stats,
            route_provider,
            access_logs,
        }
    }
}
