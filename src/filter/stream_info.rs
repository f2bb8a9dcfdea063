//! Per-request telemetry consumed by access logs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a request did not complete normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFlag {
    NoRouteFound,
    UpstreamOverflow,
    UpstreamConnectionFailure,
}

impl ResponseFlag {
    fn mask(self) -> u8 {
        match self {
            ResponseFlag::NoRouteFound => 0x1,
            ResponseFlag::UpstreamOverflow => 0x2,
            ResponseFlag::UpstreamConnectionFailure => 0x4,
        }
    }

    fn short(self) -> &'static str {
        match self {
            ResponseFlag::NoRouteFound => "NR",
            ResponseFlag::UpstreamOverflow => "UO",
            ResponseFlag::UpstreamConnectionFailure => "UF",
        }
    }
}

const ALL_FLAGS: [ResponseFlag; 3] = [
    ResponseFlag::NoRouteFound,
    ResponseFlag::UpstreamOverflow,
    ResponseFlag::UpstreamConnectionFailure,
];

/// Accumulates bytes, flags, timings and upstream identity for one request.
pub struct StreamInfo {
    start: Instant,
    pub downstream_local: SocketAddr,
    pub downstream_remote: SocketAddr,
    bytes_received: u64,
    bytes_sent: u64,
    response_code: Option<i32>,
    flags: u8,
    upstream_cluster: Option<Arc<str>>,
    upstream_host: Option<String>,
    completed: Option<Duration>,
}

impl StreamInfo {
    pub fn new(downstream_local: SocketAddr, downstream_remote: SocketAddr) -> Self {
        Self {
            start: Instant::now(),
            downstream_local,
            downstream_remote,
            bytes_received: 0,
            bytes_sent: 0,
            response_code: None,
            flags: 0,
            upstream_cluster: None,
            upstream_host: None,
            completed: None,
        }
    }

    pub fn add_bytes_received(&mut self, n: u64) {
        self.bytes_received += n;
    }

    pub fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn set_response_code(&mut self, code: i32) {
        self.response_code = Some(code);
    }

    pub fn response_code(&self) -> Option<i32> {
        self.response_code
    }

    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        self.flags |= flag.mask();
    }

    pub fn has_response_flag(&self, flag: ResponseFlag) -> bool {
        self.flags & flag.mask() != 0
    }

    /// Short-code rendering for logs, `-` when no flag is set.
    pub fn response_flags_string(&self) -> String {
        if self.flags == 0 {
            return "-".to_string();
        }
        ALL_FLAGS
            .iter()
            .filter(|f| self.has_response_flag(**f))
            .map(|f| f.short())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn set_upstream_cluster(&mut self, cluster: Arc<str>) {
        self.upstream_cluster = Some(cluster);
    }

    pub fn upstream_cluster(&self) -> Option<&str> {
        self.upstream_cluster.as_deref()
    }

    pub fn on_upstream_host_selected(&mut self, host: String) {
        self.upstream_host = Some(host);
    }

    pub fn upstream_host(&self) -> Option<&str> {
        self.upstream_host.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn on_request_complete(&mut self) {
        self.completed = Some(self.start.elapsed());
    }

    /// Total request duration; falls back to the running clock when the
    /// request has not completed yet.
    pub fn duration(&self) -> Duration {
        self.completed.unwrap_or_else(|| self.start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StreamInfo {
        StreamInfo::new(
            "127.0.0.1:6000".parse().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    #[test]
    fn flags_render_as_short_codes() {
        let mut info = info();
        assert_eq!(info.response_flags_string(), "-");

        info.set_response_flag(ResponseFlag::NoRouteFound);
        assert_eq!(info.response_flags_string(), "NR");

        info.set_response_flag(ResponseFlag::UpstreamConnectionFailure);
        assert_eq!(info.response_flags_string(), "NR,UF");
        assert!(info.has_response_flag(ResponseFlag::NoRouteFound));
        assert!(!info.has_response_flag(ResponseFlag::UpstreamOverflow));
    }

    #[test]
    fn byte_accounting_accumulates() {
        let mut info = info();
        info.add_bytes_received(48);
        info.add_bytes_sent(30);
        info.add_bytes_sent(18);
        assert_eq!(info.bytes_received(), 48);
        assert_eq!(info.bytes_sent(), 48);
    }

    #[test]
    fn completion_freezes_duration() {
        let mut info = info();
        info.on_request_complete();
        let first = info.duration();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(info.duration(), first);
    }
}
