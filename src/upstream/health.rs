//! Active health checking for upstream clusters.
//!
//! Each round either verifies that a TCP connect succeeds
//! (`only_verify_connect`) or exchanges a minimal tRPC unary ping and
//! requires `ret == 0 && func_ret == 0` in the response. With
//! `reuse_connection` the probe socket is kept between rounds.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::codec::{DecoderCallbacks, FixedHeader, FrameDecoder};
use crate::config::HealthCheckConfig;
use crate::proto::{
    encode_frame, RequestProtocol, ResponseProtocol, TRPC_INVOKE_SUCCESS, TRPC_PROTO_ENCODE,
    TRPC_UNARY_CALL,
};
use crate::upstream::Cluster;

/// Hosts probed concurrently within one cluster round.
const PROBE_CONCURRENCY: usize = 4;

pub struct HealthChecker {
    cluster: Arc<Cluster>,
    config: HealthCheckConfig,
    sessions: tokio::sync::Mutex<HashMap<String, TcpStream>>,
    request_seq: AtomicU32,
}

impl HealthChecker {
    pub fn new(cluster: Arc<Cluster>, config: HealthCheckConfig) -> Self {
        Self {
            cluster,
            config,
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            request_seq: AtomicU32::new(0),
        }
    }

    /// Check rounds forever; the caller owns the task.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(self.config.interval));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_round().await;
        }
    }

    /// One round over every host of the cluster.
    pub async fn run_round(&self) {
        let hosts = self.cluster.hosts();
        stream::iter(hosts)
            .map(|host| async move {
                let address = host.address().to_string();
                let healthy = self.check_host(&address).await;
                self.record(&address, healthy);
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect::<()>()
            .await;
    }

    /// Probe one host, bounded by the configured timeout.
    pub async fn check_host(&self, address: &str) -> bool {
        let timeout = Duration::from_secs_f64(self.config.timeout);
        match tokio::time::timeout(timeout, self.probe(address)).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(e)) => {
                debug!(
                    "health: probe error, cluster={}, host={}, error={}",
                    self.cluster.name(),
                    address,
                    e
                );
                false
            }
            Err(_) => {
                debug!(
                    "health: probe timeout, cluster={}, host={}",
                    self.cluster.name(),
                    address
                );
                false
            }
        }
    }

    async fn probe(&self, address: &str) -> io::Result<bool> {
        let reuse = self.config.reuse_connection && !self.config.only_verify_connect;

        let mut stream = match self.take_session(address, reuse).await {
            Some(stream) => stream,
            None => TcpStream::connect(address).await?,
        };

        // Connect-only mode: a successful connect is healthy; close right
        // away, reuse does not apply.
        if self.config.only_verify_connect {
            return Ok(true);
        }

        let request_id = self.request_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let header = RequestProtocol {
            version: 0,
            call_type: TRPC_UNARY_CALL,
            request_id,
            timeout: 1000,
            caller: self.config.caller.clone(),
            callee: self.config.callee.clone(),
            func: String::new(),
            content_type: TRPC_PROTO_ENCODE,
            content_encoding: 0,
        };
        let mut request = BytesMut::new();
        encode_frame(&header, &[], &mut request);
        stream.write_all(&request).await?;

        let response = read_response(&mut stream).await?;
        let healthy = response.ret == TRPC_INVOKE_SUCCESS && response.func_ret == TRPC_INVOKE_SUCCESS;

        if reuse && healthy {
            self.sessions
                .lock()
                .await
                .insert(address.to_string(), stream);
        }

        Ok(healthy)
    }

    async fn take_session(&self, address: &str, reuse: bool) -> Option<TcpStream> {
        if !reuse {
            return None;
        }
        self.sessions.lock().await.remove(address)
    }

    fn record(&self, address: &str, healthy: bool) {
        let was_healthy = self.cluster.is_host_healthy(address);
        self.cluster.mark_host_health(address, healthy);

        metrics::counter!(
            "trpc_proxy_health_check_total",
            "cluster" => self.cluster.name().to_string(),
            "host" => address.to_string(),
            "result" => if healthy { "success" } else { "failure" },
        )
        .increment(1);
        metrics::gauge!(
            "trpc_proxy_upstream_health_status",
            "cluster" => self.cluster.name().to_string(),
            "host" => address.to_string(),
        )
        .set(if healthy { 1.0 } else { 0.0 });

        if healthy && !was_healthy {
            debug!(
                "health: host recovered, cluster={}, host={}",
                self.cluster.name(),
                address
            );
        } else if !healthy && was_healthy {
            warn!(
                "health: host marked unhealthy, cluster={}, host={}",
                self.cluster.name(),
                address
            );
        }
    }
}

/// Response-frame sink for the ping session.
#[derive(Default)]
struct PingSink {
    header: Option<ResponseProtocol>,
    completed: bool,
}

impl DecoderCallbacks for PingSink {
    fn on_fixed_header(&mut self, _header: FixedHeader) {}

    fn on_protocol_header(&mut self, raw: &[u8]) -> bool {
        match ResponseProtocol::decode(raw) {
            Ok(header) => {
                self.header = Some(header);
                true
            }
            Err(_) => false,
        }
    }

    fn on_frame(&mut self, _frame: Bytes) {
        self.completed = true;
    }
}

async fn read_response(stream: &mut TcpStream) -> io::Result<ResponseProtocol> {
    let mut decoder = FrameDecoder::new();
    let mut sink = PingSink::default();
    let mut buf = BytesMut::with_capacity(1024);

    while !sink.completed {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        loop {
            match decoder.on_data(&mut buf, &mut sink) {
                Ok(true) => break,
                Ok(false) => {
                    if sink.completed {
                        break;
                    }
                }
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }
    }

    sink.header
        .ok_or_else(|| io::ErrorKind::InvalidData.into())
}
