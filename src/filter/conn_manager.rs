//! Per-downstream-connection owner.
//!
//! Buffers downstream bytes, drives the request checker, owns the
//! insertion-ordered list of active messages and fans connection/upstream
//! events into them. All I/O comes out as an ordered list of [`Action`]s;
//! the server driver executes them and feeds resulting events back in, so
//! every handler for one connection runs strictly serialized.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error};

use crate::proto::{ErrorReply, RequestProtocol};
use crate::upstream::pool::PoolFailureReason;
use crate::upstream::{Cluster, ClusterManager};

use super::checker::RequestChecker;
use super::message::ActiveMessage;
use super::stats::FilterStats;
use super::FilterConfig;

pub type MessageId = u64;

/// Socket lifecycle events, downstream or upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    LocalClose,
    RemoteClose,
}

/// Upstream-side events for one in-flight message.
#[derive(Debug)]
pub enum UpstreamEvent {
    PoolReady {
        host: String,
    },
    PoolFailure {
        reason: PoolFailureReason,
        host: String,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    Closed {
        event: ConnectionEvent,
    },
}

/// I/O requested by the core, executed by the driver in order.
pub enum Action {
    WriteDownstream {
        data: Bytes,
        end_stream: bool,
    },
    CloseDownstream {
        flush: bool,
    },
    ReadDisable(bool),
    AcquireUpstream {
        id: MessageId,
        cluster: Arc<Cluster>,
        host: String,
    },
    CancelAcquire {
        id: MessageId,
    },
    WriteUpstream {
        id: MessageId,
        data: Bytes,
    },
    ReleaseUpstream {
        id: MessageId,
    },
    CloseUpstream {
        id: MessageId,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::WriteDownstream { data, end_stream } => f
                .debug_struct("WriteDownstream")
                .field("len", &data.len())
                .field("end_stream", end_stream)
                .finish(),
            Action::CloseDownstream { flush } => {
                f.debug_struct("CloseDownstream").field("flush", flush).finish()
            }
            Action::ReadDisable(disable) => f.debug_tuple("ReadDisable").field(disable).finish(),
            Action::AcquireUpstream { id, cluster, host } => f
                .debug_struct("AcquireUpstream")
                .field("id", id)
                .field("cluster", &cluster.name())
                .field("host", host)
                .finish(),
            Action::CancelAcquire { id } => {
                f.debug_struct("CancelAcquire").field("id", id).finish()
            }
            Action::WriteUpstream { id, data } => f
                .debug_struct("WriteUpstream")
                .field("id", id)
                .field("len", &data.len())
                .finish(),
            Action::ReleaseUpstream { id } => {
                f.debug_struct("ReleaseUpstream").field("id", id).finish()
            }
            Action::CloseUpstream { id } => {
                f.debug_struct("CloseUpstream").field("id", id).finish()
            }
        }
    }
}

/// Per-connection context handed down to messages and routers.
pub struct ConnCore {
    pub config: Arc<FilterConfig>,
    pub clusters: Arc<ClusterManager>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    downstream_open: bool,
}

impl ConnCore {
    pub fn stats(&self) -> &FilterStats {
        &self.config.stats
    }

    pub fn downstream_open(&self) -> bool {
        self.downstream_open
    }

    /// Encode and queue a local reply. Returns the bytes written, `0` when
    /// the downstream is already closed.
    pub fn send_local_reply(
        &mut self,
        request: &RequestProtocol,
        reply: &ErrorReply,
        end_stream: bool,
        out: &mut Vec<Action>,
    ) -> u64 {
        if !self.downstream_open {
            return 0;
        }

        let mut buf = BytesMut::new();
        reply.encode(request, &mut buf);
        let len = buf.len() as u64;
        out.push(Action::WriteDownstream {
            data: buf.freeze(),
            end_stream,
        });

        if end_stream {
            self.close_downstream(true, out);
        }
        len
    }

    /// Queue a downstream close unless one is already pending.
    pub fn close_downstream(&mut self, flush: bool, out: &mut Vec<Action>) {
        if self.downstream_open {
            out.push(Action::CloseDownstream { flush });
            self.downstream_open = false;
        }
    }
}

pub struct ConnectionManager {
    core: ConnCore,
    messages: Vec<ActiveMessage>,
    /// Messages retired from the list, dropped on the next tick.
    deferred: Vec<ActiveMessage>,
    request_buffer: BytesMut,
    checker: RequestChecker,
    next_id: MessageId,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<FilterConfig>,
        clusters: Arc<ClusterManager>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            core: ConnCore {
                config,
                clusters,
                local_addr,
                peer_addr,
                downstream_open: true,
            },
            messages: Vec::new(),
            deferred: Vec::new(),
            request_buffer: BytesMut::new(),
            checker: RequestChecker::new(),
            next_id: 0,
        }
    }

    /// Bytes arrived from the downstream peer. `end_stream` marks the
    /// half-close carried with the final read.
    pub fn on_downstream_data(&mut self, data: &[u8], end_stream: bool, out: &mut Vec<Action>) {
        debug!("downstream data: {} bytes, end_stream={}", data.len(), end_stream);
        self.request_buffer.extend_from_slice(data);
        self.dispatch(out);

        if end_stream {
            debug!("downstream half-closed");
            self.reset_all_messages(false, out);
            self.core.close_downstream(true, out);
        }
        self.sweep_reset();
    }

    /// Downstream socket lifecycle change.
    pub fn on_downstream_event(&mut self, event: ConnectionEvent, out: &mut Vec<Action>) {
        debug!("downstream event: {:?}", event);
        if event == ConnectionEvent::Connected {
            return;
        }
        self.reset_all_messages(event == ConnectionEvent::LocalClose, out);
        self.core.downstream_open = false;
        self.sweep_reset();
    }

    /// Upstream-side event for message `id`. Events for already-retired
    /// messages are dropped.
    pub fn on_upstream_event(&mut self, id: MessageId, event: UpstreamEvent, out: &mut Vec<Action>) {
        let Some(message) = self.messages.iter_mut().find(|m| m.id() == id) else {
            debug!("upstream event for retired message {}", id);
            return;
        };
        message.on_upstream_event(&mut self.core, event, out);
        self.sweep_reset();
    }

    /// Backpressure bridge: stop reading the downstream while its write
    /// buffer is over the high watermark.
    pub fn on_write_buffer_watermark(&mut self, high: bool, out: &mut Vec<Action>) {
        debug!("write buffer watermark, high={}", high);
        out.push(Action::ReadDisable(high));
    }

    /// The event-loop "next tick": actually drop messages retired since the
    /// previous call. Returns how many were dropped.
    pub fn drain_deferred(&mut self) -> usize {
        let n = self.deferred.len();
        self.deferred.clear();
        n
    }

    pub fn active_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn downstream_open(&self) -> bool {
        self.core.downstream_open
    }

    fn dispatch(&mut self, out: &mut Vec<Action>) {
        if self.request_buffer.is_empty() {
            return;
        }

        if let Err(e) = self.checker.on_data(
            &mut self.request_buffer,
            &mut self.core,
            &mut self.messages,
            &mut self.next_id,
            out,
        ) {
            error!("request decode error: {}", e);
            self.core.close_downstream(false, out);
            self.core.stats().request_decoding_error.increment(1);
            self.reset_all_messages(true, out);
        }
    }

    fn reset_all_messages(&mut self, local: bool, out: &mut Vec<Action>) {
        for message in &mut self.messages {
            if message.is_reset() {
                continue;
            }
            if local {
                debug!("local close with active request");
                self.core.stats().cx_destroy_local_with_active_rq.increment(1);
            } else {
                debug!("remote close with active request");
                self.core
                    .stats()
                    .cx_destroy_remote_with_active_rq
                    .increment(1);
            }
            message.on_reset(&mut self.core, out);
        }
    }

    /// Move messages flagged by the reset path out of the active list and
    /// into the deferred-drop queue, preserving order.
    fn sweep_reset(&mut self) {
        let mut i = 0;
        while i < self.messages.len() {
            if self.messages[i].is_reset() {
                let message = self.messages.remove(i);
                self.deferred.push(message);
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_log::AccessLog;
    use crate::config::{
        ClusterConfig, HostDef, RouteConfigDef, RouteDef, RouteMatchDef, WeightedClusterDef,
    };
    use crate::filter::stream_info::StreamInfo;
    use crate::proto::{
        encode_frame, RequestProtocol, ResponseProtocol, TRPC_INVOKE_SUCCESS, TRPC_ONEWAY_CALL,
        TRPC_SERVER_DECODE_ERR, TRPC_SERVER_NOSERVICE_ERR, TRPC_SERVER_TIMEOUT_ERR,
        TRPC_UNARY_CALL,
    };
    use crate::route::{RouteConfigProvider, RouteHeaders, RouteTable};
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use prost::Message as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLog(AtomicUsize);

    impl AccessLog for CountingLog {
        fn log(&self, _headers: Option<&RouteHeaders>, _info: &StreamInfo) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        cm: ConnectionManager,
        snapshotter: Snapshotter,
        access_logs: Arc<CountingLog>,
        pending: Vec<Action>,
    }

    fn harness(hosts: &[&str]) -> Harness {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let access_logs = Arc::new(CountingLog(AtomicUsize::new(0)));

        let cm = metrics::with_local_recorder(&recorder, || {
            let table = RouteTable::build(&RouteConfigDef {
                name: "test".into(),
                routes: vec![RouteDef {
                    name: "greeter".into(),
                    r#match: RouteMatchDef {
                        service: Some("svc.Greeter".into()),
                        func: None,
                        headers: vec![],
                    },
                    clusters: vec![WeightedClusterDef {
                        name: "c1".into(),
                        weight: 100,
                    }],
                    hash_policy: None,
                }],
            })
            .unwrap();

            let config = Arc::new(FilterConfig::new(
                "test",
                Arc::new(RouteConfigProvider::with_table(table, "1")),
                vec![access_logs.clone() as Arc<dyn AccessLog>],
            ));

            let clusters = Arc::new(ClusterManager::new(&[ClusterConfig {
                name: "c1".into(),
                hosts: hosts
                    .iter()
                    .map(|h| HostDef {
                        address: h.to_string(),
                        weight: 100,
                    })
                    .collect(),
                connect_timeout: 1.0,
                max_connections: 16,
                max_idle_per_host: 2,
                health_check: None,
            }]));

            ConnectionManager::new(
                config,
                clusters,
                "127.0.0.1:6000".parse().unwrap(),
                "127.0.0.1:40000".parse().unwrap(),
            )
        });

        Harness {
            cm,
            snapshotter,
            access_logs,
            pending: Vec::new(),
        }
    }

    impl Harness {
        /// Run queued actions to quiescence the way the driver does:
        /// executing a downstream close feeds a `LocalClose` back in.
        fn drive(&mut self) -> Vec<Action> {
            let mut done = Vec::new();
            while !self.pending.is_empty() {
                let batch: Vec<Action> = self.pending.drain(..).collect();
                for action in batch {
                    let close = matches!(action, Action::CloseDownstream { .. });
                    done.push(action);
                    if close {
                        self.cm
                            .on_downstream_event(ConnectionEvent::LocalClose, &mut self.pending);
                    }
                }
            }
            self.cm.drain_deferred();
            done
        }

        fn feed(&mut self, data: &[u8], end_stream: bool) -> Vec<Action> {
            self.cm.on_downstream_data(data, end_stream, &mut self.pending);
            self.drive()
        }

        fn upstream(&mut self, id: MessageId, event: UpstreamEvent) -> Vec<Action> {
            self.cm.on_upstream_event(id, event, &mut self.pending);
            self.drive()
        }

        fn counter(&self, stat: &str) -> u64 {
            let name = format!("trpc.test.{}", stat);
            for (key, _, _, value) in self.snapshotter.snapshot().into_vec() {
                if key.key().name() == name {
                    if let DebugValue::Counter(v) = value {
                        return v;
                    }
                }
            }
            0
        }
    }

    fn request_frame(request_id: u32, call_type: u32, callee: &str, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(
            &RequestProtocol {
                version: 0,
                call_type,
                request_id,
                timeout: 1000,
                caller: "trpc.test.client".into(),
                callee: callee.into(),
                func: "/SayHello".into(),
                content_type: 0,
                content_encoding: 0,
            },
            body,
            &mut buf,
        );
        buf
    }

    fn response_frame(request_id: u32, ret: i32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(
            &ResponseProtocol {
                version: 0,
                call_type: TRPC_UNARY_CALL,
                request_id,
                ret,
                func_ret: ret,
                error_msg: String::new(),
                content_type: 0,
                content_encoding: 0,
            },
            body,
            &mut buf,
        );
        buf
    }

    fn decode_reply(data: &Bytes) -> ResponseProtocol {
        let pb_len = u16::from_be_bytes([data[8], data[9]]) as usize;
        ResponseProtocol::decode(&data[16..16 + pb_len]).unwrap()
    }

    #[test]
    fn happy_path_unary() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", &[0x42; 20]);

        let actions = h.feed(&frame, false);
        assert_eq!(actions.len(), 1, "{:?}", actions);
        match &actions[0] {
            Action::AcquireUpstream { id, cluster, host } => {
                assert_eq!(*id, 0);
                assert_eq!(cluster.name(), "c1");
                assert_eq!(host, "127.0.0.1:9101");
            }
            other => panic!("expected acquire, got {:?}", other),
        }

        let actions = h.upstream(
            0,
            UpstreamEvent::PoolReady {
                host: "127.0.0.1:9101".into(),
            },
        );
        match &actions[..] {
            [Action::WriteUpstream { id: 0, data }] => assert_eq!(&data[..], &frame[..]),
            other => panic!("expected upstream write, got {:?}", other),
        }

        let reply = response_frame(7, TRPC_INVOKE_SUCCESS, &[0x24; 8]);
        let actions = h.upstream(
            0,
            UpstreamEvent::Data {
                data: Bytes::from(reply.to_vec()),
                end_stream: false,
            },
        );
        match &actions[..] {
            [Action::WriteDownstream { data, end_stream: false }, Action::ReleaseUpstream { id: 0 }] => {
                assert_eq!(&data[..], &reply[..]);
            }
            other => panic!("expected downstream write + release, got {:?}", other),
        }

        assert_eq!(h.counter("request_decoding_success"), 1);
        assert_eq!(h.counter("request_unary_call"), 1);
        assert_eq!(h.counter("response_success"), 1);
        assert_eq!(h.cm.active_messages(), 0);
        assert_eq!(h.access_logs.0.load(Ordering::SeqCst), 1);
        assert!(h.cm.downstream_open());
    }

    #[test]
    fn oneway_completes_after_upstream_write() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let frame = request_frame(9, TRPC_ONEWAY_CALL, "svc.Greeter", b"payload");

        h.feed(&frame, false);
        let actions = h.upstream(
            0,
            UpstreamEvent::PoolReady {
                host: "127.0.0.1:9101".into(),
            },
        );

        // write then release; nothing is ever sent downstream
        assert!(matches!(actions[0], Action::WriteUpstream { .. }));
        assert!(matches!(actions[1], Action::ReleaseUpstream { id: 0 }));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::WriteDownstream { .. })));

        assert_eq!(h.counter("request_oneway_call"), 1);
        assert_eq!(h.cm.active_messages(), 0);
        assert_eq!(h.access_logs.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn partial_delivery_byte_by_byte() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", &[0x42; 20]);

        for byte in &frame[..frame.len() - 1] {
            let actions = h.feed(std::slice::from_ref(byte), false);
            assert!(actions.is_empty(), "no actions before the frame completes");
        }
        let actions = h.feed(&frame[frame.len() - 1..], false);
        assert!(matches!(actions[0], Action::AcquireUpstream { .. }));
        assert_eq!(h.counter("request_decoding_success"), 1);
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let mut data = request_frame(1, TRPC_UNARY_CALL, "svc.Greeter", b"a").to_vec();
        data.extend_from_slice(&request_frame(2, TRPC_UNARY_CALL, "svc.Greeter", b"b"));

        let actions = h.feed(&data, false);
        let ids: Vec<MessageId> = actions
            .iter()
            .filter_map(|a| match a {
                Action::AcquireUpstream { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(h.cm.active_messages(), 2);
    }

    #[test]
    fn request_id_mismatch_resets_upstream() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", b"x");

        h.feed(&frame, false);
        h.upstream(
            0,
            UpstreamEvent::PoolReady {
                host: "127.0.0.1:9101".into(),
            },
        );

        let reply = response_frame(8, TRPC_INVOKE_SUCCESS, &[]);
        let actions = h.upstream(
            0,
            UpstreamEvent::Data {
                data: Bytes::from(reply.to_vec()),
                end_stream: false,
            },
        );

        match &actions[..] {
            [Action::WriteDownstream { data, end_stream: false }, Action::CloseUpstream { id: 0 }] => {
                let reply = decode_reply(data);
                assert_eq!(reply.ret, TRPC_SERVER_DECODE_ERR);
                assert_eq!(reply.request_id, 7, "error reply echoes the request id");
            }
            other => panic!("expected error reply + upstream close, got {:?}", other),
        }

        assert_eq!(h.counter("response_different_request_id"), 1);
        assert_eq!(h.counter("response_success"), 0);
        assert_eq!(h.cm.active_messages(), 0);
        assert!(h.cm.downstream_open(), "other requests may still use the connection");
    }

    #[test]
    fn no_route_sends_noservice_and_closes() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Unknown", b"x");

        let actions = h.feed(&frame, false);
        match &actions[..] {
            [Action::WriteDownstream { data, end_stream: true }, Action::CloseDownstream { flush: true }] =>
            {
                let reply = decode_reply(data);
                assert_eq!(reply.ret, TRPC_SERVER_NOSERVICE_ERR);
                assert_eq!(reply.request_id, 7);
            }
            other => panic!("expected reply + close, got {:?}", other),
        }

        assert_eq!(h.counter("dismatch_route"), 1);
        assert_eq!(h.counter("cx_destroy_local_with_active_rq"), 1);
        assert_eq!(h.cm.active_messages(), 0);
        assert_eq!(h.access_logs.0.load(Ordering::SeqCst), 1);
        assert!(!h.cm.downstream_open());
    }

    #[test]
    fn pool_timeout_retries_once_then_replies_timeout() {
        let mut h = harness(&["127.0.0.1:9101", "127.0.0.1:9102"]);
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", b"x");

        let actions = h.feed(&frame, false);
        let first_host = match &actions[0] {
            Action::AcquireUpstream { host, .. } => host.clone(),
            other => panic!("expected acquire, got {:?}", other),
        };

        // first failure: retry budget spent, a different host is tried
        let actions = h.upstream(
            0,
            UpstreamEvent::PoolFailure {
                reason: PoolFailureReason::Timeout,
                host: first_host.clone(),
            },
        );
        let second_host = match &actions[..] {
            [Action::AcquireUpstream { host, .. }] => host.clone(),
            other => panic!("expected one retry acquire, got {:?}", other),
        };
        assert_ne!(second_host, first_host, "failed host set strictly grows");
        assert_eq!(h.counter("conn_pool_failure"), 1);

        // second failure: terminal timeout reply, no end-stream
        let actions = h.upstream(
            0,
            UpstreamEvent::PoolFailure {
                reason: PoolFailureReason::Timeout,
                host: second_host,
            },
        );
        match &actions[..] {
            [Action::WriteDownstream { data, end_stream: false }] => {
                let reply = decode_reply(data);
                assert_eq!(reply.ret, TRPC_SERVER_TIMEOUT_ERR);
            }
            other => panic!("expected timeout reply, got {:?}", other),
        }

        assert_eq!(h.counter("conn_pool_failure"), 2);
        assert_eq!(h.cm.active_messages(), 0);
        assert!(h.cm.downstream_open());
    }

    #[test]
    fn downstream_decode_error_closes_without_flush() {
        let mut h = harness(&["127.0.0.1:9101"]);

        // park one in-flight request first
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", b"x");
        h.feed(&frame, false);

        let mut garbage = request_frame(8, TRPC_UNARY_CALL, "svc.Greeter", b"y");
        garbage[0] = 0x00;
        let actions = h.feed(&garbage, false);

        assert!(
            matches!(actions[0], Action::CloseDownstream { flush: false }),
            "{:?}",
            actions
        );
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CancelAcquire { id: 0 })));

        assert_eq!(h.counter("request_decoding_error"), 1);
        assert_eq!(h.counter("cx_destroy_local_with_active_rq"), 1);
        assert_eq!(h.cm.active_messages(), 0);
    }

    #[test]
    fn downstream_end_stream_resets_remote() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", b"x");
        h.feed(&frame, false);

        let actions = h.feed(&[], true);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CancelAcquire { id: 0 })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::CloseDownstream { flush: true })));

        assert_eq!(h.counter("cx_destroy_remote_with_active_rq"), 1);
        assert_eq!(h.cm.active_messages(), 0);
        assert_eq!(h.access_logs.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn upstream_remote_close_mid_request() {
        let mut h = harness(&["127.0.0.1:9101"]);
        let frame = request_frame(7, TRPC_UNARY_CALL, "svc.Greeter", b"x");
        h.feed(&frame, false);
        h.upstream(
            0,
            UpstreamEvent::PoolReady {
                host: "127.0.0.1:9101".into(),
            },
        );

        let actions = h.upstream(
            0,
            UpstreamEvent::Closed {
                event: ConnectionEvent::RemoteClose,
            },
        );
        match &actions[..] {
            [Action::WriteDownstream { data, end_stream: false }, Action::CloseUpstream { id: 0 }] => {
                let reply = decode_reply(data);
                assert_eq!(reply.ret, crate::proto::TRPC_SERVER_SYSTEM_ERR);
            }
            other => panic!("expected system error reply, got {:?}", other),
        }
        assert_eq!(h.counter("conn_pool_remote_close"), 1);
    }

    #[test]
    fn watermark_toggles_read_disable() {
        let mut h = harness(&[]);
        h.cm.on_write_buffer_watermark(true, &mut h.pending);
        h.cm.on_write_buffer_watermark(false, &mut h.pending);
        let actions: Vec<Action> = h.pending.drain(..).collect();
        assert!(matches!(actions[0], Action::ReadDisable(true)));
        assert!(matches!(actions[1], Action::ReadDisable(false)));
    }
}
