//! Per-request upstream side: routing decision, pool acquisition, request
//! retransmission and response correlation.

use std::collections::HashSet;
use std::mem;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use prost::Message as _;
use tracing::{debug, error};

use crate::codec::{DecoderCallbacks, FixedHeader, FrameDecoder};
use crate::proto::{
    ErrorReply, ResponseProtocol, TRPC_SERVER_DECODE_ERR, TRPC_SERVER_NOSERVICE_ERR,
    TRPC_SERVER_OVERLOAD_ERR, TRPC_SERVER_SYSTEM_ERR, TRPC_SERVER_TIMEOUT_ERR,
};
use crate::route::{HashPolicy, MatchedRoute, RouteHeaders};
use crate::upstream::pool::PoolFailureReason;
use crate::upstream::{Host, LoadBalancerContext};

use super::conn_manager::{Action, ConnCore, ConnectionEvent, UpstreamEvent};
use super::message::MessageState;
use super::stream_info::ResponseFlag;

/// The upstream half of one active message.
///
/// The downstream frame is retransmitted verbatim (zero re-encoding); the
/// response is decoded with the router's own frame decoder and correlated to
/// the request by `request_id` before being written back.
pub struct Router {
    response_decoder: FrameDecoder,
    response_buffer: BytesMut,
    response_header: Option<ResponseProtocol>,
    upstream_request_buffer: Bytes,
    upstream_request: Option<UpstreamRequest>,
    route: Option<MatchedRoute>,
    end_stream: bool,
}

/// The per-request handle into the connection pool. At most one of
/// `pool_pending` / `has_conn` is set at a time.
#[derive(Default)]
struct UpstreamRequest {
    pool_pending: bool,
    has_conn: bool,
    upstream_host: Option<String>,
    /// Hosts that already failed for this request; selection steers away
    /// from them and the set only ever grows.
    failed_hosts: HashSet<String>,
    retry_armed: bool,
    retry_spent: bool,
    response_complete: bool,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            response_decoder: FrameDecoder::new(),
            response_buffer: BytesMut::new(),
            response_header: None,
            upstream_request_buffer: Bytes::new(),
            upstream_request: None,
            route: None,
            end_stream: false,
        }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message_decoded(
        &mut self,
        state: &mut MessageState,
        core: &mut ConnCore,
        frame: Bytes,
        out: &mut Vec<Action>,
    ) {
        debug!("message decoded: {} bytes", frame.len());
        state.stream_info.add_bytes_received(frame.len() as u64);
        self.upstream_request_buffer = frame;

        debug_assert!(self.upstream_request.is_none());
        self.upstream_request = Some(UpstreamRequest::default());

        self.dispatch(state, core, out);
    }

    fn dispatch(&mut self, state: &mut MessageState, core: &mut ConnCore, out: &mut Vec<Action>) {
        let service = state.metadata.service_name().to_string();

        let Some(matched) = state.route(core) else {
            error!("router: no route for service '{}'", service);
            state.stream_info.set_response_flag(ResponseFlag::NoRouteFound);
            core.stats().dismatch_route.increment(1);
            state.send_local_reply(
                core,
                &ErrorReply::new(
                    TRPC_SERVER_NOSERVICE_ERR,
                    format!("router: no route for service '{}'", service),
                ),
                true,
                out,
            );
            return;
        };

        let cluster_name = matched.cluster_name.clone();
        debug!("router: matched route '{}' cluster '{}'", matched.route.name, cluster_name);

        let Some(cluster) = core.clusters.get(cluster_name.as_ref()) else {
            error!("router: unknown cluster '{}'", cluster_name);
            state.stream_info.set_response_flag(ResponseFlag::NoRouteFound);
            core.stats().unknow_cluster.increment(1);
            state.send_local_reply(
                core,
                &ErrorReply::new(
                    TRPC_SERVER_NOSERVICE_ERR,
                    format!("router: unknown cluster '{}'", cluster_name),
                ),
                true,
                out,
            );
            return;
        };
        state.stream_info.set_upstream_cluster(cluster_name.clone());
        self.route = Some(matched);

        let selected = {
            let Some(upstream) = self.upstream_request.as_mut() else {
                return;
            };
            let mut ctx = RouterLbContext {
                hash_policy: self
                    .route
                    .as_ref()
                    .and_then(|m| m.route.hash_policy.as_ref()),
                headers: state.metadata.route_headers(),
                remote: state.stream_info.downstream_remote,
                upstream,
            };
            cluster.select_host(&mut ctx)
        };

        let Some(host) = selected else {
            debug!("router: no conn pool for '{}'", cluster.name());
            core.stats().no_conn_pool.increment(1);
            state.send_local_reply(
                core,
                &ErrorReply::new(
                    TRPC_SERVER_SYSTEM_ERR,
                    format!("router: no conn pool for '{}'", cluster.name()),
                ),
                true,
                out,
            );
            return;
        };

        if let Some(upstream) = self.upstream_request.as_mut() {
            upstream.pool_pending = true;
        }
        out.push(Action::AcquireUpstream {
            id: state.id,
            cluster,
            host: host.address().to_string(),
        });
    }

    /// Handle one upstream-side event. Returns `true` when the message is
    /// finished and must be reset by the caller.
    pub fn on_upstream_event(
        &mut self,
        state: &mut MessageState,
        core: &mut ConnCore,
        event: UpstreamEvent,
        out: &mut Vec<Action>,
    ) -> bool {
        match event {
            UpstreamEvent::PoolReady { host } => self.on_pool_ready(state, core, host, out),
            UpstreamEvent::PoolFailure { reason, host } => {
                self.on_pool_failure(state, core, reason, host, out)
            }
            UpstreamEvent::Data { data, end_stream } => {
                self.on_upstream_data(state, core, data, end_stream, out)
            }
            UpstreamEvent::Closed { event } => self.on_upstream_closed(state, core, event, out),
        }
    }

    fn on_pool_ready(
        &mut self,
        state: &mut MessageState,
        _core: &mut ConnCore,
        host: String,
        out: &mut Vec<Action>,
    ) -> bool {
        debug!(
            "upstream: pool ready, host={}, buffered={}",
            host,
            self.upstream_request_buffer.len()
        );
        let Some(upstream) = self.upstream_request.as_mut() else {
            return false;
        };
        upstream.pool_pending = false;
        upstream.has_conn = true;
        upstream.upstream_host = Some(host.clone());
        state.stream_info.on_upstream_host_selected(host);

        let data = mem::take(&mut self.upstream_request_buffer);
        out.push(Action::WriteUpstream { id: state.id, data });

        // No reply will ever come for a oneway call.
        if state.one_way_call {
            return self.message_finished(state, false, out);
        }
        false
    }

    fn on_pool_failure(
        &mut self,
        state: &mut MessageState,
        core: &mut ConnCore,
        reason: PoolFailureReason,
        host: String,
        out: &mut Vec<Action>,
    ) -> bool {
        debug!("upstream: pool failure, reason={}, host={}", reason, host);

        let retry = match self.upstream_request.as_mut() {
            None => return false,
            Some(upstream) => {
                upstream.pool_pending = false;
                if !host.is_empty() {
                    upstream.failed_hosts.insert(host.clone());
                }
                if !host.is_empty() && upstream.retry_armed {
                    upstream.retry_armed = false;
                    upstream.retry_spent = true;
                    true
                } else {
                    false
                }
            }
        };
        core.stats().conn_pool_failure.increment(1);

        if retry {
            self.dispatch(state, core, out);
            return false;
        }

        if !host.is_empty() {
            if let Some(upstream) = self.upstream_request.as_mut() {
                upstream.upstream_host = Some(host.clone());
            }
            state.stream_info.on_upstream_host_selected(host);
        }
        self.upstream_request_buffer = Bytes::new();

        error!("upstream: connection failure, reason={}", reason);
        self.on_reset_stream(state, core, reason, out)
    }

    fn on_upstream_data(
        &mut self,
        state: &mut MessageState,
        core: &mut ConnCore,
        data: Bytes,
        end_stream: bool,
        out: &mut Vec<Action>,
    ) -> bool {
        debug!("upstream: data {} bytes, end_stream={}", data.len(), end_stream);
        match self.upstream_request.as_ref() {
            None => return false,
            Some(u) if u.response_complete => return false,
            _ => {}
        }

        self.response_buffer.extend_from_slice(&data);
        self.end_stream = end_stream;

        let mut outcome: Option<bool> = None;
        let result = loop {
            let mut sink = ResponseSink {
                state: &mut *state,
                core: &mut *core,
                out: &mut *out,
                header: &mut self.response_header,
                end_stream: self.end_stream,
                outcome: &mut outcome,
            };
            match self.response_decoder.on_data(&mut self.response_buffer, &mut sink) {
                Err(e) => break Err(e),
                Ok(true) => break Ok(()),
                Ok(false) => {
                    if outcome.is_some() {
                        break Ok(());
                    }
                }
            }
        };

        match result {
            Err(e) => {
                error!("upstream: response decode error: {}", e);
                core.stats().response_decoding_error.increment(1);
                state.send_local_reply(
                    core,
                    &ErrorReply::new(
                        TRPC_SERVER_DECODE_ERR,
                        format!("response decode error: {}", e),
                    ),
                    false,
                    out,
                );
                self.message_finished(state, true, out)
            }
            Ok(()) => match outcome {
                Some(reset) => self.message_finished(state, reset, out),
                None => false,
            },
        }
    }

    fn on_upstream_closed(
        &mut self,
        state: &mut MessageState,
        core: &mut ConnCore,
        event: ConnectionEvent,
        out: &mut Vec<Action>,
    ) -> bool {
        match self.upstream_request.as_ref() {
            // Server closed the connection after we completed the response.
            None => return false,
            Some(u) if u.response_complete => {
                debug!("upstream: close after completed response, ignored");
                return false;
            }
            _ => {}
        }

        match event {
            ConnectionEvent::RemoteClose => {
                core.stats().conn_pool_remote_close.increment(1);
                self.on_reset_stream(state, core, PoolFailureReason::RemoteConnectionFailure, out)
            }
            ConnectionEvent::LocalClose => {
                core.stats().conn_pool_local_close.increment(1);
                self.on_reset_stream(state, core, PoolFailureReason::LocalConnectionFailure, out)
            }
            // Connected is consumed by the pool before events reach here.
            ConnectionEvent::Connected => false,
        }
    }

    fn on_reset_stream(
        &mut self,
        state: &mut MessageState,
        core: &mut ConnCore,
        reason: PoolFailureReason,
        out: &mut Vec<Action>,
    ) -> bool {
        // A oneway caller cannot be answered; drop the downstream to signal
        // the error. The close cascade resets this message.
        if state.one_way_call {
            core.close_downstream(false, out);
            return false;
        }

        let host = self
            .upstream_request
            .as_ref()
            .and_then(|u| u.upstream_host.clone())
            .unwrap_or_else(|| "null".to_string());

        let reply = match reason {
            PoolFailureReason::Overflow => {
                state
                    .stream_info
                    .set_response_flag(ResponseFlag::UpstreamOverflow);
                ErrorReply::new(
                    TRPC_SERVER_OVERLOAD_ERR,
                    "upstream request: too many connections".to_string(),
                )
            }
            PoolFailureReason::LocalConnectionFailure => ErrorReply::new(
                TRPC_SERVER_SYSTEM_ERR,
                format!("upstream request: local connection failure '{}'", host),
            ),
            PoolFailureReason::RemoteConnectionFailure => {
                state
                    .stream_info
                    .set_response_flag(ResponseFlag::UpstreamConnectionFailure);
                ErrorReply::new(
                    TRPC_SERVER_SYSTEM_ERR,
                    format!("upstream request: remote connection failure '{}'", host),
                )
            }
            PoolFailureReason::Timeout => {
                state
                    .stream_info
                    .set_response_flag(ResponseFlag::UpstreamConnectionFailure);
                ErrorReply::new(
                    TRPC_SERVER_TIMEOUT_ERR,
                    format!("upstream request: connection failure '{}' due to timeout", host),
                )
            }
        };

        state.send_local_reply(core, &reply, false, out);
        self.message_finished(state, true, out)
    }

    /// Mark the upstream side complete. Without a reset the connection goes
    /// back to the pool for reuse; with one, the reset path closes it.
    fn message_finished(&mut self, state: &MessageState, reset: bool, out: &mut Vec<Action>) -> bool {
        if let Some(upstream) = self.upstream_request.as_mut() {
            upstream.response_complete = true;
            if !reset && upstream.has_conn {
                out.push(Action::ReleaseUpstream { id: state.id });
                upstream.has_conn = false;
            }
        }
        true
    }

    /// Reset cascade from the active message: cancel a pending acquisition
    /// or close an owned upstream connection.
    pub fn on_reset(&mut self, state: &MessageState, out: &mut Vec<Action>) {
        if let Some(upstream) = self.upstream_request.take() {
            if upstream.pool_pending {
                debug_assert!(!upstream.has_conn);
                debug!("upstream: cancelling pending pool handle");
                out.push(Action::CancelAcquire { id: state.id });
            }
            if upstream.has_conn {
                out.push(Action::CloseUpstream { id: state.id });
            }
        }
    }
}

/// Load-balancer context for host selection: hashes per the matched route's
/// policy and steers the balancer away from hosts that already failed for
/// this request. Accepting a fresh host arms the single retry.
struct RouterLbContext<'a> {
    hash_policy: Option<&'a HashPolicy>,
    headers: &'a RouteHeaders,
    remote: SocketAddr,
    upstream: &'a mut UpstreamRequest,
}

impl LoadBalancerContext for RouterLbContext<'_> {
    fn compute_hash_key(&mut self) -> Option<u64> {
        self.hash_policy
            .and_then(|policy| policy.generate_hash(self.headers, self.remote))
    }

    fn should_select_another_host(&mut self, host: &Host) -> bool {
        if self.upstream.failed_hosts.contains(host.address()) {
            return true;
        }
        if !self.upstream.retry_spent {
            self.upstream.retry_armed = true;
        }
        false
    }
}

/// Response-side frame sink: parses the response header, correlates the
/// completed frame by request id and forwards it downstream.
struct ResponseSink<'a> {
    state: &'a mut MessageState,
    core: &'a mut ConnCore,
    out: &'a mut Vec<Action>,
    header: &'a mut Option<ResponseProtocol>,
    end_stream: bool,
    /// `Some(reset)` once a frame completed; drives `message_finished`.
    outcome: &'a mut Option<bool>,
}

impl DecoderCallbacks for ResponseSink<'_> {
    fn on_fixed_header(&mut self, _header: FixedHeader) {}

    fn on_protocol_header(&mut self, raw: &[u8]) -> bool {
        match ResponseProtocol::decode(raw) {
            Ok(header) => {
                *self.header = Some(header);
                true
            }
            Err(_) => false,
        }
    }

    fn on_frame(&mut self, frame: Bytes) {
        let request_id = self.header.as_ref().map(|h| h.request_id).unwrap_or(0);
        let expected = self.state.metadata.request_id();

        if request_id != expected {
            error!("upstream: response request_id {}, expected {}", request_id, expected);
            self.core.stats().response_different_request_id.increment(1);
            self.state.send_local_reply(
                self.core,
                &ErrorReply::new(
                    TRPC_SERVER_DECODE_ERR,
                    format!("response request_id:{}, expect:{}", request_id, expected),
                ),
                false,
                self.out,
            );
            *self.outcome = Some(true);
            return;
        }

        self.state.stream_info.add_bytes_sent(frame.len() as u64);
        self.out.push(Action::WriteDownstream {
            data: frame,
            end_stream: self.end_stream,
        });
        self.core.stats().response_success.increment(1);
        *self.outcome = Some(false);
    }
}
