//! The per-request state object on the downstream side.

use std::sync::Arc;

use bytes::Bytes;
use metrics::Gauge;
use tracing::debug;

use crate::proto::{ErrorReply, TRPC_ONEWAY_CALL, TRPC_UNARY_CALL};
use crate::route::MatchedRoute;

use super::conn_manager::{Action, ConnCore, MessageId, UpstreamEvent};
use super::metadata::MessageMetadata;
use super::router::Router;
use super::stream_info::StreamInfo;

/// One in-flight request. Owned by the connection manager's message list;
/// sole owner of its router.
pub struct ActiveMessage {
    state: MessageState,
    router: Router,
}

/// The non-router part of an active message. Router methods receive this by
/// reference so both sides can borrow disjoint state.
pub struct MessageState {
    pub id: MessageId,
    pub metadata: Arc<MessageMetadata>,
    pub stream_info: StreamInfo,
    pub one_way_call: bool,
    replied: bool,
    reset: bool,
    active_gauge: Gauge,
}

impl Drop for MessageState {
    fn drop(&mut self) {
        self.active_gauge.decrement(1.0);
    }
}

impl ActiveMessage {
    pub fn new(id: MessageId, metadata: Arc<MessageMetadata>, core: &ConnCore) -> Self {
        debug!(
            "active message created, id={}, request_id={}",
            id,
            metadata.request_id()
        );
        let active_gauge = core.stats().request_active.clone();
        active_gauge.increment(1.0);

        Self {
            state: MessageState {
                id,
                metadata,
                stream_info: StreamInfo::new(core.local_addr, core.peer_addr),
                one_way_call: false,
                replied: false,
                reset: false,
                active_gauge,
            },
            router: Router::new(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.state.id
    }

    pub fn is_reset(&self) -> bool {
        self.state.reset
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.state.stream_info
    }

    pub fn metadata(&self) -> &Arc<MessageMetadata> {
        &self.state.metadata
    }

    /// A complete request frame has been pulled off the wire for this
    /// message.
    pub fn on_stream_decoded(&mut self, core: &mut ConnCore, frame: Bytes, out: &mut Vec<Action>) {
        debug_assert_eq!(frame.len() as u32, self.state.metadata.pkg_size());

        match self.state.metadata.request().call_type {
            TRPC_UNARY_CALL => core.stats().request_unary_call.increment(1),
            TRPC_ONEWAY_CALL => {
                core.stats().request_oneway_call.increment(1);
                self.state.one_way_call = true;
            }
            other => debug!("unhandled call type {}", other),
        }
        core.stats().request_decoding_success.increment(1);

        self.router
            .on_message_decoded(&mut self.state, core, frame, out);
    }

    /// Upstream-side event for this message (pool resolution, response
    /// bytes, connection close).
    pub fn on_upstream_event(
        &mut self,
        core: &mut ConnCore,
        event: UpstreamEvent,
        out: &mut Vec<Action>,
    ) {
        let finished = self
            .router
            .on_upstream_event(&mut self.state, core, event, out);
        if finished {
            self.on_reset(core, out);
        }
    }

    /// Retire this message: cascade into the router, complete the timer,
    /// emit access logs and leave the message flagged for the deferred-drop
    /// sweep. Idempotent.
    pub fn on_reset(&mut self, core: &mut ConnCore, out: &mut Vec<Action>) {
        if self.state.reset {
            return;
        }
        self.state.reset = true;

        self.router.on_reset(&self.state, out);

        core.stats()
            .request_time_ms
            .record(self.state.stream_info.elapsed().as_secs_f64() * 1000.0);
        self.state.stream_info.on_request_complete();

        for log in &core.config.access_logs {
            log.log(
                Some(self.state.metadata.route_headers()),
                &self.state.stream_info,
            );
        }
    }
}

impl MessageState {
    /// Match this request against the current route-config snapshot.
    pub fn route(&mut self, core: &ConnCore) -> Option<MatchedRoute> {
        let provider = &core.config.route_provider;
        if let Some(info) = provider.config_info() {
            debug!(
                "route config: version='{}' routes={}",
                info.version, info.route_count
            );
        }

        let table = provider.config()?;
        let random: u64 = rand::random();
        table.match_route(self.metadata.route_headers(), random)
    }

    /// Write a locally-generated reply downstream. At most one reply is ever
    /// produced per message.
    pub fn send_local_reply(
        &mut self,
        core: &mut ConnCore,
        reply: &ErrorReply,
        end_stream: bool,
        out: &mut Vec<Action>,
    ) {
        assert!(!self.replied, "second local reply for one message");
        self.replied = true;

        self.stream_info.set_response_code(reply.code());
        let len = core.send_local_reply(self.metadata.request(), reply, end_stream, out);
        self.stream_info.add_bytes_sent(len);
    }
}
