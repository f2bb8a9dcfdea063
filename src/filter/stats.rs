//! The filter's stat set, registered once per listener and cloned cheaply
//! into every connection.

use metrics::{
    describe_counter, describe_gauge, describe_histogram, Counter, Gauge, Histogram, Unit,
};

/// Every stat the tRPC filter emits, under `trpc.<stat_prefix>.`.
#[derive(Clone)]
pub struct FilterStats {
    pub request_decoding_success: Counter,
    pub request_decoding_error: Counter,
    pub request_oneway_call: Counter,
    pub request_unary_call: Counter,
    pub no_conn_pool: Counter,
    pub dismatch_route: Counter,
    pub unknow_cluster: Counter,
    pub conn_pool_failure: Counter,
    pub conn_pool_remote_close: Counter,
    pub conn_pool_local_close: Counter,
    pub response_success: Counter,
    pub response_decoding_error: Counter,
    pub response_different_request_id: Counter,
    pub cx_destroy_local_with_active_rq: Counter,
    pub cx_destroy_remote_with_active_rq: Counter,
    pub downstream_cx_total: Counter,
    pub downstream_cx_active: Gauge,
    pub request_active: Gauge,
    pub request_time_ms: Histogram,
}

fn stat_name(stat_prefix: &str, stat: &str) -> String {
    format!("trpc.{}.{}", stat_prefix, stat)
}

impl FilterStats {
    pub fn new(stat_prefix: &str) -> Self {
        let name = |stat: &str| stat_name(stat_prefix, stat);
        Self {
            request_decoding_success: metrics::counter!(name("request_decoding_success")),
            request_decoding_error: metrics::counter!(name("request_decoding_error")),
            request_oneway_call: metrics::counter!(name("request_oneway_call")),
            request_unary_call: metrics::counter!(name("request_unary_call")),
            no_conn_pool: metrics::counter!(name("no_conn_pool")),
            dismatch_route: metrics::counter!(name("dismatch_route")),
            unknow_cluster: metrics::counter!(name("unknow_cluster")),
            conn_pool_failure: metrics::counter!(name("conn_pool_failure")),
            conn_pool_remote_close: metrics::counter!(name("conn_pool_remote_close")),
            conn_pool_local_close: metrics::counter!(name("conn_pool_local_close")),
            response_success: metrics::counter!(name("response_success")),
            response_decoding_error: metrics::counter!(name("response_decoding_error")),
            response_different_request_id: metrics::counter!(name("response_different_request_id")),
            cx_destroy_local_with_active_rq: metrics::counter!(
                name("cx_destroy_local_with_active_rq")
            ),
            cx_destroy_remote_with_active_rq: metrics::counter!(
                name("cx_destroy_remote_with_active_rq")
            ),
            downstream_cx_total: metrics::counter!(name("downstream_cx_total")),
            downstream_cx_active: metrics::gauge!(name("downstream_cx_active")),
            request_active: metrics::gauge!(name("request_active")),
            request_time_ms: metrics::histogram!(name("request_time_ms")),
        }
    }

    /// Register HELP/TYPE descriptions with the installed recorder. Called
    /// once at startup.
    pub fn describe(stat_prefix: &str) {
        let name = |stat: &str| stat_name(stat_prefix, stat);

        describe_counter!(
            name("request_decoding_success"),
            Unit::Count,
            "Requests decoded from downstream"
        );
        describe_counter!(
            name("request_decoding_error"),
            Unit::Count,
            "Downstream decode errors (connection fatal)"
        );
        describe_counter!(name("request_oneway_call"), Unit::Count, "Oneway requests");
        describe_counter!(name("request_unary_call"), Unit::Count, "Unary requests");
        describe_counter!(
            name("no_conn_pool"),
            Unit::Count,
            "Requests with no usable upstream connection pool"
        );
        describe_counter!(
            name("dismatch_route"),
            Unit::Count,
            "Requests matching no route"
        );
        describe_counter!(
            name("unknow_cluster"),
            Unit::Count,
            "Requests routed to an unknown cluster"
        );
        describe_counter!(
            name("conn_pool_failure"),
            Unit::Count,
            "Upstream connection acquisition failures"
        );
        describe_counter!(
            name("conn_pool_remote_close"),
            Unit::Count,
            "Upstream connections closed by the peer mid-request"
        );
        describe_counter!(
            name("conn_pool_local_close"),
            Unit::Count,
            "Upstream connections closed locally mid-request"
        );
        describe_counter!(
            name("response_success"),
            Unit::Count,
            "Upstream responses forwarded downstream"
        );
        describe_counter!(
            name("response_decoding_error"),
            Unit::Count,
            "Upstream response decode errors"
        );
        describe_counter!(
            name("response_different_request_id"),
            Unit::Count,
            "Upstream responses whose request id did not match"
        );
        describe_counter!(
            name("cx_destroy_local_with_active_rq"),
            Unit::Count,
            "Requests reset by a local connection close"
        );
        describe_counter!(
            name("cx_destroy_remote_with_active_rq"),
            Unit::Count,
            "Requests reset by a remote connection close"
        );
        describe_counter!(
            name("downstream_cx_total"),
            Unit::Count,
            "Downstream connections accepted"
        );
        describe_gauge!(
            name("downstream_cx_active"),
            Unit::Count,
            "Downstream connections currently open"
        );
        describe_gauge!(
            name("request_active"),
            Unit::Count,
            "Requests currently in flight"
        );
        describe_histogram!(
            name("request_time_ms"),
            Unit::Milliseconds,
            "Request duration from decode to reset"
        );
    }
}
