use std::sync::OnceLock;

use crate::proto::RequestProtocol;
use crate::route::RouteHeaders;

/// Per-request metadata, created once per decoded request frame and shared
/// between the active message and its router.
pub struct MessageMetadata {
    pkg_size: u32,
    request: RequestProtocol,
    route_headers: OnceLock<RouteHeaders>,
}

impl MessageMetadata {
    pub fn new(pkg_size: u32, request: RequestProtocol) -> Self {
        Self {
            pkg_size,
            request,
            route_headers: OnceLock::new(),
        }
    }

    /// Total size of the request frame on the wire.
    pub fn pkg_size(&self) -> u32 {
        self.pkg_size
    }

    pub fn request(&self) -> &RequestProtocol {
        &self.request
    }

    pub fn request_id(&self) -> u32 {
        self.request.request_id
    }

    pub fn service_name(&self) -> &str {
        &self.request.callee
    }

    /// The HTTP-shaped header view used by the route matcher. Built once on
    /// first use; the request header is immutable after decode so no
    /// invalidation is needed.
    pub fn route_headers(&self) -> &RouteHeaders {
        self.route_headers
            .get_or_init(|| RouteHeaders::from_request(&self.request))
    }
}
