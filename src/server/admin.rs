use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

use super::ProxyState;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: ProxyState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let (version, routes) = match state.filter.route_provider.config_info() {
                Some(info) => (info.version.clone(), info.route_count),
                None => ("-".to_string(), 0),
            };
            let uptime = humantime::format_duration(std::time::Duration::from_secs(
                state.started.elapsed().as_secs(),
            ));
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(format!(
                    r#"{{"status":"ready","route_config_version":"{}","routes":{},"uptime":"{}"}}"#,
                    version, routes, uptime,
                )))
                .unwrap())
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .unwrap())
        }

        "/routes" => {
            let routes: Vec<serde_json::Value> = state
                .filter
                .route_provider
                .config()
                .map(|table| {
                    table
                        .routes()
                        .iter()
                        .map(|r| {
                            serde_json::json!({
                                "name": r.name,
                                "clusters": r.clusters().iter().map(|c| {
                                    serde_json::json!({"name": &*c.name, "weight": c.weight})
                                }).collect::<Vec<_>>(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/clusters" => {
            let mut clusters: Vec<serde_json::Value> = Vec::new();
            state.clusters.for_each(|name, cluster| {
                let hosts: Vec<serde_json::Value> = cluster
                    .hosts()
                    .iter()
                    .map(|h| {
                        serde_json::json!({
                            "address": h.address(),
                            "weight": h.weight(),
                            "healthy": cluster.is_host_healthy(h.address()),
                        })
                    })
                    .collect();
                clusters.push(serde_json::json!({"name": name, "hosts": hosts}));
            });

            let body = serde_json::to_string_pretty(&clusters).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
