use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};

use crate::metrics::Metrics;
use crate::proxy::Client;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// State the admin endpoints read from.
#[derive(Clone)]
pub struct AdminState {
    pub client: Client,
    pub metrics: Metrics,
}

pub fn handle_admin(
    req: Request<Incoming>,
    state: AdminState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => {
            let active = state.client.active_connections();
            let max = state.client.max_connections();
            let ready = !state.client.is_shutting_down() && (max == 0 || active < max);
            let status = if ready { 200 } else { 503 };
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(full_body(format!(
                    r#"{{"status":"{}","active_connections":{},"max_connections":{}}}"#,
                    if ready { "ready" } else { "unavailable" },
                    active,
                    max,
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

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
