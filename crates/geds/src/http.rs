//! Node metrics endpoint: Prometheus text on `/metrics`, a short HTML
//! summary on `/`. Other paths are 404; non-GET methods are 400.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;

#[derive(Clone)]
pub struct NodeIdentity {
    pub uuid: String,
    pub hostname: String,
}

pub fn router(identity: NodeIdentity) -> Router {
    Router::new().fallback(handle).with_state(Arc::new(identity))
}

async fn handle(State(identity): State<Arc<NodeIdentity>>, request: Request<Body>) -> Response {
    if request.method() != Method::GET {
        return (StatusCode::BAD_REQUEST, "only GET is supported\n").into_response();
    }
    match request.uri().path() {
        "/" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            format!(
                "<!DOCTYPE html><html><head><title>GEDS Node</title></head><body>\
                 <h1>GEDS Node {}</h1><p>Host: {}</p>\
                 <p><a href=\"/metrics\">metrics</a></p></body></html>",
                identity.uuid, identity.hostname
            ),
        )
            .into_response(),
        "/metrics" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            geds_util::stats::gather(),
        )
            .into_response(),
        _ => (StatusCode::NOT_FOUND, "not found\n").into_response(),
    }
}
