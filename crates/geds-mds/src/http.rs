//! Thin HTTP admin surface: an HTML node summary on `/` and Prometheus text
//! on `/metrics`. Anything else is 404; non-GET methods are 400.

use crate::nodes::Nodes;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::sync::Arc;
use std::time::SystemTime;

pub fn router(nodes: Arc<Nodes>) -> Router {
    Router::new().fallback(handle).with_state(nodes)
}

async fn handle(State(nodes): State<Arc<Nodes>>, request: Request<Body>) -> Response {
    if request.method() != Method::GET {
        return (StatusCode::BAD_REQUEST, "only GET is supported\n").into_response();
    }
    match request.uri().path() {
        "/" => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            node_summary(&nodes),
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

fn node_summary(nodes: &Nodes) -> String {
    let mut html = String::from(
        "<!DOCTYPE html><html><head><title>GEDS Metadata Service</title></head><body>\
         <h1>GEDS Metadata Service</h1>\
         <table border=\"1\"><tr>\
         <th>Node</th><th>Host</th><th>Port</th><th>State</th>\
         <th>Storage allocated</th><th>Storage used</th>\
         <th>Memory allocated</th><th>Memory used</th><th>Last heartbeat</th>\
         </tr>",
    );
    for node in nodes.list() {
        let (stats, checkin) = node.last_heartbeat();
        let checkin = checkin
            .map(|at: SystemTime| humantime::format_rfc3339_seconds(at).to_string())
            .unwrap_or_else(|| "never".to_string());
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:?}</td>\
             <td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            node.identifier,
            node.host,
            node.port,
            node.state(),
            stats.storage_allocated,
            stats.storage_used,
            stats.memory_allocated,
            stats.memory_used,
            checkin,
        ));
    }
    html.push_str("</table></body></html>");
    html
}
