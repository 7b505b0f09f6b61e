//! Scrape endpoint for the data-plane counters.
//!
//! Two GET routes: `/metrics` in Prometheus exposition format and
//! `/health`, which summarizes data-plane state (session count, datagram
//! totals) instead of a bare liveness string.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use tokio::net::TcpListener;

use crate::metrics::Metrics;

/// Serve `/metrics` and `/health` on the given port until the task is
/// dropped.
pub async fn serve_metrics(metrics: Arc<Metrics>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics port {}", port))?;

    info!("serving metrics on http://{}/metrics", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("metrics accept failed: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    Ok::<_, Infallible>(respond(req.method(), req.uri().path(), &metrics))
                }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection from {} ended: {}", peer, e);
            }
        });
    }
}

fn respond(method: &Method, path: &str, metrics: &Metrics) -> Response<String> {
    if method != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n".into());
    }

    if path == "/metrics" {
        let mut response = plain(StatusCode::OK, metrics.to_prometheus());
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        return response;
    }

    if path == "/health" {
        return plain(StatusCode::OK, health_body(metrics));
    }

    plain(StatusCode::NOT_FOUND, "not found\n".into())
}

/// One line of data-plane state, cheap enough for aggressive probing.
fn health_body(metrics: &Metrics) -> String {
    format!(
        "ok sessions={} rx_datagrams={} tun_write_errors={}\n",
        metrics.sessions_active.load(Ordering::Relaxed),
        metrics.rx_total(),
        metrics.tun_write_errors.load(Ordering::Relaxed),
    )
}

fn plain(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::MsgType;

    #[test]
    fn test_metrics_route() {
        let metrics = Metrics::new();
        metrics.count_rx(Some(MsgType::Message));

        let response = respond(&Method::GET, "/metrics", &metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        assert!(response.body().contains("veil_rx_message_total 1"));
    }

    #[test]
    fn test_health_reports_data_plane_state() {
        let metrics = Metrics::new();
        metrics.set_sessions(3);
        metrics.count_rx(Some(MsgType::Message));
        metrics.count_rx(Some(MsgType::Test));

        let response = respond(&Method::GET, "/health", &metrics);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "ok sessions=3 rx_datagrams=2 tun_write_errors=0\n");
    }

    #[test]
    fn test_unknown_path_and_method_rejected() {
        let metrics = Metrics::new();

        let missing = respond(&Method::GET, "/nope", &metrics);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let post = respond(&Method::POST, "/metrics", &metrics);
        assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
