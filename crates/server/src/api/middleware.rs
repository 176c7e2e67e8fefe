//! Metrics and access-control middleware for API routes.

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::warn;

use crate::metrics::{
    route_label, DEV_REQUESTS_REJECTED, HTTP_REQUESTS_IN_FLIGHT, HTTP_REQUESTS_TOTAL,
    HTTP_REQUEST_DURATION,
};

/// Metrics middleware that tracks HTTP request duration and counts.
///
/// This middleware records:
/// - Request duration (histogram)
/// - Request count (counter)
/// - Requests in flight (gauge)
///
/// Requests are labelled by route template, so query strings and unknown
/// paths never create new label values.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = route_label(
        request
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str),
    );

    HTTP_REQUESTS_IN_FLIGHT.inc();

    let response = next.run(request).await;

    HTTP_REQUESTS_IN_FLIGHT.dec();

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &path, &status])
        .observe(duration);
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();

    response
}

/// Refuse requests whose peer address is not a loopback address.
///
/// The peer address comes from [`ConnectInfo`]; a request without one is
/// refused as well.
pub async fn loopback_only(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    match peer {
        Some(addr) if addr.ip().to_canonical().is_loopback() => Ok(next.run(request).await),
        _ => {
            DEV_REQUESTS_REJECTED.inc();
            warn!(
                peer = ?peer,
                path = %request.uri().path(),
                "Rejected maintenance request from non-loopback client"
            );
            Err(StatusCode::FORBIDDEN)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{middleware, routing::get, Router};
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use tower::ServiceExt;

    async fn dummy_handler() -> &'static str {
        "OK"
    }

    fn app() -> Router {
        Router::new()
            .route("/dev/test", get(dummy_handler))
            .layer(middleware::from_fn(loopback_only))
    }

    fn request_from(ip: Option<IpAddr>) -> Request<Body> {
        let mut request = Request::builder()
            .uri("/dev/test")
            .body(Body::empty())
            .unwrap();
        if let Some(ip) = ip {
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::new(ip, 50000)));
        }
        request
    }

    #[tokio::test]
    async fn test_loopback_v4_allowed() {
        let response = app()
            .oneshot(request_from(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_loopback_v6_allowed() {
        let response = app()
            .oneshot(request_from(Some(IpAddr::V6(Ipv6Addr::LOCALHOST))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_mapped_loopback_allowed() {
        let mapped = Ipv4Addr::LOCALHOST.to_ipv6_mapped();
        let response = app()
            .oneshot(request_from(Some(IpAddr::V6(mapped))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_remote_client_rejected() {
        let response = app()
            .oneshot(request_from(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_peer_address_rejected() {
        let response = app().oneshot(request_from(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
