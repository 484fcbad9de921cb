//! The relay's HTTP(S) front end.
//!
//! Nodes send JSON bodies even on GET requests, so every route reads the raw
//! body and decodes it itself.
use std::convert::Infallible;
use std::net::SocketAddr;

use http::status::StatusCode;
use http::Response;
use hyper::body::Bytes;
use hyper::Body;
use k8s_openapi::api::core::v1::Pod as KubePod;
use relay_api::session::{new_session, SESSION_HEADER};
use relay_api::{CreateRequest, LogRequest};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use warp::{Filter, Rejection, Reply};

use crate::config::Config;
use crate::error::RelayError;
use crate::relay::{uid_from_body, Relay};

/// Serve `relay` until `shutdown` is cancelled.
pub async fn serve(
    relay: Relay,
    config: &Config,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let routes = routes(relay);
    let addr = SocketAddr::new(config.address, config.port);
    let signal = async move { shutdown.cancelled().await };

    if config.tls.enabled {
        let cert = config
            .tls
            .cert_file
            .as_ref()
            .ok_or_else(|| {
                anyhow::anyhow!("TLS is enabled but no certificate file is configured")
            })?;
        let key = config
            .tls
            .key_file
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("TLS is enabled but no key file is configured"))?;
        let mut server = warp::serve(routes).tls().cert_path(cert).key_path(key);
        if let Some(ca) = &config.tls.ca_cert_file {
            server = server.client_auth_required_path(ca);
        }
        let (addr, server) = server.bind_with_graceful_shutdown(addr, signal);
        info!(%addr, "Relay listening with TLS");
        server.await;
    } else {
        let (addr, server) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, signal)?;
        info!(%addr, "Relay listening");
        server.await;
    }
    Ok(())
}

/// Every relay route.
pub fn routes(relay: Relay) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let with_relay = warp::any().map(move || relay.clone());
    let session = warp::header::optional::<String>(SESSION_HEADER)
        .map(|session: Option<String>| session.unwrap_or_else(|| new_session("Request")));
    let get_or_post = warp::get().or(warp::post()).unify();

    let create = warp::post()
        .and(warp::path!("create"))
        .and(with_relay.clone())
        .and(session.clone())
        .and(warp::body::bytes())
        .and_then(handle_create);

    let delete = warp::delete()
        .or(warp::post())
        .unify()
        .and(warp::path!("delete"))
        .and(with_relay.clone())
        .and(session.clone())
        .and(warp::body::bytes())
        .and_then(handle_delete);

    let status = get_or_post
        .clone()
        .and(warp::path!("status"))
        .and(with_relay.clone())
        .and(session.clone())
        .and(warp::body::bytes())
        .and_then(handle_status);

    let logs = get_or_post
        .clone()
        .and(warp::path!("getLogs"))
        .and(with_relay.clone())
        .and(session.clone())
        .and(warp::body::bytes())
        .and_then(handle_get_logs);

    let update_cache = warp::post()
        .and(warp::path!("updateCache"))
        .and(with_relay.clone())
        .and(session.clone())
        .and(warp::body::bytes())
        .and_then(handle_update_cache);

    let ping = get_or_post
        .and(warp::path!("pinglink").or(warp::path!("ping")).unify())
        .and(with_relay)
        .and(session)
        .and_then(handle_ping);

    create
        .or(delete)
        .or(status)
        .or(logs)
        .or(update_cache)
        .or(ping)
        .with(warp::trace::request())
}

async fn handle_create(
    relay: Relay,
    session: String,
    body: Bytes,
) -> Result<Response<Body>, Infallible> {
    let request: CreateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_response(RelayError::from(e), &session)),
    };
    match relay.create(request, &session).await {
        Ok(reply) => Ok(with_code(
            StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Body::from(reply.body),
            &session,
        )),
        Err(e) => Ok(error_response(e, &session)),
    }
}

async fn handle_delete(
    relay: Relay,
    session: String,
    body: Bytes,
) -> Result<Response<Body>, Infallible> {
    let pod: KubePod = match serde_json::from_slice(&body) {
        Ok(pod) => pod,
        Err(e) => return Ok(error_response(RelayError::from(e), &session)),
    };
    let outcome = relay.delete(pod, &session).await;
    Ok(json_response(outcome.status, &outcome.pods, &session))
}

async fn handle_status(
    relay: Relay,
    session: String,
    body: Bytes,
) -> Result<Response<Body>, Infallible> {
    let pods: Vec<KubePod> = if body.iter().all(u8::is_ascii_whitespace) {
        Vec::new()
    } else {
        match serde_json::from_slice(&body) {
            Ok(pods) => pods,
            Err(e) => return Ok(error_response(RelayError::from(e), &session)),
        }
    };
    match relay.status(pods, &session).await {
        Ok(statuses) => Ok(json_response(StatusCode::OK, &statuses, &session)),
        Err(e) => Ok(error_response(e, &session)),
    }
}

async fn handle_get_logs(
    relay: Relay,
    session: String,
    body: Bytes,
) -> Result<Response<Body>, Infallible> {
    let request: LogRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Ok(error_response(RelayError::from(e), &session)),
    };
    match relay.logs(request, &session).await {
        Ok(stream) => Ok(with_code(StatusCode::OK, Body::wrap_stream(stream), &session)),
        Err(e) => Ok(error_response(e, &session)),
    }
}

async fn handle_update_cache(
    relay: Relay,
    session: String,
    body: Bytes,
) -> Result<Response<Body>, Infallible> {
    match uid_from_body(&body) {
        Some(uid) => {
            relay.update_cache(&uid);
            Ok(with_code(StatusCode::OK, Body::from("Updated cache"), &session))
        }
        None => Ok(with_code(
            StatusCode::BAD_REQUEST,
            Body::from("No pod UID in request"),
            &session,
        )),
    }
}

async fn handle_ping(relay: Relay, session: String) -> Result<Response<Body>, Infallible> {
    let code = relay.ping(&session).await;
    let body = if code == StatusCode::OK {
        Body::from("0")
    } else {
        Body::from("Backend unreachable")
    };
    Ok(with_code(code, body, &session))
}

fn json_response<T: Serialize>(code: StatusCode, value: &T, session: &str) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(raw) => {
            let mut response = with_code(code, Body::from(raw), session);
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            error!(error = %e, "Unable to encode response");
            with_code(
                StatusCode::INTERNAL_SERVER_ERROR,
                Body::from(e.to_string()),
                session,
            )
        }
    }
}

fn error_response(e: RelayError, session: &str) -> Response<Body> {
    let code = e.status_code();
    debug!(error = %e, %code, "Request failed");
    with_code(code, Body::from(e.to_string()), session)
}

fn with_code(code: StatusCode, body: Body, session: &str) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = code;
    if let Ok(value) = http::HeaderValue::from_str(session) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::StatusCache;
    use crate::relay::test::{pod, RecordingBackend};
    use relay_api::{PodIdentity, PodStatus};
    use std::sync::Arc;

    fn relay(backend: Arc<RecordingBackend>) -> Relay {
        Relay::new(Arc::new(StatusCache::new()), backend, &Config::default())
    }

    #[tokio::test]
    async fn status_route_accepts_get_with_body() {
        let backend = Arc::new(RecordingBackend::reachable());
        let filter = routes(relay(backend));
        let response = warp::test::request()
            .method("GET")
            .path("/status")
            .json(&vec![pod("u1", "Running")])
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let statuses: Vec<PodStatus> = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(statuses[0].pod_uid, "u1");
    }

    #[tokio::test]
    async fn empty_status_body_returns_everything() {
        let backend = Arc::new(RecordingBackend::reachable());
        let relay = relay(backend);
        relay.cache().put(vec![PodStatus {
            pod_uid: "cached".to_string(),
            ..Default::default()
        }]);
        let filter = routes(relay);
        let response = warp::test::request()
            .method("GET")
            .path("/status")
            .reply(&filter)
            .await;
        let statuses: Vec<PodStatus> = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn delete_route_answers_with_identities() {
        let backend = Arc::new(RecordingBackend::reachable());
        let filter = routes(relay(backend));
        for _ in 0..2 {
            let response = warp::test::request()
                .method("DELETE")
                .path("/delete")
                .header(SESSION_HEADER, "Delete#1")
                .json(&pod("u1", "Running"))
                .reply(&filter)
                .await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[SESSION_HEADER], "Delete#1");
            let pods: Vec<PodIdentity> = serde_json::from_slice(response.body()).unwrap();
            assert_eq!(pods[0].uid, "u1");
        }
    }

    #[tokio::test]
    async fn conflicting_log_options_are_a_server_error() {
        let backend = Arc::new(RecordingBackend::reachable());
        let filter = routes(relay(backend.clone()));
        let response = warp::test::request()
            .method("GET")
            .path("/getLogs")
            .body(r#"{"PodUID": "u1", "Opts": {"Tail": 10, "Bytes": 20}}"#)
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.body().as_ref(),
            b"Both Tail and LimitBytes set. Set only one of them"
        );
        assert_eq!(*backend.log_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn logs_stream_backend_bytes() {
        let backend = Arc::new(RecordingBackend::reachable());
        let filter = routes(relay(backend));
        let response = warp::test::request()
            .method("POST")
            .path("/getLogs")
            .body(r#"{"PodUID": "u1", "ContainerName": "c1"}"#)
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"hello\n");
    }

    #[tokio::test]
    async fn update_cache_evicts() {
        let backend = Arc::new(RecordingBackend::reachable());
        let relay = relay(backend);
        relay.cache().put(vec![PodStatus {
            pod_uid: "u1".to_string(),
            ..Default::default()
        }]);
        let cache = relay.cache().clone();
        let filter = routes(relay);
        let response = warp::test::request()
            .method("POST")
            .path("/updateCache")
            .body("u1")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"Updated cache");
        assert!(!cache.contains("u1"));
    }

    #[tokio::test]
    async fn ping_routes_report_backend_health() {
        let filter = routes(relay(Arc::new(RecordingBackend::reachable())));
        let response = warp::test::request()
            .method("POST")
            .path("/pinglink")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"0");

        let filter = routes(relay(Arc::new(RecordingBackend::default())));
        let response = warp::test::request().path("/ping").reply(&filter).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn malformed_create_is_a_bad_request() {
        let filter = routes(relay(Arc::new(RecordingBackend::reachable())));
        let response = warp::test::request()
            .method("POST")
            .path("/create")
            .body("not json")
            .reply(&filter)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
