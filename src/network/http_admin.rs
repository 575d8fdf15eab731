use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::HttpBody as _;
use hyper::header::{self, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::Serialize;

use crate::sync::{NewOperation, SyncEngine, SyncError};

/// Bearer tokens guarding the admin surface. With neither token set the
/// surface is open; the read-only token may only issue `GET`s.
#[derive(Debug, Clone, Default)]
pub struct AdminAuth {
    pub admin_token: Option<String>,
    pub readonly_token: Option<String>,
}

impl AdminAuth {
    pub fn from_env() -> Self {
        Self {
            admin_token: std::env::var("SYNCLINE_AUTH_TOKEN_ADMIN").ok(),
            readonly_token: std::env::var("SYNCLINE_AUTH_TOKEN_READONLY").ok(),
        }
    }

    fn required(&self) -> bool {
        self.admin_token.is_some() || self.readonly_token.is_some()
    }
}

#[derive(Clone)]
struct AdminState {
    engine: Arc<SyncEngine>,
    auth: Arc<AdminAuth>,
    max_body_bytes: usize,
}

pub async fn run_http_admin(
    addr: SocketAddr,
    engine: Arc<SyncEngine>,
    auth: AdminAuth,
    max_body_bytes: usize,
) -> Result<(), hyper::Error> {
    let state = AdminState {
        engine,
        auth: Arc::new(auth),
        max_body_bytes,
    };

    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { handle(req, state).await }
            }))
        }
    });

    log::info!("Admin HTTP listening on {addr}");
    hyper::Server::bind(&addr).serve(make_svc).await
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => respond(status, "application/json", bytes),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &format!("encoding failed: {e}")),
    }
}

fn json_error(status: StatusCode, msg: &str) -> Response<Body> {
    let body = serde_json::json!({ "error": msg }).to_string();
    respond(status, "application/json", body)
}

fn sync_error_response(err: &SyncError) -> Response<Body> {
    let status = match err {
        SyncError::Validation(_) => StatusCode::BAD_REQUEST,
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::QueueFull { .. } | SyncError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, &err.to_string())
}

fn authenticate_http(req: &Request<Body>, auth: &AdminAuth) -> Option<Response<Body>> {
    if !auth.required() {
        return None;
    }

    let raw = match req.headers().get(header::AUTHORIZATION) {
        Some(v) => v,
        None => return Some(json_error(StatusCode::UNAUTHORIZED, "missing authorization header")),
    };
    let raw_str = match raw.to_str() {
        Ok(v) => v,
        Err(_) => return Some(json_error(StatusCode::UNAUTHORIZED, "invalid authorization header")),
    };

    let token = match raw_str.strip_prefix("Bearer ") {
        Some(token) => token,
        None => return Some(json_error(StatusCode::UNAUTHORIZED, "invalid authorization scheme")),
    };

    if auth.admin_token.as_deref() == Some(token) {
        return None;
    }
    if auth.readonly_token.as_deref() == Some(token) {
        if req.method() == Method::GET {
            return None;
        }
        return Some(json_error(
            StatusCode::FORBIDDEN,
            "write operations are not allowed for read-only role",
        ));
    }

    Some(json_error(StatusCode::UNAUTHORIZED, "invalid token"))
}

enum ReadBodyLimitedError {
    TooLarge,
    Hyper(hyper::Error),
}

impl From<hyper::Error> for ReadBodyLimitedError {
    fn from(e: hyper::Error) -> Self {
        Self::Hyper(e)
    }
}

async fn read_body_limited(mut body: Body, max_bytes: usize) -> Result<Vec<u8>, ReadBodyLimitedError> {
    let mut out = Vec::new();
    while let Some(next) = body.data().await {
        let chunk = next?;
        if out.len() + chunk.len() > max_bytes {
            return Err(ReadBodyLimitedError::TooLarge);
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Read and decode a JSON body, mapping failures onto 413/400 responses.
async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Body>,
    max_bytes: usize,
) -> Result<T, Response<Body>> {
    let too_large = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .map(|len| len > max_bytes)
        .unwrap_or(false);
    if too_large {
        return Err(json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"));
    }

    let bytes = match read_body_limited(req.into_body(), max_bytes).await {
        Ok(bytes) => bytes,
        Err(ReadBodyLimitedError::TooLarge) => {
            return Err(json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload too large"))
        }
        Err(ReadBodyLimitedError::Hyper(e)) => {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
            ))
        }
    };

    serde_json::from_slice(&bytes)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}")))
}

async fn handle(req: Request<Body>, state: AdminState) -> Result<Response<Body>, Infallible> {
    if let Some(resp) = authenticate_http(&req, &state.auth) {
        return Ok(resp);
    }

    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let engine = &state.engine;

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &engine.get_health()),
        (Method::GET, ["metrics"]) => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4",
            engine.get_health().render_prometheus(),
        ),
        (Method::GET, ["stats"]) => json_response(StatusCode::OK, &engine.get_stats()),
        (Method::GET, ["dead-letters"]) => json_response(StatusCode::OK, &engine.get_dead_letters()),
        (Method::DELETE, ["dead-letters"]) => match engine.clear_dead_letters() {
            Ok(cleared) => json_response(StatusCode::OK, &serde_json::json!({ "cleared": cleared })),
            Err(e) => sync_error_response(&e),
        },
        (Method::POST, ["dead-letters", id, "retry"]) => match engine.retry_dead_letter(id) {
            Ok(retried) => json_response(StatusCode::OK, &serde_json::json!({ "retried": retried })),
            Err(e) => sync_error_response(&e),
        },
        (Method::POST, ["circuit-breaker", "reset"]) => {
            engine.reset_circuit_breaker();
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "state": engine.circuit_state() }),
            )
        }
        (Method::POST, ["error-recovery", "reset"]) => match engine.reset_error_recovery() {
            Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" })),
            Err(e) => sync_error_response(&e),
        },
        (Method::GET, ["operations", id]) => match engine.get_operation(id) {
            Some(op) => json_response(StatusCode::OK, &op),
            None => json_error(StatusCode::NOT_FOUND, "operation not found"),
        },
        (Method::POST, ["operations"]) => {
            match read_json::<NewOperation>(req, state.max_body_bytes).await {
                Ok(new) => match engine.enqueue(new) {
                    Ok(op) => json_response(StatusCode::CREATED, &op),
                    Err(e) => sync_error_response(&e),
                },
                Err(resp) => resp,
            }
        }
        (Method::POST, ["operations", "orphans"]) => {
            match read_json::<HashSet<String>>(req, state.max_body_bytes).await {
                Ok(valid) => match engine.remove_orphaned_operations(&valid) {
                    Ok(removed) => {
                        json_response(StatusCode::OK, &serde_json::json!({ "removed": removed }))
                    }
                    Err(e) => sync_error_response(&e),
                },
                Err(resp) => resp,
            }
        }
        (Method::POST, ["operations", "purge"]) => match engine.purge_completed() {
            Ok(purged) => json_response(StatusCode::OK, &serde_json::json!({ "purged": purged })),
            Err(e) => sync_error_response(&e),
        },
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::sync::{RawError, RemoteExecutor, SyncOperation};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl RemoteExecutor for Unreachable {
        async fn execute(&self, _op: &SyncOperation) -> Result<(), RawError> {
            Err(RawError::Network("offline".into()))
        }
    }

    fn state(auth: AdminAuth, max_body_bytes: usize) -> AdminState {
        let engine = SyncEngine::builder(SyncConfig::default())
            .executor(Arc::new(Unreachable))
            .build()
            .expect("engine");
        AdminState {
            engine: Arc::new(engine),
            auth: Arc::new(auth),
            max_body_bytes,
        }
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_stats_reflect_operation() {
        let state = state(AdminAuth::default(), 1024);

        let resp = handle(
            request(
                Method::POST,
                "/operations",
                r#"{"table":"docs","recordId":"r1","type":"create","payload":{"t":1}}"#,
            ),
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let op = body_json(resp).await;
        assert_eq!(op["status"], "pending");

        let resp = handle(request(Method::GET, "/stats", ""), state.clone())
            .await
            .unwrap();
        let stats = body_json(resp).await;
        assert_eq!(stats["pending"], 1);
        assert_eq!(stats["total"], 1);
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_fields_and_bad_json() {
        let state = state(AdminAuth::default(), 1024);

        let resp = handle(
            request(Method::POST, "/operations", r#"{"table":"docs"}"#),
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = handle(request(Method::POST, "/operations", "{not json"), state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let state = state(AdminAuth::default(), 16);
        let body = r#"{"table":"docs","recordId":"r1","type":"create"}"#;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/operations")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();

        let resp = handle(req, state.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(state.engine.get_stats().total, 0);
    }

    #[tokio::test]
    async fn readonly_token_cannot_write() {
        let auth = AdminAuth {
            admin_token: Some("root".into()),
            readonly_token: Some("viewer".into()),
        };
        let state = state(auth, 1024);

        let mut req = request(Method::GET, "/health", "");
        req.headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer viewer"));
        let resp = handle(req, state.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let mut req = request(Method::DELETE, "/dead-letters", "");
        req.headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer viewer"));
        let resp = handle(req, state.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = handle(request(Method::GET, "/stats", ""), state.clone())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let mut req = request(Method::POST, "/circuit-breaker/reset", "");
        req.headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer root"));
        let resp = handle(req, state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["state"], "CLOSED");
    }

    #[tokio::test]
    async fn metrics_exports_expected_keys() {
        let state = state(AdminAuth::default(), 1024);
        let resp = handle(request(Method::GET, "/metrics", ""), state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("syncline_operations_total{outcome=\"enqueued\"} 0"));
        assert!(text.contains("syncline_circuit_state 0"));
        assert!(text.contains("syncline_dead_letters 0"));
    }

    #[tokio::test]
    async fn orphan_removal_takes_valid_id_list() {
        let state = state(AdminAuth::default(), 1024);
        for record in ["keep", "drop"] {
            state
                .engine
                .enqueue(NewOperation::new("docs", record, crate::sync::OperationType::Update))
                .unwrap();
        }

        let resp = handle(
            request(Method::POST, "/operations/orphans", r#"["keep"]"#),
            state.clone(),
        )
        .await
        .unwrap();
        assert_eq!(body_json(resp).await["removed"], 1);
        assert_eq!(state.engine.get_stats().total, 1);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let state = state(AdminAuth::default(), 1024);
        let resp = handle(request(Method::GET, "/nope", ""), state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
