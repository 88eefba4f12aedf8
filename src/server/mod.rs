//! HTTP API surface.
//!
//! Builds the axum router with the middleware stack (panic recovery →
//! request log → CORS → per-IP rate limit → bearer auth) and serves it
//! over plain TCP or TLS. Graceful shutdown is driven by an
//! `axum_server::Handle` owned by the caller.

pub mod error;
pub mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware as axum_mw;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;

use crate::config::HttpConfig;
use crate::core::SessionManager;

use middleware::RateLimiter;

/// Shared state for handlers and middleware.
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    /// `None` disables auth (debug mode only).
    pub auth_token: Option<String>,
}

/// Converts a recovered handler panic into a logged 500.
pub(crate) fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    log::error!("handler panicked: {detail}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

/// Assembles the full router. `/health` sits outside the auth layer;
/// everything under `/api` requires the bearer token.
pub fn build_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let api = Router::new()
        .route("/session/create", post(handlers::create_session))
        .route("/session/{id}/command", post(handlers::send_command))
        .route("/session/{id}/output", get(handlers::get_output))
        .route("/session/{id}/status", get(handlers::get_status))
        .route("/session/{id}/resize", post(handlers::resize))
        .route("/session/{id}", delete(handlers::terminate))
        .route("/sessions", get(handlers::list_sessions))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            middleware::bearer_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api)
        .layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            middleware::rate_limit,
        ))
        .layer(middleware::cors_layer(cors_origins))
        .layer(axum_mw::from_fn(middleware::preflight_no_content))
        .layer(axum_mw::from_fn(middleware::request_log))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Binds and serves until the handle signals shutdown.
pub async fn serve(router: Router, config: &HttpConfig, handle: Handle) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid listen address: {e}"),
            )
        })?;
    let make_service = router.into_make_service_with_connect_info::<SocketAddr>();

    match &config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path).await?;
            log::info!("listening on https://{addr}");
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(make_service)
                .await
        }
        None => {
            log::info!("listening on http://{addr}");
            axum_server::bind(addr)
                .handle(handle)
                .serve(make_service)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceType;
    use crate::core::session_manager::SessionPolicy;
    use std::time::Duration;

    fn test_state(
        base: &std::path::Path,
        auth_token: Option<&str>,
        limiter: RateLimiter,
    ) -> Arc<AppState> {
        let policy = SessionPolicy {
            base_path: base.to_path_buf(),
            max_sessions_per_user: 3,
            output_buffer_capacity: 100,
            idle_timeout: Duration::from_secs(1800),
            command: "cat".to_string(),
            workspace_type: WorkspaceType::Isolated,
        };
        Arc::new(AppState {
            manager: Arc::new(SessionManager::new(policy, None, None)),
            rate_limiter: Arc::new(limiter),
            auth_token: auth_token.map(|t| t.to_string()),
        })
    }

    /// Binds the full router on an ephemeral port.
    async fn start_server(state: Arc<AppState>, origins: &[String]) -> SocketAddr {
        let router = build_router(state, origins);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    /// Generous limits so unrelated tests never trip the limiter.
    fn roomy_limiter() -> RateLimiter {
        RateLimiter::with_limits(1000.0, 1000.0)
    }

    fn origins() -> Vec<String> {
        vec!["http://localhost".to_string()]
    }

    async fn create_session(client: &reqwest::Client, addr: SocketAddr, user: &str) -> String {
        let response = client
            .post(format!("http://{addr}/api/session/create"))
            .json(&json!({ "userId": user, "credentials": { "primary": "K1" } }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "active");
        body["sessionId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_is_open_and_reports_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(test_state(dir.path(), Some("tok"), roomy_limiter()), &origins()).await;

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_api_requires_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(test_state(dir.path(), Some("tok"), roomy_limiter()), &origins()).await;
        let client = reqwest::Client::new();

        let missing = client
            .get(format!("http://{addr}/api/sessions"))
            .header("X-User-ID", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 401);

        let wrong = client
            .get(format!("http://{addr}/api/sessions"))
            .bearer_auth("wrong")
            .header("X-User-ID", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status().as_u16(), 401);

        let right = client
            .get(format!("http://{addr}/api/sessions"))
            .bearer_auth("tok")
            .header("X-User-ID", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(right.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_create_send_output_terminate_flow() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(test_state(dir.path(), None, roomy_limiter()), &origins()).await;
        let client = reqwest::Client::new();

        let sid = create_session(&client, addr, "alice").await;

        let sent = client
            .post(format!("http://{addr}/api/session/{sid}/command"))
            .header("X-User-ID", "alice")
            .json(&json!({ "command": "hello\n" }))
            .send()
            .await
            .unwrap();
        assert_eq!(sent.status().as_u16(), 200);
        let body: serde_json::Value = sent.json().await.unwrap();
        assert_eq!(body["success"], true);

        // `cat` echoes the input back; poll until the output lands.
        let mut chunks = Vec::new();
        for _ in 0..30 {
            let body: serde_json::Value = client
                .get(format!("http://{addr}/api/session/{sid}/output?clear=true"))
                .header("X-User-ID", "alice")
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            chunks = body["output"].as_array().unwrap().clone();
            if !chunks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!chunks.is_empty(), "expected output within 3s");
        assert!(chunks[0]["timestamp"].is_string());

        // Let any trailing echo land and drain it, then a clear-read
        // right after must come back empty.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = client
            .get(format!("http://{addr}/api/session/{sid}/output?clear=true"))
            .header("X-User-ID", "alice")
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = client
            .get(format!("http://{addr}/api/session/{sid}/output?clear=true"))
            .header("X-User-ID", "alice")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body["output"].as_array().unwrap().is_empty());

        let deleted = client
            .delete(format!("http://{addr}/api/session/{sid}"))
            .header("X-User-ID", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status().as_u16(), 200);

        let after = client
            .get(format!("http://{addr}/api/session/{sid}/status"))
            .header("X-User-ID", "alice")
            .send()
            .await
            .unwrap();
        assert_eq!(after.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn test_cross_user_access_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None, roomy_limiter());
        let addr = start_server(Arc::clone(&state), &origins()).await;
        let client = reqwest::Client::new();

        let sid = create_session(&client, addr, "alice").await;

        let response = client
            .get(format!("http://{addr}/api/session/{sid}/status"))
            .header("X-User-ID", "bob")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        // Missing identity is indistinguishable from a mismatch.
        let response = client
            .get(format!("http://{addr}/api/session/{sid}/status"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        state.manager.cleanup_all().await;
    }

    #[tokio::test]
    async fn test_invalid_inputs_are_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), None, roomy_limiter());
        let addr = start_server(Arc::clone(&state), &origins()).await;
        let client = reqwest::Client::new();

        // Traversal-shaped user id
        let response = client
            .post(format!("http://{addr}/api/session/create"))
            .json(&json!({ "userId": "../etc", "credentials": { "primary": "K1" } }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // Malformed JSON
        let response = client
            .post(format!("http://{addr}/api/session/create"))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);

        // Resize with a missing field and with a zero dimension
        let sid = create_session(&client, addr, "alice").await;
        let response = client
            .post(format!("http://{addr}/api/session/{sid}/resize"))
            .header("X-User-ID", "alice")
            .json(&json!({ "cols": 80 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);

        let response = client
            .post(format!("http://{addr}/api/session/{sid}/resize"))
            .header("X-User-ID", "alice")
            .json(&json!({ "cols": 0, "rows": 24 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);

        let response = client
            .post(format!("http://{addr}/api/session/{sid}/resize"))
            .header("X-User-ID", "alice")
            .json(&json!({ "cols": 120, "rows": 40 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);

        state.manager.cleanup_all().await;
    }

    #[tokio::test]
    async fn test_per_ip_rate_limit_trips_on_burst() {
        let dir = tempfile::tempdir().unwrap();
        // Real limits for this test: 10 rps, burst 20.
        let addr = start_server(test_state(dir.path(), None, RateLimiter::new()), &origins()).await;
        let client = reqwest::Client::new();

        let mut ok = 0;
        let mut limited = 0;
        for _ in 0..25 {
            let status = client
                .get(format!("http://{addr}/health"))
                .send()
                .await
                .unwrap()
                .status()
                .as_u16();
            match status {
                200 => ok += 1,
                429 => limited += 1,
                other => panic!("unexpected status {other}"),
            }
        }
        assert!(ok >= 20, "burst of 20 must pass, got {ok}");
        assert!(limited >= 3, "expected the burst to trip 429s, got {limited}");

        // The bucket refills; a later request goes through again.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .status()
            .as_u16();
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_cors_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let addr = start_server(
            test_state(dir.path(), None, roomy_limiter()),
            &["http://allowed.example".to_string()],
        )
        .await;
        let client = reqwest::Client::new();

        let preflight = client
            .request(reqwest::Method::OPTIONS, format!("http://{addr}/health"))
            .header("Origin", "http://allowed.example")
            .header("Access-Control-Request-Method", "GET")
            .send()
            .await
            .unwrap();
        assert_eq!(preflight.status().as_u16(), 204);
        assert_eq!(
            preflight
                .headers()
                .get("access-control-allow-origin")
                .and_then(|v| v.to_str().ok()),
            Some("http://allowed.example")
        );

        let denied = client
            .get(format!("http://{addr}/health"))
            .header("Origin", "http://evil.example")
            .send()
            .await
            .unwrap();
        assert!(denied
            .headers()
            .get("access-control-allow-origin")
            .is_none());
    }

    #[tokio::test]
    async fn test_panic_recovery_returns_500() {
        let app = Router::new()
            .route(
                "/boom",
                get(|| async { panic!("kaboom"); #[allow(unreachable_code)] axum::http::StatusCode::OK }),
            )
            .layer(CatchPanicLayer::custom(handle_panic));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}/boom")).await.unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "internal error");
    }
}
