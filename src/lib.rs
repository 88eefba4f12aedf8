//! termbridge — a host-side broker that owns PTY sessions of a wrapped
//! CLI tool and exposes them over an authenticated HTTP API, fed by a
//! poller that translates remote work-queue items into API calls.

pub mod config;
pub mod core;
pub mod poller;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::config::Config;
use crate::core::session_manager::SessionPolicy;
use crate::core::{CredentialCipher, PgStore, SessionManager, SessionStore, VaultError};
use crate::poller::actions::ApiClient;
use crate::poller::queue::QueueClient;
use crate::poller::QueuePoller;
use crate::server::middleware::RateLimiter;
use crate::server::AppState;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid encryption key: {0}")]
    Vault(#[from] VaultError),
    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Wires everything together and serves until SIGINT/SIGTERM.
///
/// Startup order: vault → store (with stale-row recovery) → session
/// manager + reaper → rate limiter + janitor → queue poller → HTTP
/// listener. Shutdown reverses it: graceful HTTP drain (10 s), stop the
/// background tasks, tear down every session, close the store.
pub async fn run(config: Config) -> Result<(), RunError> {
    let cipher = match &config.encryption_key {
        Some(key) => Some(CredentialCipher::new(key)?),
        None => {
            log::warn!(
                "ENCRYPTION_KEY not set; credentials will be stored unencrypted (debug mode only)"
            );
            None
        }
    };
    if config.http.auth_token.is_none() {
        log::warn!("API_AUTH_TOKEN not set; HTTP authentication is disabled (debug mode only)");
    }

    let pg: Option<Arc<PgStore>> = match &config.db {
        Some(db) => match PgStore::connect(db).await {
            Ok(store) => {
                log::info!("durable store connected ({}:{})", db.host, db.port);
                Some(Arc::new(store))
            }
            Err(e) => {
                log::error!("durable store unavailable, continuing in-memory: {e}");
                None
            }
        },
        None => {
            log::info!("no DB_HOST configured, session state is in-memory only");
            None
        }
    };
    let store: Option<Arc<dyn SessionStore>> =
        pg.clone().map(|s| s as Arc<dyn SessionStore>);

    let policy = SessionPolicy {
        base_path: config.session.workspace_base_path.clone(),
        max_sessions_per_user: config.session.max_sessions_per_user,
        output_buffer_capacity: config.session.output_buffer_capacity,
        idle_timeout: config.session.idle_timeout,
        command: config.session.command.clone(),
        workspace_type: config.session.workspace_type,
    };
    let manager = Arc::new(SessionManager::new(policy, cipher, store));
    manager.recover_sessions().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Arc::clone(&manager).start_timeout_reaper(shutdown_rx.clone());

    let rate_limiter = Arc::new(RateLimiter::new());
    let janitor = Arc::clone(&rate_limiter).start_janitor(shutdown_rx.clone());

    let state = Arc::new(AppState {
        manager: Arc::clone(&manager),
        rate_limiter,
        auth_token: config.http.auth_token.clone(),
    });
    let router = server::build_router(state, &config.http.cors_allowed_origins);

    // The poller drives our own API over loopback so queue-driven work
    // passes through the same auth and ownership checks as any caller.
    let api_host = match config.http.host.as_str() {
        "0.0.0.0" | "::" => "127.0.0.1".to_string(),
        host => host.to_string(),
    };
    let scheme = if config.http.tls.is_some() { "https" } else { "http" };
    let api = ApiClient::new(
        format!("{scheme}://{api_host}:{}", config.http.port),
        config.http.auth_token.clone(),
    );
    let poller = Arc::new(QueuePoller::new(
        QueueClient::new(&config.queue),
        api,
        &config.queue,
    ));
    let poller_task = tokio::spawn(Arc::clone(&poller).run(shutdown_rx.clone()));

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            log::info!("shutdown signal received, draining connections");
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });
    }

    server::serve(router, &config.http, handle).await?;

    let _ = shutdown_tx.send(true);
    manager.cleanup_all().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = poller_task.await;
        let _ = reaper.await;
        let _ = janitor.await;
    })
    .await;
    if let Some(pg) = pg {
        pg.close().await;
    }
    log::info!("shutdown complete");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
