//! Health and introspection HTTP endpoints
//!
//! - `GET /health`: 204 once the overlay is up, 500 otherwise
//! - `GET /config`: the effective configuration as JSON

use crate::config::Config;
use crate::error::Result;
use crate::manager::ManagerStatus;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
struct HttpState {
    status: ManagerStatus,
    config: Arc<Config>,
}

/// Build the router serving `/health` and `/config`
pub fn router(status: ManagerStatus, config: Arc<Config>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/config", get(config_handler))
        .with_state(HttpState { status, config })
}

/// Serve on an already bound listener until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    status: ManagerStatus,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Starting HTTP server");
    }

    axum::serve(listener, router(status, config))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Bind `address` and serve until `shutdown` is cancelled
pub async fn bind_and_serve(
    address: &str,
    status: ManagerStatus,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(address).await?;
    serve(listener, status, config, shutdown).await
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    if state.status.is_started() {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn config_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.config.as_ref().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (status, body)
    }

    async fn start(status: ManagerStatus, config: Config) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        tokio::spawn(serve(listener, status, Arc::new(config), token.clone()));
        (addr, token)
    }

    #[tokio::test]
    async fn test_health_follows_status() {
        let status = ManagerStatus::default();
        let (addr, token) = start(status.clone(), Config::default()).await;

        assert_eq!(get(addr, "/health").await.0, 500);

        status.set_started(true);
        assert_eq!(get(addr, "/health").await.0, 204);

        token.cancel();
    }

    #[tokio::test]
    async fn test_config_is_json() {
        let config = Config {
            namespace: Some("kube-system".to_string()),
            ..Config::default()
        };
        let (addr, token) = start(ManagerStatus::default(), config).await;

        let (status, body) = get(addr, "/config").await;
        assert_eq!(status, 200);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["namespace"], "kube-system");
        assert_eq!(value["vxlan"]["interface"], "kubelan");
        assert_eq!(value["vxlan"]["mtu"], "auto");

        token.cancel();
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            ManagerStatus::default(),
            Arc::new(Config::default()),
            token.clone(),
        ));

        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
