//! HTTP server
//!
//! | Path | Description |
//! |------|-------------|
//! | `/ws` | Signaling for the raw microphone feed |
//! | `/ws_player` | Signaling for the raw player feed |
//! | `/ws_mix` | Signaling for the server-routed program feed |
//! | `/api/status` | Listener count, mix, route, uptime |
//! | `/api/mix` | Read (GET) or change (POST) the mix |
//! | everything else | Static listener page, when configured |

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use axum_extra::{headers::UserAgent, TypedHeader};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::audio::engine::Feed;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::signaling::SignalingContext;
use crate::ui::handlers;
use crate::ui::websocket;

/// Shared state for all handlers
pub struct AppState {
    pub signaling: SignalingContext,
    pub started: Instant,
}

pub struct WebServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: ServerConfig, signaling: SignalingContext) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                signaling,
                started: Instant::now(),
            }),
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/ws", get(ws_microphone))
            .route("/ws_player", get(ws_player))
            .route("/ws_mix", get(ws_program))
            .route("/api/status", get(handlers::get_status))
            .route("/api/mix", get(handlers::get_mix).post(handlers::set_mix));

        match &self.config.static_dir {
            Some(dir) if dir.is_dir() => {
                tracing::info!("Serving static assets from {}", dir.display());
                router = router.fallback_service(ServeDir::new(dir));
            }
            Some(dir) => tracing::warn!("Static dir {} not found, skipping", dir.display()),
            None => {}
        }

        router
            .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
            .with_state(self.state.clone())
    }

    /// Bind the first free port and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = bind_first_available(
            &self.config.bind_address,
            self.config.base_port,
            self.config.port_attempts,
        )?;
        let addr = listener.local_addr()?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        tracing::info!("Listening on http://{}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn ws_microphone(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    agent: Option<TypedHeader<UserAgent>>,
) -> Response {
    websocket::upgrade(ws, state, Feed::Microphone, agent.map(|TypedHeader(a)| a.as_str().to_string()))
}

async fn ws_player(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    agent: Option<TypedHeader<UserAgent>>,
) -> Response {
    websocket::upgrade(ws, state, Feed::Player, agent.map(|TypedHeader(a)| a.as_str().to_string()))
}

async fn ws_program(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    agent: Option<TypedHeader<UserAgent>>,
) -> Response {
    websocket::upgrade(ws, state, Feed::Program, agent.map(|TypedHeader(a)| a.as_str().to_string()))
}

/// Probe `attempts` ports upward from `base_port`, returning the first bound
/// non-blocking listener.
pub fn bind_first_available(
    bind_address: &str,
    base_port: u16,
    attempts: u16,
) -> Result<std::net::TcpListener> {
    let ip: IpAddr = bind_address
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address {}: {}", bind_address, e)))?;

    for offset in 0..attempts {
        let Some(port) = base_port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::new(ip, port);
        match bind_tcp(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!("Port {} unavailable: {}", port, e),
        }
    }
    Err(Error::Config(format!(
        "no free port in {}..{}",
        base_port,
        base_port.saturating_add(attempts)
    )))
}

fn bind_tcp(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_skips_taken_port() {
        let first = bind_first_available("127.0.0.1", 0, 1).unwrap();
        let taken = first.local_addr().unwrap().port();

        let next = bind_first_available("127.0.0.1", taken, 20).unwrap();
        assert_ne!(next.local_addr().unwrap().port(), taken);
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            bind_first_available("not-an-ip", 8080, 1),
            Err(Error::Config(_))
        ));
    }
}
