//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::audio::mixer::SourceKind;
use crate::audio::params::{MixSnapshot, MixUpdate};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Attached sources
#[derive(serde::Serialize)]
pub struct SourceStatus {
    pub microphone: bool,
    pub player: bool,
}

/// System status
#[derive(serde::Serialize)]
pub struct SystemStatus {
    pub listeners: usize,
    pub sessions: usize,
    pub alpha: f32,
    #[serde(rename = "micMuted")]
    pub mic_muted: bool,
    pub route: String,
    pub engine_running: bool,
    pub sources: SourceStatus,
    pub uptime_seconds: u64,
}

/// Get system status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let registry = &state.signaling.registry;
    let engine = registry.engine();
    let mix = engine.params().snapshot();

    let status = SystemStatus {
        listeners: registry.listeners(),
        sessions: registry.len(),
        alpha: mix.alpha,
        mic_muted: mix.mic_muted,
        route: engine.current_route().unwrap_or_else(|| engine.resolve()).to_string(),
        engine_running: engine.is_running(),
        sources: SourceStatus {
            microphone: engine.is_attached(SourceKind::Microphone),
            player: engine.is_attached(SourceKind::Player),
        },
        uptime_seconds: state.started.elapsed().as_secs(),
    };

    Json(ApiResponse::ok(status))
}

/// Current mix parameters
pub async fn get_mix(State(state): State<Arc<AppState>>) -> Json<ApiResponse<MixSnapshot>> {
    Json(ApiResponse::ok(state.signaling.mix.current()))
}

/// Update mix parameters and tell every listener
pub async fn set_mix(
    State(state): State<Arc<AppState>>,
    Json(update): Json<MixUpdate>,
) -> (StatusCode, Json<ApiResponse<MixSnapshot>>) {
    if let Some(alpha) = update.alpha {
        if !alpha.is_finite() {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error("alpha must be a finite number")),
            );
        }
    }
    let snapshot = state.signaling.mix.apply(update);
    (StatusCode::OK, Json(ApiResponse::ok(snapshot)))
}
