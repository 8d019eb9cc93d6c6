// ====================================================================================
// src/routes.rs - HTTP路由处理
// ====================================================================================
use crate::{
    config::Config,
    error::AppError,
    models::{LifecycleEvent, PublishRequest, Snapshot},
    state::AppState,
    tracker::SnapshotSource,
};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub snapshot: Snapshot,
    pub desired: PublishRequest,
    pub connected: bool,
    pub update_pending: bool,
}

// 健康检查
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

// 当前状态
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        snapshot: state.tracker.snapshot(),
        desired: state.publisher.desired_status(),
        connected: state.sink.is_connected(),
        update_pending: state.publisher.is_update_pending(),
    })
}

// 接收游戏服务器的生命周期事件
pub async fn post_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<LifecycleEvent>,
) -> Result<StatusCode, AppError> {
    check_auth(&headers, &state.config)?;

    // 先更新名单，再通知跟踪器
    match &event {
        LifecycleEvent::PlayerJoined { player_id, is_dummy } => {
            require_player_id(player_id)?;
            state.roster.insert(player_id, *is_dummy);
        }
        LifecycleEvent::PlayerLeft { player_id } => {
            require_player_id(player_id)?;
            if !state.roster.remove(player_id) {
                tracing::debug!("Player {} left but was not on the roster", player_id);
            }
        }
        _ => {}
    }

    state.tracker.handle(&event);
    Ok(StatusCode::ACCEPTED)
}

fn require_player_id(player_id: &str) -> Result<(), AppError> {
    if player_id.trim().is_empty() {
        return Err(AppError::BadRequest("player_id must not be empty".to_string()));
    }
    Ok(())
}

// 未配置密钥时不校验
fn check_auth(headers: &HeaderMap, config: &Config) -> Result<(), AppError> {
    let Some(expected) = &config.bridge_api_key else {
        return Ok(());
    };
    match headers.get("X-Api-Key") {
        Some(key) if key.as_bytes() == expected.as_bytes() => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}
