// ====================================================================================
// src/error.rs - 自定义错误类型
// ====================================================================================
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

// 启动时的配置错误，只会禁用本功能，不会让宿主进程崩溃
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("DISCORD_BOT_TOKEN must be set when the status bot is enabled")]
    MissingToken,
    #[error("{key} must be a valid number, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be true or false, got {value:?}")]
    InvalidBool { key: &'static str, value: String },
}

// 状态推送端的错误，全部按尽力而为处理
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Presence sink is not connected")]
    NotConnected,
    #[error("Discord rejected the bot token")]
    Unauthorized,
    #[error("Reqwest error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Gateway protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: Invalid API Key")]
    Unauthorized,
    #[error("Bad Request: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };

        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}
