// ====================================================================================
// src/main.rs - 应用入口
// ====================================================================================
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod gateway;
mod models;
mod publisher;
mod roster;
mod routes;
mod sink;
mod state;
mod status;
mod tracker;

use config::Config;
use gateway::{GatewayClient, GatewayEvent};
use publisher::DebouncedPublisher;
use roster::InMemoryRoster;
use state::AppState;
use tracker::StateTracker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载配置
    let config = Config::from_env();
    let debug_logging = config.as_ref().map(|c| c.debug_logging).unwrap_or(false);

    // 初始化日志记录
    let default_filter = if debug_logging {
        "server_status_bot=debug,tower_http=debug"
    } else {
        "server_status_bot=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 配置错误只禁用本功能
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Status bot disabled, invalid configuration: {}", e);
            return Ok(());
        }
    };
    if !config.enabled {
        tracing::info!("Status bot is disabled in config.");
        return Ok(());
    }

    let roster = Arc::new(InMemoryRoster::new());
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let tracker = Arc::new(StateTracker::new(roster.clone(), signal_tx, config.player_left_delay));
    let gateway = Arc::new(GatewayClient::new(config.discord_api_base.clone()));
    let publisher = DebouncedPublisher::new(
        gateway.clone(),
        tracker.clone(),
        config.templates.clone(),
        config.rate_limit_window,
    );
    tokio::spawn(publisher.clone().run(signal_rx));

    // 后台连接 Discord，断线自动重连
    {
        let publisher = publisher.clone();
        let ready_grace = config.ready_grace;
        let mut events = gateway.start(config.discord_token.clone());
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    GatewayEvent::Ready { username, discriminator } => {
                        tracing::info!("Discord bot connected as {}#{}", username, discriminator);
                        let publisher = publisher.clone();
                        tokio::spawn(async move { publisher.activate(ready_grace).await });
                    }
                    GatewayEvent::Closed => tracing::warn!("Discord connection closed, status updates paused"),
                }
            }
        });
    }

    let app_state = Arc::new(AppState {
        config: config.clone(),
        roster,
        tracker,
        publisher: publisher.clone(),
        sink: gateway.clone(),
    });

    // 创建Axum路由
    let app = Router::new()
        .route("/health", get(routes::health_check))
        .route("/status", get(routes::get_status))
        .route("/events", post(routes::post_event))
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    // 启动服务器
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Status bot enabled, listening for game events on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 退出前清除机器人状态
    publisher.teardown().await;
    gateway.disconnect().await;
    tracing::info!("Status bot disabled.");

    Ok(())
}

// Ctrl-C 或 SIGTERM 都触发优雅退出
fn shutdown_signal() -> impl Future<Output = ()> {
    // 在返回之前注册，避免信号在首次 poll 前丢失
    #[cfg(unix)]
    let terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match terminate {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down"),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
        }
    }
}
