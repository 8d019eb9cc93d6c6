// ====================================================================================
// src/sink.rs - 在线状态推送端接口
// ====================================================================================
use crate::{error::SinkError, models::PresenceLevel};
use futures_util::future::BoxFuture;

// 在线状态的推送目标
pub trait PresenceSink: Send + Sync {
    fn is_connected(&self) -> bool;

    // None 表示清除活动
    fn set_activity(&self, text: Option<String>) -> BoxFuture<'_, Result<(), SinkError>>;

    fn set_presence_level(&self, level: PresenceLevel) -> BoxFuture<'_, Result<(), SinkError>>;
}
