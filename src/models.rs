// ====================================================================================
// src/models.rs - 数据模型定义
// ====================================================================================
use serde::{Deserialize, Serialize};

// 对局阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    WaitingForPlayers,
    InProgress,
    Ended,
    #[default]
    Unknown,
}

// 游戏服务器当前状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub player_count: u32,
    pub round_phase: RoundPhase,
}

// 机器人在线状态等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceLevel {
    Online,
    Idle,
    DoNotDisturb,
    Invisible,
}

impl PresenceLevel {
    // 无法识别的值回退为 Idle
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => PresenceLevel::Online,
            "idle" => PresenceLevel::Idle,
            "dnd" | "do_not_disturb" => PresenceLevel::DoNotDisturb,
            "offline" | "invisible" => PresenceLevel::Invisible,
            other => {
                tracing::warn!("Unknown presence level {:?}, falling back to idle", other);
                PresenceLevel::Idle
            }
        }
    }

    // Discord 网关使用的状态字符串
    pub fn as_discord_status(self) -> &'static str {
        match self {
            PresenceLevel::Online => "online",
            PresenceLevel::Idle => "idle",
            PresenceLevel::DoNotDisturb => "dnd",
            PresenceLevel::Invisible => "invisible",
        }
    }
}

// 每次发布时临时生成，不做保存
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishRequest {
    pub text: String,
    pub level: PresenceLevel,
}

// 游戏服务器推送过来的生命周期事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    PlayerJoined {
        player_id: String,
        #[serde(default)]
        is_dummy: bool,
    },
    PlayerLeft {
        player_id: String,
    },
    RoundStarted,
    WaitingForPlayers,
    RoundEnded,
}
