// ====================================================================================
// src/status.rs - 状态模板与映射
// ====================================================================================
use crate::models::{PresenceLevel, PublishRequest, RoundPhase, Snapshot};

const COUNT_PLACEHOLDER: &str = "{count}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKey {
    WaitingForPlayers,
    NoPlayers,
    Players,
    RoundEnded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTemplate {
    pub text_template: String,
    pub presence_level: PresenceLevel,
}

impl StatusTemplate {
    pub fn new(text_template: impl Into<String>, presence_level: PresenceLevel) -> Self {
        Self { text_template: text_template.into(), presence_level }
    }

    pub fn render(&self, player_count: u32) -> PublishRequest {
        PublishRequest {
            text: self.text_template.replace(COUNT_PLACEHOLDER, &player_count.to_string()),
            level: self.presence_level,
        }
    }
}

// 每个状态键对应一个模板，加载后不再修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTemplates {
    pub waiting_for_players: StatusTemplate,
    pub no_players: StatusTemplate,
    pub players: StatusTemplate,
    pub round_ended: StatusTemplate,
}

impl StatusTemplates {
    pub fn get(&self, key: StatusKey) -> &StatusTemplate {
        match key {
            StatusKey::WaitingForPlayers => &self.waiting_for_players,
            StatusKey::NoPlayers => &self.no_players,
            StatusKey::Players => &self.players,
            StatusKey::RoundEnded => &self.round_ended,
        }
    }
}

impl Default for StatusTemplates {
    fn default() -> Self {
        Self {
            waiting_for_players: StatusTemplate::new("Waiting for players...", PresenceLevel::Idle),
            no_players: StatusTemplate::new("Players: 0", PresenceLevel::Idle),
            players: StatusTemplate::new("Players: {count}", PresenceLevel::Online),
            round_ended: StatusTemplate::new("Round ended", PresenceLevel::Idle),
        }
    }
}

pub fn status_key_for(snapshot: &Snapshot) -> StatusKey {
    match snapshot.round_phase {
        RoundPhase::WaitingForPlayers | RoundPhase::Unknown => StatusKey::WaitingForPlayers,
        RoundPhase::InProgress if snapshot.player_count == 0 => StatusKey::NoPlayers,
        RoundPhase::InProgress => StatusKey::Players,
        RoundPhase::Ended => StatusKey::RoundEnded,
    }
}

// 由快照计算应显示的状态，纯函数
pub fn compute_desired_status(snapshot: &Snapshot, templates: &StatusTemplates) -> PublishRequest {
    templates.get(status_key_for(snapshot)).render(snapshot.player_count)
}
