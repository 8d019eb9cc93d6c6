// ====================================================================================
// src/config.rs - 配置管理
// ====================================================================================
use crate::{
    error::ConfigError,
    models::PresenceLevel,
    status::{StatusTemplate, StatusTemplates},
};
use std::time::Duration;

const TOKEN_PLACEHOLDER: &str = "YOUR_DISCORD_BOT_TOKEN";

pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3);
pub const DEFAULT_PLAYER_LEFT_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_READY_GRACE: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct Config {
    pub enabled: bool,
    pub debug_logging: bool,
    pub discord_token: String,
    pub discord_api_base: String,
    pub bind_address: String,
    pub bridge_api_key: Option<String>,
    pub templates: StatusTemplates,

    // 时间参数
    pub rate_limit_window: Duration,
    pub player_left_delay: Duration,
    pub ready_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // 尝试加载 .env 文件，如果失败则忽略（可能文件不存在）
        if let Err(e) = dotenvy::dotenv() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = parse_bool(&lookup, "STATUS_BOT_ENABLED", true)?;
        let discord_token = lookup("DISCORD_BOT_TOKEN").unwrap_or_default();

        // 关闭状态下不校验令牌
        if enabled && (discord_token.trim().is_empty() || discord_token == TOKEN_PLACEHOLDER) {
            return Err(ConfigError::MissingToken);
        }

        let defaults = StatusTemplates::default();

        Ok(Self {
            enabled,
            debug_logging: parse_bool(&lookup, "DEBUG_LOGGING", false)?,
            discord_token,
            discord_api_base: lookup("DISCORD_API_BASE")
                .unwrap_or_else(|| "https://discord.com/api/v10".to_string()),
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "127.0.0.1:3030".to_string()),
            bridge_api_key: lookup("BRIDGE_API_KEY").filter(|key| !key.is_empty()),
            templates: StatusTemplates {
                waiting_for_players: template(&lookup, "STATUS_WAITING", defaults.waiting_for_players),
                no_players: template(&lookup, "STATUS_NO_PLAYERS", defaults.no_players),
                players: template(&lookup, "STATUS_PLAYERS", defaults.players),
                round_ended: template(&lookup, "STATUS_ROUND_ENDED", defaults.round_ended),
            },
            rate_limit_window: parse_millis(&lookup, "STATUS_RATE_LIMIT_MS", DEFAULT_RATE_LIMIT_WINDOW)?,
            player_left_delay: parse_millis(&lookup, "PLAYER_LEFT_DELAY_MS", DEFAULT_PLAYER_LEFT_DELAY)?,
            ready_grace: parse_millis(&lookup, "READY_GRACE_MS", DEFAULT_READY_GRACE)?,
        })
    }
}

fn template<F>(lookup: &F, prefix: &str, default: StatusTemplate) -> StatusTemplate
where
    F: Fn(&str) -> Option<String>,
{
    let text_template = lookup(&format!("{}_TEXT", prefix)).unwrap_or(default.text_template);
    let presence_level = lookup(&format!("{}_LEVEL", prefix))
        .map(|level| PresenceLevel::parse(&level))
        .unwrap_or(default.presence_level);
    StatusTemplate { text_template, presence_level }
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool { key, value }),
        },
    }
}

fn parse_millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_stock_templates() {
        let config = load(&[("DISCORD_BOT_TOKEN", "abc")]).unwrap();
        assert!(config.enabled);
        assert!(!config.debug_logging);
        assert_eq!(config.templates, StatusTemplates::default());
        assert_eq!(config.rate_limit_window, Duration::from_secs(3));
        assert_eq!(config.player_left_delay, Duration::from_millis(100));
        assert_eq!(config.ready_grace, Duration::from_secs(3));
        assert_eq!(config.bridge_api_key, None);
    }

    #[test]
    fn missing_or_placeholder_token_is_rejected() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingToken)));
        assert!(matches!(
            load(&[("DISCORD_BOT_TOKEN", "YOUR_DISCORD_BOT_TOKEN")]),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn disabled_bot_does_not_need_a_token() {
        let config = load(&[("STATUS_BOT_ENABLED", "false")]).unwrap();
        assert!(!config.enabled);
    }

    #[test]
    fn templates_and_timings_can_be_overridden() {
        let config = load(&[
            ("DISCORD_BOT_TOKEN", "abc"),
            ("STATUS_PLAYERS_TEXT", "{count} online"),
            ("STATUS_PLAYERS_LEVEL", "dnd"),
            ("STATUS_RATE_LIMIT_MS", "5000"),
            ("BRIDGE_API_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(config.templates.players.text_template, "{count} online");
        assert_eq!(config.templates.players.presence_level, PresenceLevel::DoNotDisturb);
        assert_eq!(config.templates.round_ended.text_template, "Round ended");
        assert_eq!(config.rate_limit_window, Duration::from_secs(5));
        assert_eq!(config.bridge_api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = load(&[("DISCORD_BOT_TOKEN", "abc"), ("READY_GRACE_MS", "3s")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { key: "READY_GRACE_MS", .. }));
    }

    #[test]
    fn malformed_bools_are_reported() {
        let err = load(&[("DISCORD_BOT_TOKEN", "abc"), ("DEBUG_LOGGING", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { key: "DEBUG_LOGGING", .. }));
    }
}
