// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{CallError, Result};
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    // ВАЖНО: Эта настройка работает только в debug режиме!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    // В продакшене все дополнительные настройки отключены
    pub const ENABLE_LOGGING: bool = false;
}

/// Публичный STUN сервер по умолчанию (TURN не используется)
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Настройки звонков. Передаются явно в каждую операцию.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    /// Коллекция комнат в хранилище документов
    pub rooms_collection: String,
    /// Подколлекция кандидатов инициатора
    pub caller_candidates: String,
    /// Подколлекция кандидатов ответчика
    pub callee_candidates: String,
    pub video_width: u32,
    pub video_height: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![ServerConfig {
                id: "default-stun".into(),
                r#type: "stun".into(),
                url: DEFAULT_STUN_URL.into(),
                username: None,
                credential: None,
            }],
            rooms_collection: "rooms".into(),
            caller_candidates: "callerCandidates".into(),
            callee_candidates: "calleeCandidates".into(),
            video_width: 1280,
            video_height: 720,
        }
    }
}

impl CallConfig {
    /// Разбирает JSON конфигурацию; отсутствующие поля берутся по умолчанию
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: CallConfig = serde_json::from_str(raw)
            .map_err(|e| CallError::InvalidConfig(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Конфигурация без ICE серверов: только host-кандидаты (локальные звонки и тесты)
    pub fn host_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(CallError::InvalidConfig(
                    "server URL cannot be empty".into(),
                ));
            }

            if server.r#type == "turn"
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(CallError::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }

        let names = [
            &self.rooms_collection,
            &self.caller_candidates,
            &self.callee_candidates,
        ];
        if names.iter().any(|n| n.is_empty() || n.contains('/')) {
            return Err(CallError::InvalidConfig(
                "collection names must be non-empty single path segments".into(),
            ));
        }
        if self.caller_candidates == self.callee_candidates {
            return Err(CallError::InvalidConfig(
                "caller and callee candidate collections must differ".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_single_public_stun_server() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].url, DEFAULT_STUN_URL);
        assert_eq!((config.video_width, config.video_height), (1280, 720));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = CallConfig::from_json(r#"{"roomsCollection":"calls"}"#).unwrap();
        assert_eq!(config.rooms_collection, "calls");
        assert_eq!(config.caller_candidates, "callerCandidates");
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let raw = r#"{"iceServers":[{"id":"t","type":"turn","url":"turn.example.org:3478"}]}"#;
        assert!(matches!(
            CallConfig::from_json(raw),
            Err(CallError::InvalidConfig(_))
        ));
    }

    #[test]
    fn same_candidate_collections_are_rejected() {
        let config = CallConfig {
            callee_candidates: "callerCandidates".into(),
            ..CallConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
