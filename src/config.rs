// src/config.rs

use serde::Deserialize;

/// Конфигурация ядра. Все временные окна заданы в миллисекундах.
///
/// Окно дедупликации сообщений (5 минут) и окно дедупликации звонков (60 секунд)
/// намеренно вынесены в конфиг: это эвристики, а не константы протокола.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Размер временной корзины для сигнатуры сообщения.
    pub signature_bucket_ms: i64,
    /// Окно, внутри которого два звонка на один номер считаются одним.
    pub call_dedup_window_ms: i64,
    /// Размер страницы при фоновой синхронизации.
    pub sync_page_size: i64,
    /// Базовая задержка перед переподключением realtime-канала.
    pub reconnect_base_delay_ms: u64,
    /// Потолок задержки переподключения.
    pub reconnect_max_delay_ms: u64,
    /// Сколько раз подряд пытаемся переподключиться, прежде чем перейти в Error.
    pub reconnect_max_attempts: u32,
    /// Лимит повторных отправок одного сообщения.
    pub max_send_retries: u32,
    /// Ёмкость LRU-кэша контактов.
    pub contact_cache_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            signature_bucket_ms: 300_000,
            call_dedup_window_ms: 60_000,
            sync_page_size: 100,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            reconnect_max_attempts: 8,
            max_send_retries: 3,
            contact_cache_capacity: 100,
        }
    }
}

impl CoreConfig {
    /// Читает конфиг из JSON-строки. Отсутствующие поля берутся из Default.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_json_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.signature_bucket_ms, 300_000);
        assert_eq!(cfg.call_dedup_window_ms, 60_000);
    }

    #[test]
    fn test_partial_json() {
        // Частичный JSON: указанное поле переопределяется, остальные из Default
        let cfg = CoreConfig::from_json(r#"{"signature_bucket_ms": 600000}"#).unwrap();
        assert_eq!(cfg.signature_bucket_ms, 600_000);
        assert_eq!(cfg.sync_page_size, 100);
    }

    #[test]
    fn test_invalid_json() {
        assert!(CoreConfig::from_json("{ not json }").is_err());
    }
}
