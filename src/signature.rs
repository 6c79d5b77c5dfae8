// src/signature.rs
//
// Сигнатура сообщения: детерминированная идентичность, по которой
// дедуплицируются сообщения из трёх источников (локальная отправка,
// синхронизация, realtime-события). Чистые функции, без побочных эффектов.

use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::config::CoreConfig;

/// Какой хеш используем для сигнатуры.
///
/// Sha256 — штатный режим. Djb2 — деградированный, но всё ещё детерминированный
/// запасной вариант: слабая сигнатура допустима, потеря дедупликации — нет.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashBackend {
    #[default]
    Sha256,
    Djb2,
}

#[derive(Debug, Clone)]
pub struct SignatureEngine {
    bucket_ms: i64,
    backend: HashBackend,
}

impl SignatureEngine {
    pub fn new(bucket_ms: i64, backend: HashBackend) -> Self {
        // Нулевая или отрицательная корзина превратила бы деление в панику;
        // молча поджимаем до 1 мс.
        let bucket_ms = bucket_ms.max(1);
        Self { bucket_ms, backend }
    }

    pub fn from_config(cfg: &CoreConfig) -> Self {
        Self::new(cfg.signature_bucket_ms, HashBackend::default())
    }

    /// Считает сигнатуру: `normalized_from|normalized_to|body|bucket`, затем хеш.
    /// Никогда не возвращает ошибку: на любом входе получается строка.
    pub fn compute(&self, from: &str, to: &str, body: &str, created_at_ms: i64) -> String {
        let from = normalize_phone(from);
        let to = normalize_phone(to);
        let bucket = time_bucket(created_at_ms, self.bucket_ms);
        let material = format!("{}|{}|{}|{}", from, to, body, bucket);
        match self.backend {
            HashBackend::Sha256 => sha256_hex(material.as_bytes()),
            HashBackend::Djb2 => format!("{:016x}", djb2_64(material.as_bytes())),
        }
    }
}

/// Приводит номер к каноническому 10-значному виду: выбрасываем всё,
/// кроме цифр; если цифр 11 и больше, отбрасываем код страны слева.
pub fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 11 {
        digits[digits.len() - 10..].to_string()
    } else {
        digits
    }
}

/// Номер корзины: created_at / bucket_ms. Для отрицательных времён (часы
/// устройства до эпохи) используем деление с округлением вниз, чтобы
/// соседние значения не попадали в одну корзину с нулём.
pub fn time_bucket(created_at_ms: i64, bucket_ms: i64) -> i64 {
    created_at_ms.div_euclid(bucket_ms.max(1))
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        // запись в String не может не удаться
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// djb2, расширенный до 64 бит. Не криптографический, но стабильный.
fn djb2_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 5381;
    for &b in data {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SignatureEngine {
        SignatureEngine::new(300_000, HashBackend::Sha256)
    }

    #[test]
    fn test_normalize_strips_punctuation() {
        assert_eq!(normalize_phone("+1 (555) 123-4567"), "5551234567");
        assert_eq!(normalize_phone("555.123.4567"), "5551234567");
    }

    #[test]
    fn test_normalize_drops_country_code() {
        assert_eq!(normalize_phone("15551234567"), "5551234567");
        assert_eq!(normalize_phone("+75551234567"), "5551234567");
        // Короткие номера не трогаем
        assert_eq!(normalize_phone("911"), "911");
    }

    #[test]
    fn test_same_message_same_signature() {
        let e = engine();
        let a = e.compute("+15551234567", "5559876543", "Hi", 1_700_000_000_000);
        let b = e.compute("5551234567", "+1 (555) 987-6543", "Hi", 1_700_000_000_000);
        assert_eq!(a, b, "нормализация номеров должна давать одну сигнатуру");
    }

    #[test]
    fn test_jitter_within_bucket() {
        let e = engine();
        let t = 1_700_000_000_000i64;
        // Скорректируем t на границу корзины, чтобы проверить джиттер внутри неё
        let t = t - t.rem_euclid(300_000);
        let a = e.compute("5551234567", "5559876543", "Hi", t);
        let b = e.compute("5551234567", "5559876543", "Hi", t + 90_000);
        assert_eq!(a, b, "90 секунд джиттера внутри одной корзины");
    }

    #[test]
    fn test_bucket_boundary() {
        let e = engine();
        let t = 1_700_000_100_000i64;
        let t0 = t - t.rem_euclid(300_000);
        // 4 минуты: та же корзина, 6 минут: другая
        assert_eq!(
            e.compute("5551234567", "5559876543", "Hi", t0),
            e.compute("5551234567", "5559876543", "Hi", t0 + 240_000)
        );
        assert_ne!(
            e.compute("5551234567", "5559876543", "Hi", t0),
            e.compute("5551234567", "5559876543", "Hi", t0 + 360_000)
        );
    }

    #[test]
    fn test_different_body_different_signature() {
        let e = engine();
        let a = e.compute("5551234567", "5559876543", "Hi", 1_700_000_000_000);
        let b = e.compute("5551234567", "5559876543", "Hi!", 1_700_000_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn test_fallback_deterministic() {
        let e = SignatureEngine::new(300_000, HashBackend::Djb2);
        let a = e.compute("5551234567", "5559876543", "Hi", 1_700_000_000_000);
        let b = e.compute("5551234567", "5559876543", "Hi", 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_never_panics_on_garbage() {
        let e = engine();
        // Пустые номера, не-ASCII, отрицательное время
        let _ = e.compute("", "", "", -42);
        let _ = e.compute("абв", "☎", "\u{0000}", i64::MIN);
    }

    #[test]
    fn test_negative_time_buckets() {
        assert_eq!(time_bucket(-1, 300_000), -1);
        assert_eq!(time_bucket(0, 300_000), 0);
        assert_eq!(time_bucket(-300_000, 300_000), -1);
    }
}
