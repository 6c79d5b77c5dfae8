// src/realtime/connection.rs
//
// Состояние долговременного duplex-соединения отделено от разбора событий:
// политику переподключения можно тестировать без единого payload-а.
// DISCONNECTED -> CONNECTING -> CONNECTED -> {RECONNECTING | ERROR} -> DISCONNECTED

use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::CoreConfig;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("channel: {0}")]
    Channel(String),
    #[error("connection is in error state")]
    ConnectionFailed,
    #[error("ack timeout")]
    AckTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Duplex-канал событий. Реализация (socket-транспорт) живёт снаружи ядра,
/// тесты подставляют свою.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn connect(&self) -> Result<(), RealtimeError>;
    async fn disconnect(&self);
    async fn emit(&self, event: &str, payload: Value) -> Result<(), RealtimeError>;
    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, RealtimeError>;
    /// None - поток закрыт (обрыв соединения).
    async fn recv(&self) -> Option<(String, Value)>;
}

/// Чистый расчёт паузы перед попыткой attempt (с нуля): экспонента с потолком.
/// Джиттер передаётся снаружи, чтобы функция оставалась тестируемой.
pub fn backoff_delay_ms(cfg: &CoreConfig, attempt: u32, jitter_ms: u64) -> u64 {
    let exp = cfg
        .reconnect_base_delay_ms
        .saturating_mul(1u64 << attempt.min(16));
    exp.min(cfg.reconnect_max_delay_ms) + jitter_ms
}

/// Супервизор соединения: хранит состояние, очередь регистрации идентичности
/// и выполняет реконнект с экспоненциальной паузой.
pub struct ConnectionSupervisor {
    channel: Arc<dyn EventChannel>,
    state: RwLock<ConnectionState>,
    state_tx: broadcast::Sender<ConnectionState>,
    /// Текущая идентичность (номер). Регистрация, запрошенная до коннекта,
    /// лежит здесь и проигрывается на ближайшем успешном подключении.
    identity: Mutex<Option<String>>,
    auth_token: String,
    cfg: CoreConfig,
}

impl ConnectionSupervisor {
    pub fn new(channel: Arc<dyn EventChannel>, auth_token: &str, cfg: CoreConfig) -> Self {
        let (state_tx, _) = broadcast::channel(16);
        Self {
            channel,
            state: RwLock::new(ConnectionState::Disconnected),
            state_tx,
            identity: Mutex::new(None),
            auth_token: auth_token.to_string(),
            cfg,
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut guard = self.state.write().await;
        if *guard != next {
            info!("realtime connection: {:?} -> {:?}", *guard, next);
            *guard = next;
            let _ = self.state_tx.send(next);
        }
    }

    /// Регистрирует идентичность подписчика. До коннекта - откладывается,
    /// после - эмитится сразу; на каждом реконнекте проигрывается заново.
    pub async fn register_identity(&self, number: &str) -> Result<(), RealtimeError> {
        {
            let mut identity = self.identity.lock().await;
            *identity = Some(number.to_string());
        }
        if self.state().await == ConnectionState::Connected {
            self.emit_registration(number).await;
        }
        Ok(())
    }

    async fn emit_registration(&self, number: &str) {
        let payload = json!({ "phoneNumber": number });
        // emit-with-optional-ack: отсутствие подтверждения логируем, но не
        // блокируем уже применённое локальное состояние
        if let Err(e) = self.channel.emit("register_identity", payload).await {
            warn!("identity registration emit failed: {}", e);
        }
    }

    /// Доводит соединение до Connected (или до Error после исчерпания
    /// попыток). На каждом успешном входе в Connected: аутентификация и
    /// проигрывание отложенной регистрации, ровно один раз на подключение.
    pub async fn ensure_connected(&self) -> Result<(), RealtimeError> {
        if self.state().await == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting).await;

        let mut attempt: u32 = 0;
        loop {
            match self.channel.connect().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Connected).await;
                    self.on_connected().await;
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.cfg.reconnect_max_attempts {
                        warn!("giving up after {} connect attempts: {}", attempt, e);
                        self.set_state(ConnectionState::Error).await;
                        self.set_state(ConnectionState::Disconnected).await;
                        return Err(RealtimeError::ConnectionFailed);
                    }
                    let jitter = rand::rng().random_range(0..250u64);
                    let delay = backoff_delay_ms(&self.cfg, attempt, jitter);
                    warn!(
                        "connect attempt {} failed ({}), retrying in {} ms",
                        attempt, e, delay
                    );
                    self.set_state(ConnectionState::Reconnecting).await;
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        }
    }

    async fn on_connected(&self) {
        if let Err(e) = self
            .channel
            .emit("authenticate", json!({ "token": self.auth_token }))
            .await
        {
            warn!("authenticate emit failed: {}", e);
        }
        let identity = self.identity.lock().await.clone();
        if let Some(number) = identity {
            self.emit_registration(&number).await;
        }
    }

    /// Обрыв потока событий: фиксируем и даём ensure_connected пересобрать.
    pub async fn mark_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected).await;
    }

    pub async fn shutdown(&self) {
        self.channel.disconnect().await;
        self.set_state(ConnectionState::Disconnected).await;
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory канал для тестов: события подкладываются снаружи,
    //! эмиты считаются по имени.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    pub struct MockChannel {
        pub inbound_tx: mpsc::UnboundedSender<(String, Value)>,
        inbound_rx: Mutex<mpsc::UnboundedReceiver<(String, Value)>>,
        pub emitted: std::sync::Mutex<Vec<(String, Value)>>,
        /// Сколько раз connect должен упасть, прежде чем пройти.
        pub connect_failures: AtomicU32,
    }

    impl MockChannel {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                inbound_tx: tx,
                inbound_rx: Mutex::new(rx),
                emitted: std::sync::Mutex::new(Vec::new()),
                connect_failures: AtomicU32::new(0),
            }
        }

        pub fn emitted_counts(&self) -> HashMap<String, usize> {
            let mut out = HashMap::new();
            for (name, _) in self.emitted.lock().unwrap().iter() {
                *out.entry(name.clone()).or_insert(0) += 1;
            }
            out
        }

        pub fn push_event(&self, name: &str, payload: Value) {
            let _ = self.inbound_tx.send((name.to_string(), payload));
        }
    }

    #[async_trait]
    impl EventChannel for MockChannel {
        async fn connect(&self) -> Result<(), RealtimeError> {
            let remaining = self.connect_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RealtimeError::Channel("refused".into()));
            }
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn emit(&self, event: &str, payload: Value) -> Result<(), RealtimeError> {
            self.emitted
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
            Ok(())
        }

        async fn emit_with_ack(
            &self,
            event: &str,
            payload: Value,
        ) -> Result<Value, RealtimeError> {
            self.emit(event, payload).await?;
            Ok(json!({ "ok": true }))
        }

        async fn recv(&self) -> Option<(String, Value)> {
            self.inbound_rx.lock().await.recv().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockChannel;
    use super::*;
    use std::sync::atomic::Ordering;

    fn fast_cfg() -> CoreConfig {
        CoreConfig {
            reconnect_base_delay_ms: 1,
            reconnect_max_delay_ms: 4,
            reconnect_max_attempts: 3,
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_register_before_connect_replays_once() {
        let channel = Arc::new(MockChannel::new());
        let sup = ConnectionSupervisor::new(channel.clone(), "token", fast_cfg());

        // Регистрация до коннекта: ничего не эмитится
        sup.register_identity("5551234567").await.unwrap();
        assert!(channel.emitted.lock().unwrap().is_empty());

        sup.ensure_connected().await.unwrap();
        let counts = channel.emitted_counts();
        assert_eq!(counts.get("register_identity"), Some(&1), "ровно одна эмиссия");
        assert_eq!(counts.get("authenticate"), Some(&1));
    }

    #[tokio::test]
    async fn test_register_while_connected_emits_immediately() {
        let channel = Arc::new(MockChannel::new());
        let sup = ConnectionSupervisor::new(channel.clone(), "token", fast_cfg());
        sup.ensure_connected().await.unwrap();

        sup.register_identity("5551234567").await.unwrap();
        assert_eq!(channel.emitted_counts().get("register_identity"), Some(&1));
    }

    #[tokio::test]
    async fn test_reregistered_on_reconnect() {
        let channel = Arc::new(MockChannel::new());
        let sup = ConnectionSupervisor::new(channel.clone(), "token", fast_cfg());
        sup.register_identity("5551234567").await.unwrap();
        sup.ensure_connected().await.unwrap();

        sup.mark_disconnected().await;
        sup.ensure_connected().await.unwrap();
        assert_eq!(
            channel.emitted_counts().get("register_identity"),
            Some(&2),
            "по одной регистрации на каждое подключение"
        );
    }

    #[tokio::test]
    async fn test_retries_then_connects() {
        let channel = Arc::new(MockChannel::new());
        channel.connect_failures.store(2, Ordering::SeqCst);
        let sup = ConnectionSupervisor::new(channel.clone(), "token", fast_cfg());

        sup.ensure_connected().await.unwrap();
        assert_eq!(sup.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let channel = Arc::new(MockChannel::new());
        channel.connect_failures.store(10, Ordering::SeqCst);
        let sup = ConnectionSupervisor::new(channel.clone(), "token", fast_cfg());

        let err = sup.ensure_connected().await.unwrap_err();
        assert!(matches!(err, RealtimeError::ConnectionFailed));
        assert_eq!(sup.state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let cfg = CoreConfig {
            reconnect_base_delay_ms: 100,
            reconnect_max_delay_ms: 1_000,
            ..CoreConfig::default()
        };
        assert_eq!(backoff_delay_ms(&cfg, 0, 0), 100);
        assert_eq!(backoff_delay_ms(&cfg, 1, 0), 200);
        assert_eq!(backoff_delay_ms(&cfg, 2, 0), 400);
        // Потолок
        assert_eq!(backoff_delay_ms(&cfg, 10, 0), 1_000);
        // Джиттер добавляется поверх
        assert_eq!(backoff_delay_ms(&cfg, 0, 37), 137);
    }
}
