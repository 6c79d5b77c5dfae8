// src/call/backend.rs
//
// Контракт call-control бэкенда (SIP-стек живёт снаружи). Каждой живой сессии
// соответствует регистрация колбэка состояния; колбэки приходят асинхронно
// по mpsc и являются авторитетными для машины состояний.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Идентификатор звонка на стороне бэкенда.
pub type BackendCallId = String;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("backend: {0}")]
    Backend(String),
    #[error("no such call session")]
    SessionNotFound,
    #[error("invalid command in state {0}")]
    InvalidCommand(String),
    #[error(transparent)]
    Store(#[from] crate::db::StoreError),
}

/// Состояния, которые репортит бэкенд. Ядро сводит их к своему жизненному
/// циклу в session.rs.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCallState {
    Initializing,
    Calling,
    Ringing,
    EarlyMedia,
    Confirmed,
    Busy,
    Rejected,
    Failed { reason: String },
    Disconnected { reason: Option<String> },
}

pub type StateCallbackSender = mpsc::UnboundedSender<(BackendCallId, BackendCallState)>;

#[async_trait]
pub trait CallControl: Send + Sync {
    async fn make_call(&self, number: &str, line: i64) -> Result<BackendCallId, CallError>;
    async fn answer_call(&self, id: &BackendCallId) -> Result<(), CallError>;
    async fn reject_call(&self, id: &BackendCallId) -> Result<(), CallError>;
    async fn end_call(&self, id: &BackendCallId) -> Result<(), CallError>;
    async fn hold_call(&self, id: &BackendCallId) -> Result<(), CallError>;
    async fn resume_call(&self, id: &BackendCallId) -> Result<(), CallError>;
    async fn set_mute(&self, id: &BackendCallId, muted: bool) -> Result<(), CallError>;
    async fn send_dtmf(&self, id: &BackendCallId, digits: &str) -> Result<(), CallError>;

    /// Регистрация/снятие колбэка состояния. Снятие обязано быть идемпотентным:
    /// финализация сессии и терминальный колбэк могут гоняться.
    async fn register_state_callback(
        &self,
        id: &BackendCallId,
        tx: StateCallbackSender,
    ) -> Result<(), CallError>;
    async fn unregister_state_callback(&self, id: &BackendCallId);
}

#[cfg(test)]
pub mod mock {
    //! Заглушка бэкенда: записывает вызовы, позволяет тестам подавать
    //! авторитетные колбэки вручную.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockCallControl {
        next_id: AtomicUsize,
        pub invocations: Mutex<Vec<String>>,
        callbacks: Mutex<HashMap<BackendCallId, StateCallbackSender>>,
        pub unregistered: Mutex<Vec<BackendCallId>>,
    }

    impl MockCallControl {
        pub fn new() -> Self {
            Self::default()
        }

        fn record(&self, op: &str, id: &str) {
            self.invocations.lock().unwrap().push(format!("{}:{}", op, id));
        }

        pub fn invocation_count(&self, op: &str) -> usize {
            self.invocations
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.starts_with(op))
                .count()
        }

        /// Подаёт авторитетный колбэк, как это сделал бы SIP-стек.
        pub fn push_state(&self, id: &BackendCallId, state: BackendCallState) {
            if let Some(tx) = self.callbacks.lock().unwrap().get(id) {
                let _ = tx.send((id.clone(), state));
            }
        }
    }

    #[async_trait]
    impl CallControl for MockCallControl {
        async fn make_call(&self, number: &str, _line: i64) -> Result<BackendCallId, CallError> {
            let id = format!("backend-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.record("make_call", number);
            Ok(id)
        }

        async fn answer_call(&self, id: &BackendCallId) -> Result<(), CallError> {
            self.record("answer_call", id);
            Ok(())
        }

        async fn reject_call(&self, id: &BackendCallId) -> Result<(), CallError> {
            self.record("reject_call", id);
            Ok(())
        }

        async fn end_call(&self, id: &BackendCallId) -> Result<(), CallError> {
            self.record("end_call", id);
            Ok(())
        }

        async fn hold_call(&self, id: &BackendCallId) -> Result<(), CallError> {
            self.record("hold_call", id);
            Ok(())
        }

        async fn resume_call(&self, id: &BackendCallId) -> Result<(), CallError> {
            self.record("resume_call", id);
            Ok(())
        }

        async fn set_mute(&self, id: &BackendCallId, muted: bool) -> Result<(), CallError> {
            self.record(if muted { "mute" } else { "unmute" }, id);
            Ok(())
        }

        async fn send_dtmf(&self, id: &BackendCallId, digits: &str) -> Result<(), CallError> {
            self.record("send_dtmf", digits);
            let _ = id;
            Ok(())
        }

        async fn register_state_callback(
            &self,
            id: &BackendCallId,
            tx: StateCallbackSender,
        ) -> Result<(), CallError> {
            self.callbacks.lock().unwrap().insert(id.clone(), tx);
            Ok(())
        }

        async fn unregister_state_callback(&self, id: &BackendCallId) {
            self.callbacks.lock().unwrap().remove(id);
            self.unregistered.lock().unwrap().push(id.clone());
        }
    }
}
