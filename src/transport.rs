// src/transport.rs
//
// Исходящий путь сообщений. Оптимистичная вставка в Pending идёт через тот же
// сигнатурный путь, что и все остальные источники, поэтому повтор отправки
// того же текста в том же окне не плодит строк. Провал отправки оставляет
// сообщение в Failed: видимым и повторяемым, никогда не потерянным молча.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::db::message::{Message, MessageRepo, MessageStatus};
use crate::db::{now_ms, StoreError};
use crate::remote::{RemoteApi, RemoteError, SendMessageRequest};
use crate::signature::SignatureEngine;

// Типы ошибок для исходящего транспорта
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Network is not available")]
    NetworkUnavailable,

    #[error("Max retry count reached for operation")]
    MaxRetryCountReached,

    #[error("Server rejected message: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// Счетчик повторных попыток
#[derive(Debug, Clone, Default)]
pub struct RetryCounter {
    counters: Arc<Mutex<HashMap<Uuid, u32>>>,
}

impl RetryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Увеличивает счетчик для данного ID и возвращает новое значение.
    pub async fn increment(&self, id: Uuid) -> u32 {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Возвращает текущее значение счетчика для данного ID.
    pub async fn get(&self, id: Uuid) -> u32 {
        let counters = self.counters.lock().await;
        *counters.get(&id).unwrap_or(&0)
    }

    /// Удаляет счетчик для данного ID.
    pub async fn remove(&self, id: Uuid) {
        let mut counters = self.counters.lock().await;
        counters.remove(&id);
    }
}

/// Отправитель сообщений: один экземпляр на аккаунт (owner_number).
pub struct MessageSender {
    api: Arc<dyn RemoteApi>,
    messages: Arc<MessageRepo>,
    engine: SignatureEngine,
    owner_number: String,
    retry_counter: RetryCounter,
    network_available: Arc<Mutex<bool>>,
    max_retries: u32,
}

impl MessageSender {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        messages: Arc<MessageRepo>,
        owner_number: &str,
        cfg: &CoreConfig,
    ) -> Self {
        Self {
            api,
            messages,
            engine: SignatureEngine::from_config(cfg),
            owner_number: crate::signature::normalize_phone(owner_number),
            retry_counter: RetryCounter::new(),
            network_available: Arc::new(Mutex::new(true)),
            max_retries: cfg.max_send_retries,
        }
    }

    /// Устанавливает статус доступности сети.
    pub async fn set_network_status(&self, available: bool) {
        let mut status = self.network_available.lock().await;
        *status = available;
        info!("Network status set to: {}", available);
    }

    /// Проверяет, можно ли отправить операцию.
    async fn check_can_send(&self, id: Uuid) -> Result<(), SendError> {
        let network_available = *self.network_available.lock().await;
        if !network_available {
            return Err(SendError::NetworkUnavailable);
        }

        let retry_count = self.retry_counter.get(id).await;
        if retry_count >= self.max_retries {
            return Err(SendError::MaxRetryCountReached);
        }

        Ok(())
    }

    /// Отправка нового сообщения. Возвращает id локальной строки.
    ///
    /// Сначала оптимистичная запись (Pending), затем сетевой вызов; порядок
    /// важен: упавшая сеть не должна терять текст пользователя.
    pub async fn send(
        &self,
        to: &str,
        body: &str,
        media_urls: Vec<String>,
    ) -> Result<Uuid, SendError> {
        let message = Message::outgoing(
            &self.engine,
            &self.owner_number,
            to,
            body,
            media_urls.clone(),
            now_ms(),
        );
        let signature = message.signature.clone();
        let mut id = message.id;

        let inserted = self.messages.insert_if_absent(message).await?;
        if !inserted {
            // Повтор той же отправки: работаем с уже существующей строкой
            match self.messages.get_by_signature(&signature).await? {
                Some(existing) => id = existing.id,
                None => return Err(StoreError::NotFound.into()),
            }
        }

        self.dispatch(id, to, body, media_urls).await?;
        Ok(id)
    }

    /// Повторная отправка всех Failed-сообщений. Возвращает число успешных.
    pub async fn retry_failed(&self) -> Result<usize, SendError> {
        let failed = self.messages.get_by_status(MessageStatus::Failed).await?;
        let mut sent = 0usize;
        for message in failed {
            match self
                .dispatch(
                    message.id,
                    &message.to_number,
                    &message.body,
                    message.media_urls.clone(),
                )
                .await
            {
                Ok(()) => sent += 1,
                Err(SendError::MaxRetryCountReached) => {
                    warn!("message {} exhausted retries", message.id);
                }
                Err(e) => {
                    error!("retry of message {} failed: {}", message.id, e);
                }
            }
        }
        Ok(sent)
    }

    /// Один сетевой вызов с переводом статусов Sending -> Sent | Failed.
    async fn dispatch(
        &self,
        id: Uuid,
        to: &str,
        body: &str,
        media_urls: Vec<String>,
    ) -> Result<(), SendError> {
        self.check_can_send(id).await?;
        self.messages.set_status(id, MessageStatus::Sending).await?;

        let req = SendMessageRequest {
            from_number: self.owner_number.clone(),
            to_number: crate::signature::normalize_phone(to),
            body: body.to_string(),
            media_urls,
        };

        match self.api.send_message(&req).await {
            Ok(resp) if resp.success => {
                self.messages.mark_sent(id, now_ms()).await?;
                self.retry_counter.remove(id).await;
                info!("message {} sent", id);
                Ok(())
            }
            Ok(resp) => {
                // Отказ сервера: нормальный исход, не исключение
                self.messages.mark_failed(id).await?;
                self.retry_counter.increment(id).await;
                let reason = resp.message.unwrap_or_else(|| "rejected".into());
                warn!("message {} rejected: {}", id, reason);
                Err(SendError::Rejected(reason))
            }
            Err(e) => {
                self.messages.mark_failed(id).await?;
                self.retry_counter.increment(id).await;
                error!("message {} send failed: {}", id, e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_db;
    use crate::remote::mock::MockRemoteApi;
    use std::sync::atomic::Ordering;

    async fn setup(api: Arc<MockRemoteApi>) -> MessageSender {
        let conn = open_in_memory_db().await.expect("in-memory db");
        let messages = Arc::new(MessageRepo::new(conn));
        MessageSender::new(api, messages, "+15551234567", &CoreConfig::default())
    }

    #[tokio::test]
    async fn test_retry_counter() {
        let counter = RetryCounter::new();
        let id = Uuid::new_v4();

        assert_eq!(counter.get(id).await, 0, "Initial retry count should be 0");
        assert_eq!(counter.increment(id).await, 1);
        assert_eq!(counter.increment(id).await, 2);

        counter.remove(id).await;
        assert_eq!(counter.get(id).await, 0, "Retry count should be 0 after removal");
    }

    #[tokio::test]
    async fn test_send_success_marks_sent() {
        let api = Arc::new(MockRemoteApi::new());
        let sender = setup(api.clone()).await;

        let id = sender.send("5559876543", "Hi", vec![]).await.unwrap();
        let stored = sender.messages.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(api.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_failure_marks_failed_and_retryable() {
        let api = Arc::new(MockRemoteApi::new());
        api.fail_sends.store(true, Ordering::SeqCst);
        let sender = setup(api.clone()).await;

        let err = sender.send("5559876543", "Hi", vec![]).await.unwrap_err();
        assert!(matches!(err, SendError::Remote(_)));

        // Сообщение не потеряно: ровно одна строка в Failed
        let failed = sender.messages.get_by_status(MessageStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);

        // Сеть починилась: ретрай доводит до Sent
        api.fail_sends.store(false, Ordering::SeqCst);
        assert_eq!(sender.retry_failed().await.unwrap(), 1);
        let stored = sender.messages.get(failed[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_resend_same_text_is_single_row() {
        let api = Arc::new(MockRemoteApi::new());
        api.fail_sends.store(true, Ordering::SeqCst);
        let sender = setup(api.clone()).await;

        let first = sender.send("5559876543", "Hi", vec![]).await.unwrap_err();
        assert!(matches!(first, SendError::Remote(_)));
        api.fail_sends.store(false, Ordering::SeqCst);
        // Пользователь жмёт "отправить ещё раз" в том же 5-минутном окне
        let id = sender.send("5559876543", "Hi", vec![]).await.unwrap();

        let msgs = sender
            .messages
            .get_for_conversation("5559876543", 10, 0)
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1, "повтор отправки не плодит строк");
        assert_eq!(msgs[0].id, id);
        assert_eq!(msgs[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_server_rejection_is_rejected_error() {
        let api = Arc::new(MockRemoteApi::new());
        api.reject_sends.store(true, Ordering::SeqCst);
        let sender = setup(api).await;

        let err = sender.send("5559876543", "Hi", vec![]).await.unwrap_err();
        match err {
            SendError::Rejected(reason) => assert_eq!(reason, "quota exceeded"),
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_network_gate() {
        let api = Arc::new(MockRemoteApi::new());
        let sender = setup(api.clone()).await;
        sender.set_network_status(false).await;

        let err = sender.send("5559876543", "Hi", vec![]).await.unwrap_err();
        assert!(matches!(err, SendError::NetworkUnavailable));
        // До сети вызов не дошёл
        assert_eq!(api.sends.load(Ordering::SeqCst), 0);
        // Но сообщение лежит в Pending и ждёт
        let pending = sender.messages.get_by_status(MessageStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exhausted() {
        let api = Arc::new(MockRemoteApi::new());
        api.fail_sends.store(true, Ordering::SeqCst);
        let sender = setup(api).await;

        let _ = sender.send("5559876543", "Hi", vec![]).await;
        for _ in 0..3 {
            let _ = sender.retry_failed().await;
        }
        // Счётчик дошёл до лимита: dispatch больше не пытается
        let failed = sender.messages.get_by_status(MessageStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        let count = sender.retry_counter.get(failed[0].id).await;
        assert!(count >= sender.max_retries);
    }
}
