// src/realtime/mod.rs
//
// Маршрутизатор realtime-событий. Гарантия канала - at-least-once без
// порядка между реконнектами, поэтому каждое событие применяется к базе
// идемпотентно (тот же сигнатурный путь, что у синхронизации и локальных
// действий) и только потом раздаётся подписчикам как подсказка.

pub mod connection;
pub mod event;

use std::sync::Arc;

use log::{error, info, warn};
use serde_json::json;
use tokio::sync::broadcast;

pub use connection::{
    backoff_delay_ms, ConnectionState, ConnectionSupervisor, EventChannel, RealtimeError,
};
pub use event::{classify, Classification, RealtimeEvent};

use crate::config::CoreConfig;
use crate::db::call::{CallDirection, CallRecord, CallRepo, CallType};
use crate::db::message::{Message, MessageRepo};
use crate::db::monitoring::REALTIME_EVENTS_DROPPED;
use crate::db::StoreError;
use crate::signature::SignatureEngine;

pub struct RealtimeRouter {
    channel: Arc<dyn EventChannel>,
    supervisor: Arc<ConnectionSupervisor>,
    messages: Arc<MessageRepo>,
    calls: Arc<CallRepo>,
    engine: SignatureEngine,
    events_tx: broadcast::Sender<RealtimeEvent>,
}

impl RealtimeRouter {
    pub fn new(
        channel: Arc<dyn EventChannel>,
        supervisor: Arc<ConnectionSupervisor>,
        messages: Arc<MessageRepo>,
        calls: Arc<CallRepo>,
        cfg: &CoreConfig,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            channel,
            supervisor,
            messages,
            calls,
            engine: SignatureEngine::from_config(cfg),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events_tx.subscribe()
    }

    /// Главный цикл: держим соединение, читаем, классифицируем, применяем.
    /// Обрыв потока (recv -> None) переводит супервизор в Disconnected и
    /// цикл пересобирает соединение; исчерпание попыток завершает цикл.
    pub async fn run(&self) {
        loop {
            if self.supervisor.ensure_connected().await.is_err() {
                error!("realtime connection gave up, router stopping");
                return;
            }
            match self.channel.recv().await {
                Some((name, payload)) => self.handle(&name, payload).await,
                None => {
                    info!("realtime stream closed, scheduling reconnect");
                    self.supervisor.mark_disconnected().await;
                }
            }
        }
    }

    /// Обработка одного события. Ошибка применения логируется и не роняет
    /// роутер: синхронизация доберёт пропущенное.
    pub async fn handle(&self, name: &str, payload: serde_json::Value) {
        match classify(name, &payload) {
            Classification::Event(event) => {
                if let Err(e) = self.apply(&event).await {
                    error!("failed to apply realtime event {:?}: {}", event, e);
                }
                // Нет подписчиков - не ошибка
                let _ = self.events_tx.send(event);
            }
            Classification::Suppressed => {
                REALTIME_EVENTS_DROPPED.with_label_values(&["group"]).inc();
            }
            Classification::Malformed => {
                REALTIME_EVENTS_DROPPED
                    .with_label_values(&["malformed"])
                    .inc();
            }
            Classification::Unknown => {
                REALTIME_EVENTS_DROPPED.with_label_values(&["unknown"]).inc();
            }
        }
    }

    /// Идемпотентное применение события к базе.
    async fn apply(&self, event: &RealtimeEvent) -> Result<(), StoreError> {
        match event {
            RealtimeEvent::NewMessage {
                from,
                to,
                body,
                media_urls,
                created_at,
            } => {
                let message = Message::incoming(
                    &self.engine,
                    from,
                    to,
                    body,
                    media_urls.clone(),
                    *created_at,
                );
                // Дубликат (уже пришёл через sync) молча схлопывается
                self.messages.insert_if_absent(message).await?;
            }
            RealtimeEvent::MessageDelivered { conversation } => {
                self.messages.apply_remote_delivered(conversation).await?;
            }
            RealtimeEvent::MessageRead { conversation } => {
                self.messages.apply_remote_read(conversation).await?;
            }
            RealtimeEvent::NewCall {
                phone_number,
                direction,
                call_type,
                duration,
                start_time,
            } => {
                let record = CallRecord::new(
                    phone_number,
                    *direction,
                    *call_type,
                    *duration,
                    *start_time,
                    None,
                    0,
                );
                self.calls.save_with_dedup(record).await?;
            }
            RealtimeEvent::NewVoicemail {
                phone_number,
                start_time,
            } => {
                let record = CallRecord::new(
                    phone_number,
                    CallDirection::Incoming,
                    CallType::Voicemail,
                    0,
                    *start_time,
                    None,
                    0,
                );
                self.calls.save_with_dedup(record).await?;
            }
            // Подсказки без локального состояния: только раздача подписчикам
            RealtimeEvent::ContactChanged { .. }
            | RealtimeEvent::TypingStart { .. }
            | RealtimeEvent::TypingStop { .. }
            | RealtimeEvent::Presence { .. } => {}
            RealtimeEvent::ServerError { message } => {
                warn!("server error event: {}", message);
            }
        }
        Ok(())
    }

    /// Исходящая пометка о прочтении: emit с необязательным ack. Локальное
    /// состояние уже применено вызывающим, отсутствие ack только логируется.
    pub async fn emit_mark_read(&self, conversation: &str) {
        let payload = json!({ "conversationId": conversation });
        match self.channel.emit_with_ack("mark_read", payload).await {
            Ok(_) => {}
            Err(e) => warn!("mark_read ack missing: {}", e),
        }
    }

    pub async fn emit_typing(&self, conversation: &str, active: bool) {
        let name = if active { "typing_start" } else { "typing_stop" };
        let payload = json!({ "conversationId": conversation });
        if let Err(e) = self.channel.emit(name, payload).await {
            warn!("{} emit failed: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::connection::mock::MockChannel;
    use super::*;
    use crate::db::message::MessageStatus;
    use crate::db::open_in_memory_db;
    use serde_json::json;

    struct Fixture {
        channel: Arc<MockChannel>,
        router: RealtimeRouter,
        messages: Arc<MessageRepo>,
        calls: Arc<CallRepo>,
    }

    async fn setup() -> Fixture {
        let conn = open_in_memory_db().await.expect("in-memory db");
        let cfg = CoreConfig::default();
        let channel = Arc::new(MockChannel::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            channel.clone(),
            "token",
            cfg.clone(),
        ));
        let messages = Arc::new(MessageRepo::new(conn.clone()));
        let calls = Arc::new(CallRepo::new(conn, cfg.call_dedup_window_ms));
        let router = RealtimeRouter::new(
            channel.clone(),
            supervisor,
            messages.clone(),
            calls.clone(),
            &cfg,
        );
        Fixture {
            channel,
            router,
            messages,
            calls,
        }
    }

    #[tokio::test]
    async fn test_new_message_lands_in_store_once() {
        let fx = setup().await;
        let payload = json!({
            "fromNumber": "+15559876543",
            "toNumber": "5551234567",
            "body": "hello",
            "createdAt": 1_700_000_000_000i64
        });
        fx.router.handle("new_message", payload.clone()).await;
        // То же событие доехало второй раз (at-least-once)
        fx.router.handle("new_message", payload).await;

        let msgs = fx
            .messages
            .get_for_conversation("5559876543", 10, 0)
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1, "повторная доставка схлопнулась");
        assert_eq!(msgs[0].status, MessageStatus::Received);
    }

    #[tokio::test]
    async fn test_event_published_to_subscribers() {
        let fx = setup().await;
        let mut rx = fx.router.subscribe();
        fx.router
            .handle(
                "new_message",
                json!({
                    "from": "5559876543",
                    "to": "5551234567",
                    "body": "hi",
                    "createdAt": 1_700_000_000_000i64
                }),
            )
            .await;
        let event = rx.try_recv().expect("event should be published");
        assert!(matches!(event, RealtimeEvent::NewMessage { .. }));
    }

    #[tokio::test]
    async fn test_group_message_not_stored_not_published() {
        let fx = setup().await;
        let mut rx = fx.router.subscribe();
        fx.router
            .handle(
                "new_message",
                json!({
                    "from": "5559876543",
                    "to": "5551234567",
                    "body": "group",
                    "group_id": "g1",
                    "createdAt": 1_700_000_000_000i64
                }),
            )
            .await;
        assert!(rx.try_recv().is_err());
        assert!(fx
            .messages
            .get_for_conversation("5559876543", 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_malformed_does_not_crash_router() {
        let fx = setup().await;
        fx.router.handle("new_message", json!("just a string")).await;
        fx.router.handle("new_call", json!({})).await;
        fx.router.handle("completely_unknown", json!({})).await;
        // Роутер жив и продолжает обрабатывать
        fx.router
            .handle(
                "new_message",
                json!({
                    "from": "5559876543",
                    "to": "5551234567",
                    "body": "still alive",
                    "createdAt": 1_700_000_000_000i64
                }),
            )
            .await;
        assert_eq!(
            fx.messages
                .get_for_conversation("5559876543", 10, 0)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_call_event_dedups_with_existing_history() {
        let fx = setup().await;
        let t = 1_700_000_000_000i64;
        fx.calls
            .save_with_dedup(CallRecord::new(
                "5559876543",
                crate::db::call::CallDirection::Incoming,
                crate::db::call::CallType::Missed,
                0,
                t,
                None,
                1,
            ))
            .await
            .unwrap();

        fx.router
            .handle(
                "new_call_metrics",
                json!({
                    "caller_id": "+15559876543",
                    "direction": "incoming",
                    "call_type": "answered",
                    "duration": 25,
                    "start_time": t + 15_000
                }),
            )
            .await;

        let history = fx.calls.get_paginated(10, 0).await.unwrap();
        assert_eq!(history.len(), 1, "событие слилось с существующей записью");
        assert_eq!(history[0].call_type, crate::db::call::CallType::Answered);
    }

    #[tokio::test]
    async fn test_delivered_receipt_applied() {
        let fx = setup().await;
        let engine = SignatureEngine::from_config(&CoreConfig::default());
        let msg = Message::outgoing(
            &engine,
            "5551234567",
            "5559876543",
            "Hi",
            vec![],
            1_700_000_000_000,
        );
        let id = msg.id;
        fx.messages.insert_if_absent(msg).await.unwrap();
        fx.messages.mark_sent(id, 1_700_000_001_000).await.unwrap();

        fx.router
            .handle("message_delivered", json!({ "phoneNumber": "5559876543" }))
            .await;
        assert_eq!(
            fx.messages.get(id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_outbound_mark_read_emit() {
        let fx = setup().await;
        fx.router.emit_mark_read("5559876543").await;
        let counts = fx.channel.emitted_counts();
        assert_eq!(counts.get("mark_read"), Some(&1));
    }
}
