// src/call/manager.rs
//
// Менеджер живых сессий: переводит команды пользователя ровно в один вызов
// бэкенда плюс оптимистичный переход, применяет авторитетные колбэки и
// гарантирует, что терминал пишет историю и освобождает ресурсы ровно один
// раз, даже когда локальный hangup гоняется с терминальным колбэком.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use super::backend::{BackendCallId, BackendCallState, CallControl, CallError};
use super::session::{transition, CallSession, Command, Input, SessionState, Step};
use crate::db::call::CallRepo;
use crate::db::contact::ContactRepo;
use crate::db::now_ms;

/// События для UI и телефонной интеграции.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Входящий звонок ждёт решения пользователя.
    IncomingRinging {
        session_id: Uuid,
        phone_number: String,
        line_number: i64,
    },
    /// Первый вход в Connected: пошёл отсчёт длительности.
    Started {
        session_id: Uuid,
        phone_number: String,
    },
    StateChanged {
        session_id: Uuid,
        state: SessionState,
    },
    /// Сессия финализирована, история записана.
    Ended {
        session_id: Uuid,
        record_id: Uuid,
    },
}

#[derive(Default)]
struct SessionTable {
    by_id: HashMap<Uuid, CallSession>,
    by_backend: HashMap<BackendCallId, Uuid>,
}

pub struct CallSessionManager {
    backend: Arc<dyn CallControl>,
    calls: Arc<CallRepo>,
    contacts: Arc<ContactRepo>,
    sessions: Mutex<SessionTable>,
    events_tx: broadcast::Sender<CallEvent>,
    cb_tx: mpsc::UnboundedSender<(BackendCallId, BackendCallState)>,
}

impl CallSessionManager {
    pub fn new(
        backend: Arc<dyn CallControl>,
        calls: Arc<CallRepo>,
        contacts: Arc<ContactRepo>,
    ) -> Arc<Self> {
        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let manager = Arc::new(Self {
            backend,
            calls,
            contacts,
            sessions: Mutex::new(SessionTable::default()),
            events_tx,
            cb_tx,
        });

        // Задача авторитетных колбэков: живёт, пока жив менеджер
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some((backend_id, state)) = cb_rx.recv().await {
                match weak.upgrade() {
                    Some(manager) => manager.on_backend_state(backend_id, state).await,
                    None => break,
                }
            }
        });

        manager
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    pub async fn active_sessions(&self) -> Vec<CallSession> {
        self.sessions.lock().await.by_id.values().cloned().collect()
    }

    pub async fn get_session(&self, session_id: Uuid) -> Option<CallSession> {
        self.sessions.lock().await.by_id.get(&session_id).cloned()
    }

    /// Исходящий звонок: один вызов make_call, регистрация колбэка,
    /// оптимистичный переход Initializing -> Dialing.
    pub async fn place_call(&self, number: &str, line_number: i64) -> Result<Uuid, CallError> {
        let backend_id = self.backend.make_call(number, line_number).await?;
        self.backend
            .register_state_callback(&backend_id, self.cb_tx.clone())
            .await?;

        let session = CallSession::outgoing(backend_id.clone(), number, line_number, now_ms());
        let session_id = session.id;
        {
            let mut table = self.sessions.lock().await;
            table.by_backend.insert(backend_id, session_id);
            table.by_id.insert(session_id, session);
        }
        info!("placing call {} to {}", session_id, number);

        self.apply_step(
            session_id,
            Step {
                next: SessionState::Dialing,
                reason: None,
            },
        )
        .await?;
        Ok(session_id)
    }

    /// Входящий звонок от телефонной интеграции. Заблокированный номер
    /// отбивается сразу и попадает в историю как Blocked; сессия для него
    /// не создаётся.
    pub async fn on_incoming_call(
        &self,
        backend_id: BackendCallId,
        number: &str,
        line_number: i64,
    ) -> Result<Option<Uuid>, CallError> {
        if self.contacts.is_blocked(number).await? {
            info!("auto-rejecting blocked caller {}", number);
            self.backend.reject_call(&backend_id).await?;
            let mut session = CallSession::incoming(backend_id, number, line_number, now_ms());
            session.state = SessionState::Rejected;
            let record = session.history_record(now_ms(), Some("blocked caller"), true);
            let outcome = self.calls.save_with_dedup(record).await?;
            let _ = self.events_tx.send(CallEvent::Ended {
                session_id: session.id,
                record_id: outcome.id(),
            });
            return Ok(None);
        }

        self.backend
            .register_state_callback(&backend_id, self.cb_tx.clone())
            .await?;
        let session = CallSession::incoming(backend_id.clone(), number, line_number, now_ms());
        let session_id = session.id;
        let phone_number = session.phone_number.clone();
        {
            let mut table = self.sessions.lock().await;
            table.by_backend.insert(backend_id, session_id);
            table.by_id.insert(session_id, session);
        }
        let _ = self.events_tx.send(CallEvent::IncomingRinging {
            session_id,
            phone_number,
            line_number,
        });
        Ok(Some(session_id))
    }

    pub async fn answer(&self, session_id: Uuid) -> Result<(), CallError> {
        let (backend_id, step) = self.prepare(session_id, Command::Answer).await?;
        self.backend.answer_call(&backend_id).await?;
        self.apply_step(session_id, step).await
    }

    pub async fn reject(&self, session_id: Uuid) -> Result<(), CallError> {
        let (backend_id, step) = self.prepare(session_id, Command::Reject).await?;
        self.backend.reject_call(&backend_id).await?;
        self.apply_step(session_id, step).await
    }

    /// Hangup терпим к гонке с терминальным колбэком: если сессия уже
    /// финализирована, это успех, а не ошибка.
    pub async fn hangup(&self, session_id: Uuid) -> Result<(), CallError> {
        let (backend_id, step) = match self.prepare(session_id, Command::Hangup).await {
            Ok(v) => v,
            Err(CallError::SessionNotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.backend.end_call(&backend_id).await?;
        match self.apply_step(session_id, step).await {
            Err(CallError::SessionNotFound) => Ok(()),
            other => other,
        }
    }

    pub async fn hold(&self, session_id: Uuid) -> Result<(), CallError> {
        let (backend_id, step) = self.prepare(session_id, Command::Hold).await?;
        self.backend.hold_call(&backend_id).await?;
        self.apply_step(session_id, step).await
    }

    pub async fn unhold(&self, session_id: Uuid) -> Result<(), CallError> {
        let (backend_id, step) = self.prepare(session_id, Command::Unhold).await?;
        self.backend.resume_call(&backend_id).await?;
        self.apply_step(session_id, step).await
    }

    /// Mute не меняет жизненный цикл: один вызов бэкенда и флаг на сессии.
    pub async fn toggle_mute(&self, session_id: Uuid) -> Result<bool, CallError> {
        let (backend_id, next_muted) = {
            let table = self.sessions.lock().await;
            let session = table
                .by_id
                .get(&session_id)
                .ok_or(CallError::SessionNotFound)?;
            (session.backend_id.clone(), !session.is_muted)
        };
        self.backend.set_mute(&backend_id, next_muted).await?;
        let mut table = self.sessions.lock().await;
        if let Some(session) = table.by_id.get_mut(&session_id) {
            session.is_muted = next_muted;
        }
        Ok(next_muted)
    }

    pub async fn send_dtmf(&self, session_id: Uuid, digits: &str) -> Result<(), CallError> {
        let backend_id = {
            let table = self.sessions.lock().await;
            let session = table
                .by_id
                .get(&session_id)
                .ok_or(CallError::SessionNotFound)?;
            if !session.state.is_live() {
                return Err(CallError::InvalidCommand(format!("{:?}", session.state)));
            }
            session.backend_id.clone()
        };
        self.backend.send_dtmf(&backend_id, digits).await
    }

    /// Валидация команды и расчёт оптимистичного шага, без мутаций.
    async fn prepare(
        &self,
        session_id: Uuid,
        command: Command,
    ) -> Result<(BackendCallId, Step), CallError> {
        let table = self.sessions.lock().await;
        let session = table
            .by_id
            .get(&session_id)
            .ok_or(CallError::SessionNotFound)?;
        let step = transition(session.state, &Input::Command(command))
            .ok_or_else(|| CallError::InvalidCommand(format!("{:?}", session.state)))?;
        Ok((session.backend_id.clone(), step))
    }

    /// Авторитетный колбэк бэкенда. Запоздавший колбэк по уже
    /// финализированной сессии молча игнорируется.
    async fn on_backend_state(&self, backend_id: BackendCallId, state: BackendCallState) {
        let step = {
            let table = self.sessions.lock().await;
            let Some(session_id) = table.by_backend.get(&backend_id).copied() else {
                debug!("late callback for finished call {}: {:?}", backend_id, state);
                return;
            };
            let session = &table.by_id[&session_id];
            match transition(session.state, &Input::Callback(state)) {
                Some(step) => (session_id, step),
                None => return,
            }
        };
        if let Err(e) = self.apply_step(step.0, step.1).await {
            warn!("backend callback apply failed: {}", e);
        }
    }

    /// Единая точка применения перехода. Финализация (история + снятие
    /// колбэка) выполняется под защитой finish_once ровно один раз.
    async fn apply_step(&self, session_id: Uuid, step: Step) -> Result<(), CallError> {
        let mut started: Option<String> = None;
        let mut finalize: Option<(CallSession, Option<String>)> = None;
        {
            let mut table = self.sessions.lock().await;
            let session = table
                .by_id
                .get_mut(&session_id)
                .ok_or(CallError::SessionNotFound)?;
            let previous = session.state;
            session.state = step.next;
            session.is_on_hold = step.next == SessionState::OnHold;
            if step.next == SessionState::Connected && session.connected_at.is_none() {
                session.connected_at = Some(now_ms());
                started = Some(session.phone_number.clone());
            }
            if step.next.is_terminal() && session.finish_once() {
                let snapshot = session.clone();
                table.by_backend.remove(&snapshot.backend_id);
                table.by_id.remove(&session_id);
                finalize = Some((snapshot, step.reason));
            } else if previous != step.next {
                let _ = self.events_tx.send(CallEvent::StateChanged {
                    session_id,
                    state: step.next,
                });
            }
        }

        if let Some(phone_number) = started {
            let _ = self.events_tx.send(CallEvent::Started {
                session_id,
                phone_number,
            });
        }

        if let Some((session, reason)) = finalize {
            let record = session.history_record(now_ms(), reason.as_deref(), false);
            let outcome = self.calls.save_with_dedup(record).await?;
            // Снятие колбэка идемпотентно: гонка с бэкендом безопасна
            self.backend
                .unregister_state_callback(&session.backend_id)
                .await;
            info!(
                "call {} finalized: {:?}, history {}",
                session_id,
                session.state,
                outcome.id()
            );
            let _ = self.events_tx.send(CallEvent::Ended {
                session_id,
                record_id: outcome.id(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::backend::mock::MockCallControl;
    use crate::db::cache::CacheHandler;
    use crate::db::call::CallType;
    use crate::db::contact::Contact;
    use crate::db::open_in_memory_db;

    struct Fixture {
        backend: Arc<MockCallControl>,
        manager: Arc<CallSessionManager>,
        calls: Arc<CallRepo>,
        contacts: Arc<ContactRepo>,
    }

    async fn setup() -> Fixture {
        let conn = open_in_memory_db().await.expect("in-memory db");
        let backend = Arc::new(MockCallControl::new());
        let calls = Arc::new(CallRepo::new(conn.clone(), 60_000));
        let contacts = Arc::new(ContactRepo::new(conn, CacheHandler::new(16)));
        let manager = CallSessionManager::new(backend.clone(), calls.clone(), contacts.clone());
        Fixture {
            backend,
            manager,
            calls,
            contacts,
        }
    }

    #[tokio::test]
    async fn test_outgoing_happy_path() {
        let fx = setup().await;
        let mut events = fx.manager.subscribe();

        let id = fx.manager.place_call("+15559876543", 1).await.unwrap();
        let session = fx.manager.get_session(id).await.unwrap();
        assert_eq!(session.state, SessionState::Dialing);
        assert_eq!(session.phone_number, "5559876543");

        // Авторитетные колбэки бэкенда
        fx.manager
            .on_backend_state(session.backend_id.clone(), BackendCallState::Ringing)
            .await;
        fx.manager
            .on_backend_state(session.backend_id.clone(), BackendCallState::Confirmed)
            .await;
        let session = fx.manager.get_session(id).await.unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert!(session.connected_at.is_some());

        fx.manager.hangup(id).await.unwrap();
        assert!(fx.manager.get_session(id).await.is_none(), "сессия освобождена");

        let history = fx.calls.get_paginated(10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].call_type, CallType::Answered);

        // Started был опубликован ровно один раз
        let mut started = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::Started { .. }) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
        // Колбэк снят ровно один раз
        assert_eq!(fx.backend.unregistered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hangup_callback_race_single_record() {
        let fx = setup().await;
        let id = fx.manager.place_call("5559876543", 1).await.unwrap();
        let backend_id = fx.manager.get_session(id).await.unwrap().backend_id;
        fx.manager
            .on_backend_state(backend_id.clone(), BackendCallState::Confirmed)
            .await;

        // Пользователь вешает трубку, и тут же приходит терминальный колбэк
        fx.manager.hangup(id).await.unwrap();
        fx.manager
            .on_backend_state(
                backend_id.clone(),
                BackendCallState::Disconnected { reason: None },
            )
            .await;
        // И ещё раз hangup от нетерпеливого UI
        fx.manager.hangup(id).await.unwrap();

        let history = fx.calls.get_paginated(10, 0).await.unwrap();
        assert_eq!(history.len(), 1, "история пишется ровно один раз");
        assert_eq!(fx.backend.unregistered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_incoming_cancelled_is_missed_zero_duration() {
        let fx = setup().await;
        let id = fx
            .manager
            .on_incoming_call("b-in-1".into(), "5559876543", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fx.manager.get_session(id).await.unwrap().state,
            SessionState::Ringing
        );

        // Звонящий положил трубку до ответа
        fx.manager
            .on_backend_state(
                "b-in-1".to_string(),
                BackendCallState::Disconnected {
                    reason: Some("cancelled".into()),
                },
            )
            .await;

        let history = fx.calls.get_paginated(10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].call_type, CallType::Missed);
        assert_eq!(history[0].duration, 0);
        assert_eq!(
            history[0].notes.as_deref(),
            Some("terminal reason: cancelled")
        );
    }

    #[tokio::test]
    async fn test_blocked_caller_auto_rejected() {
        let fx = setup().await;
        let mut contact = Contact::new("5550006666");
        contact.is_blocked = true;
        fx.contacts.replace_all(vec![contact]).await.unwrap();

        let result = fx
            .manager
            .on_incoming_call("b-in-2".into(), "+15550006666", 1)
            .await
            .unwrap();
        assert!(result.is_none(), "сессия для заблокированного не создаётся");
        assert_eq!(fx.backend.invocation_count("reject_call"), 1);

        let history = fx.calls.get_paginated(10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].call_type, CallType::Blocked);
    }

    #[tokio::test]
    async fn test_answer_invalid_from_dialing() {
        let fx = setup().await;
        let id = fx.manager.place_call("5559876543", 1).await.unwrap();
        let err = fx.manager.answer(id).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidCommand(_)));
        // Невалидная команда не дошла до бэкенда
        assert_eq!(fx.backend.invocation_count("answer_call"), 0);
    }

    #[tokio::test]
    async fn test_hold_unhold_and_mute_flags() {
        let fx = setup().await;
        let id = fx
            .manager
            .on_incoming_call("b-in-3".into(), "5559876543", 2)
            .await
            .unwrap()
            .unwrap();
        fx.manager.answer(id).await.unwrap();

        fx.manager.hold(id).await.unwrap();
        let s = fx.manager.get_session(id).await.unwrap();
        assert_eq!(s.state, SessionState::OnHold);
        assert!(s.is_on_hold);

        fx.manager.unhold(id).await.unwrap();
        let s = fx.manager.get_session(id).await.unwrap();
        assert_eq!(s.state, SessionState::Connected);
        assert!(!s.is_on_hold);

        assert!(fx.manager.toggle_mute(id).await.unwrap());
        assert!(fx.manager.get_session(id).await.unwrap().is_muted);
        assert!(!fx.manager.toggle_mute(id).await.unwrap());
        assert_eq!(fx.backend.invocation_count("mute"), 1);
        assert_eq!(fx.backend.invocation_count("unmute"), 1);

        fx.manager.send_dtmf(id, "42#").await.unwrap();
        assert_eq!(fx.backend.invocation_count("send_dtmf"), 1);
    }

    #[tokio::test]
    async fn test_late_confirmed_does_not_resurrect() {
        let fx = setup().await;
        let id = fx.manager.place_call("5559876543", 1).await.unwrap();
        let backend_id = fx.manager.get_session(id).await.unwrap().backend_id;

        fx.manager.hangup(id).await.unwrap();
        // Запоздавший Confirmed по уже финализированной сессии
        fx.manager
            .on_backend_state(backend_id, BackendCallState::Confirmed)
            .await;
        assert!(fx.manager.get_session(id).await.is_none());
        assert_eq!(fx.calls.get_paginated(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_before_connect_recorded_with_reason() {
        let fx = setup().await;
        let id = fx.manager.place_call("5559876543", 1).await.unwrap();
        let backend_id = fx.manager.get_session(id).await.unwrap().backend_id;

        fx.manager
            .on_backend_state(
                backend_id,
                BackendCallState::Failed {
                    reason: "503 service unavailable".into(),
                },
            )
            .await;

        let history = fx.calls.get_paginated(10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].duration, 0);
        assert_eq!(
            history[0].notes.as_deref(),
            Some("terminal reason: 503 service unavailable")
        );
    }

    #[tokio::test]
    async fn test_concurrent_lines() {
        let fx = setup().await;
        let a = fx.manager.place_call("5550000001", 1).await.unwrap();
        let b = fx.manager.place_call("5550000002", 2).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(fx.manager.active_sessions().await.len(), 2);

        fx.manager.hangup(a).await.unwrap();
        let remaining = fx.manager.active_sessions().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].line_number, 2);
    }
}
