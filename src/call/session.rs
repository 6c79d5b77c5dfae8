// src/call/session.rs
//
// Жизненный цикл звонка как явная машина состояний. Вместо разбросанных
// булевых флагов - одна чистая функция перехода, принимающая либо команду
// пользователя (оптимистичный переход), либо колбэк бэкенда (авторитетный).
// Из терминального состояния переходов нет: это и есть защита от гонки
// "локальный hangup против терминального колбэка".

use uuid::Uuid;

use super::backend::{BackendCallId, BackendCallState};
use crate::db::call::{CallDirection, CallRecord, CallType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Dialing,
    Ringing,
    EarlyMedia,
    Connected,
    OnHold,
    Disconnected,
    Failed,
    Busy,
    Rejected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Disconnected
                | SessionState::Failed
                | SessionState::Busy
                | SessionState::Rejected
        )
    }

    /// Разговор активен: можно держать/снимать с удержания, слать DTMF.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::OnHold)
    }
}

/// Команды пользователя/телефонной интеграции, меняющие жизненный цикл.
/// Mute и DTMF состояние не меняют и через машину не проходят.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Answer,
    Reject,
    Hangup,
    Hold,
    Unhold,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Command(Command),
    Callback(BackendCallState),
}

/// Результат перехода: новое состояние и терминальная причина, если есть.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub next: SessionState,
    pub reason: Option<String>,
}

impl Step {
    fn to(next: SessionState) -> Self {
        Self { next, reason: None }
    }
}

/// Единственная функция перехода. None - вход проигнорирован (невалидная
/// команда или любой вход в терминальном состоянии).
///
/// Колбэк бэкенда авторитетен: применяется из любого нетерминального
/// состояния, в том числе "понижая" оптимистичный переход, который успел
/// примениться раньше.
pub fn transition(current: SessionState, input: &Input) -> Option<Step> {
    if current.is_terminal() {
        return None;
    }
    match input {
        Input::Callback(cb) => Some(match cb {
            BackendCallState::Initializing => Step::to(SessionState::Initializing),
            BackendCallState::Calling => Step::to(SessionState::Dialing),
            BackendCallState::Ringing => Step::to(SessionState::Ringing),
            BackendCallState::EarlyMedia => Step::to(SessionState::EarlyMedia),
            BackendCallState::Confirmed => Step::to(SessionState::Connected),
            BackendCallState::Busy => Step::to(SessionState::Busy),
            BackendCallState::Rejected => Step::to(SessionState::Rejected),
            BackendCallState::Failed { reason } => Step {
                next: SessionState::Failed,
                reason: Some(reason.clone()),
            },
            BackendCallState::Disconnected { reason } => Step {
                next: SessionState::Disconnected,
                reason: reason.clone(),
            },
        }),
        Input::Command(cmd) => match (cmd, current) {
            (Command::Answer, SessionState::Ringing | SessionState::EarlyMedia) => {
                Some(Step::to(SessionState::Connected))
            }
            (
                Command::Reject,
                SessionState::Initializing
                | SessionState::Dialing
                | SessionState::Ringing
                | SessionState::EarlyMedia,
            ) => Some(Step::to(SessionState::Rejected)),
            (Command::Hangup, _) => Some(Step::to(SessionState::Disconnected)),
            (Command::Hold, SessionState::Connected) => Some(Step::to(SessionState::OnHold)),
            (Command::Unhold, SessionState::OnHold) => Some(Step::to(SessionState::Connected)),
            _ => None,
        },
    }
}

/// Живая сессия звонка. Владеет корреляцией с бэкендом, флагами mute/hold
/// и временем первого соединения.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub backend_id: BackendCallId,
    pub phone_number: String,
    pub direction: CallDirection,
    pub line_number: i64,
    pub state: SessionState,
    pub is_muted: bool,
    pub is_on_hold: bool,
    pub started_at: i64,
    /// Выставляется один раз, при первом входе в Connected.
    pub connected_at: Option<i64>,
    finished: bool,
}

impl CallSession {
    pub fn outgoing(backend_id: BackendCallId, number: &str, line_number: i64, now: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            backend_id,
            phone_number: crate::signature::normalize_phone(number),
            direction: CallDirection::Outgoing,
            line_number,
            state: SessionState::Initializing,
            is_muted: false,
            is_on_hold: false,
            started_at: now,
            connected_at: None,
            finished: false,
        }
    }

    pub fn incoming(backend_id: BackendCallId, number: &str, line_number: i64, now: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            backend_id,
            phone_number: crate::signature::normalize_phone(number),
            direction: CallDirection::Incoming,
            line_number,
            state: SessionState::Ringing,
            is_muted: false,
            is_on_hold: false,
            started_at: now,
            connected_at: None,
            finished: false,
        }
    }

    /// Ровно один true на сессию: под этим флагом живут запись истории и
    /// освобождение ресурсов.
    pub fn finish_once(&mut self) -> bool {
        !std::mem::replace(&mut self.finished, true)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Запись истории для терминального состояния.
    /// Длительность - от соединения до разъединения, 0 если соединения
    /// не было; причина падения уходит в notes для диагностики.
    pub fn history_record(&self, ended_at: i64, reason: Option<&str>, blocked: bool) -> CallRecord {
        let duration = match self.connected_at {
            Some(connected) => ((ended_at - connected).max(0)) / 1000,
            None => 0,
        };
        let call_type = if blocked {
            CallType::Blocked
        } else if self.connected_at.is_some() {
            CallType::Answered
        } else {
            match self.state {
                SessionState::Rejected => CallType::Rejected,
                // Невзятый входящий, сорвавшийся исходящий, busy, failed
                _ => CallType::Missed,
            }
        };
        let mut record = CallRecord::new(
            &self.phone_number,
            self.direction,
            call_type,
            duration,
            self.connected_at.unwrap_or(self.started_at),
            Some(ended_at),
            self.line_number,
        );
        record.notes = reason.map(|r| format!("terminal reason: {}", r));
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NON_TERMINAL: &[SessionState] = &[
        SessionState::Initializing,
        SessionState::Dialing,
        SessionState::Ringing,
        SessionState::EarlyMedia,
        SessionState::Connected,
        SessionState::OnHold,
    ];

    #[test]
    fn test_terminal_reachable_from_every_non_terminal_state() {
        for &state in NON_TERMINAL {
            // Пользовательский hangup
            let step = transition(state, &Input::Command(Command::Hangup)).unwrap();
            assert!(step.next.is_terminal(), "hangup из {:?}", state);
            // Колбэки Busy/Rejected/Failed
            for cb in [
                BackendCallState::Busy,
                BackendCallState::Rejected,
                BackendCallState::Failed {
                    reason: "480".into(),
                },
            ] {
                let step = transition(state, &Input::Callback(cb)).unwrap();
                assert!(step.next.is_terminal());
            }
        }
    }

    #[test]
    fn test_terminal_states_ignore_all_inputs() {
        for state in [
            SessionState::Disconnected,
            SessionState::Failed,
            SessionState::Busy,
            SessionState::Rejected,
        ] {
            assert_eq!(transition(state, &Input::Command(Command::Hangup)), None);
            assert_eq!(
                transition(state, &Input::Callback(BackendCallState::Confirmed)),
                None,
                "терминальное состояние не воскресает колбэком"
            );
        }
    }

    #[test]
    fn test_answer_only_from_ringing_or_early_media() {
        assert!(transition(SessionState::Ringing, &Input::Command(Command::Answer)).is_some());
        assert!(transition(SessionState::EarlyMedia, &Input::Command(Command::Answer)).is_some());
        assert!(transition(SessionState::Dialing, &Input::Command(Command::Answer)).is_none());
        assert!(transition(SessionState::Connected, &Input::Command(Command::Answer)).is_none());
    }

    #[test]
    fn test_hold_cycle() {
        let held = transition(SessionState::Connected, &Input::Command(Command::Hold)).unwrap();
        assert_eq!(held.next, SessionState::OnHold);
        let resumed = transition(SessionState::OnHold, &Input::Command(Command::Unhold)).unwrap();
        assert_eq!(resumed.next, SessionState::Connected);
        // Hold вне разговора невалиден
        assert!(transition(SessionState::Ringing, &Input::Command(Command::Hold)).is_none());
    }

    #[test]
    fn test_callback_wins_over_optimistic() {
        // Оптимистично ответили, но бэкенд ещё репортит Ringing
        let demoted = transition(
            SessionState::Connected,
            &Input::Callback(BackendCallState::Ringing),
        )
        .unwrap();
        assert_eq!(demoted.next, SessionState::Ringing);
        let confirmed = transition(
            SessionState::Ringing,
            &Input::Callback(BackendCallState::Confirmed),
        )
        .unwrap();
        assert_eq!(confirmed.next, SessionState::Connected);
    }

    #[test]
    fn test_callback_reason_propagates() {
        let step = transition(
            SessionState::Dialing,
            &Input::Callback(BackendCallState::Failed {
                reason: "503 service unavailable".into(),
            }),
        )
        .unwrap();
        assert_eq!(step.next, SessionState::Failed);
        assert_eq!(step.reason.as_deref(), Some("503 service unavailable"));
    }

    #[test]
    fn test_finish_once_guard() {
        let mut session = CallSession::incoming("b-1".into(), "5551234567", 1, 1_000);
        assert!(session.finish_once());
        assert!(!session.finish_once(), "второй финал невозможен");
    }

    #[test]
    fn test_missed_incoming_has_zero_duration() {
        let mut session = CallSession::incoming("b-1".into(), "+15551234567", 1, 1_000_000);
        session.state = SessionState::Disconnected; // отменили до ответа
        let record = session.history_record(1_030_000, None, false);
        assert_eq!(record.call_type, CallType::Missed);
        assert_eq!(record.duration, 0);
        assert_eq!(record.phone_number, "5551234567");
    }

    #[test]
    fn test_answered_duration_from_connect_to_disconnect() {
        let mut session = CallSession::outgoing("b-1".into(), "5551234567", 1, 1_000_000);
        session.connected_at = Some(1_010_000);
        session.state = SessionState::Disconnected;
        let record = session.history_record(1_055_000, None, false);
        assert_eq!(record.call_type, CallType::Answered);
        assert_eq!(record.duration, 45);
        assert_eq!(record.start_time, 1_010_000);
    }

    #[test]
    fn test_failed_before_connect_records_reason() {
        let mut session = CallSession::outgoing("b-1".into(), "5551234567", 1, 1_000_000);
        session.state = SessionState::Failed;
        let record = session.history_record(1_002_000, Some("486 busy here"), false);
        assert_eq!(record.call_type, CallType::Missed);
        assert_eq!(record.duration, 0);
        assert_eq!(
            record.notes.as_deref(),
            Some("terminal reason: 486 busy here")
        );
    }

    #[test]
    fn test_rejected_and_blocked_types() {
        let mut session = CallSession::incoming("b-1".into(), "5551234567", 1, 1_000);
        session.state = SessionState::Rejected;
        assert_eq!(
            session.history_record(2_000, None, false).call_type,
            CallType::Rejected
        );
        assert_eq!(
            session.history_record(2_000, None, true).call_type,
            CallType::Blocked
        );
    }
}
