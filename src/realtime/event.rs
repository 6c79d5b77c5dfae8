// src/realtime/event.rs
//
// Нормализация realtime-событий. Сервер исторически слал одни и те же поля
// под разными именами (phoneNumber / phone_number / from / caller_id), плюс
// несколько поколений имён самих событий. Классификатор принимает все
// известные варианты и сводит их к закрытому словарю RealtimeEvent.
// Кривой payload никогда не роняет роутер: событие отбрасывается с логом.

use log::{debug, warn};
use serde_json::Value;

use crate::db::call::{CallDirection, CallType};

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    NewMessage {
        from: String,
        to: String,
        body: String,
        media_urls: Vec<String>,
        created_at: i64,
    },
    MessageDelivered {
        conversation: String,
    },
    MessageRead {
        conversation: String,
    },
    NewCall {
        phone_number: String,
        direction: CallDirection,
        call_type: CallType,
        duration: i64,
        start_time: i64,
    },
    NewVoicemail {
        phone_number: String,
        start_time: i64,
    },
    ContactChanged {
        phone_number: Option<String>,
    },
    TypingStart {
        conversation: String,
    },
    TypingStop {
        conversation: String,
    },
    Presence {
        phone_number: String,
        online: bool,
    },
    ServerError {
        message: String,
    },
}

/// Итог классификации: отдельные исходы, чтобы роутер вёл точный учёт.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Event(RealtimeEvent),
    /// Групповые/широковещательные сообщения вне области 1:1-диалогов.
    Suppressed,
    Malformed,
    Unknown,
}

// Исторические алиасы полей, от специфичного к общему.
const FROM_KEYS: &[&str] = &["fromNumber", "from_number", "from", "sender", "phoneNumber", "phone_number"];
const TO_KEYS: &[&str] = &["toNumber", "to_number", "to", "receiver"];
const BODY_KEYS: &[&str] = &["body", "messageBody", "message", "text"];
const CREATED_KEYS: &[&str] = &["createdAt", "created_at", "timestamp", "date"];
const MEDIA_KEYS: &[&str] = &["mediaUrls", "media_urls", "attachments"];
const GROUP_KEYS: &[&str] = &["groupId", "group_id", "broadcastId", "broadcast_id", "roomId"];
const CALL_NUMBER_KEYS: &[&str] = &[
    "callerNumber",
    "caller_number",
    "caller_id",
    "phoneNumber",
    "phone_number",
    "from",
    "number",
];
const CONVERSATION_KEYS: &[&str] = &["conversationId", "conversation_id", "phoneNumber", "phone_number", "number"];
const START_KEYS: &[&str] = &["startTime", "start_time", "createdAt", "created_at", "timestamp"];
const DURATION_KEYS: &[&str] = &["duration", "callDuration", "call_duration"];

fn first_str<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Числа приходят и числом, и строкой - принимаем оба представления.
fn first_i64(payload: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let v = payload.get(*k)?;
        v.as_i64().or_else(|| v.as_str()?.parse().ok())
    })
}

fn has_any(payload: &Value, keys: &[&str]) -> bool {
    keys.iter().any(|k| {
        payload
            .get(*k)
            .map(|v| !v.is_null())
            .unwrap_or(false)
    })
}

fn string_list(payload: &Value, keys: &[&str]) -> Vec<String> {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Классификация по имени события и payload-у.
pub fn classify(name: &str, payload: &Value) -> Classification {
    match name {
        "new_message" | "newMessage" | "message" | "sms" => classify_message(payload),
        "message_delivered" | "messageDelivered" | "delivered" => {
            match first_str(payload, CONVERSATION_KEYS) {
                Some(number) => Classification::Event(RealtimeEvent::MessageDelivered {
                    conversation: crate::signature::normalize_phone(number),
                }),
                None => malformed(name, payload),
            }
        }
        "message_read" | "messageRead" | "read" => match first_str(payload, CONVERSATION_KEYS) {
            Some(number) => Classification::Event(RealtimeEvent::MessageRead {
                conversation: crate::signature::normalize_phone(number),
            }),
            None => malformed(name, payload),
        },
        "new_call" | "newCall" | "call_metrics" | "new_call_metrics" => classify_call(payload),
        "new_voicemail" | "newVoicemail" | "voicemail" => {
            match first_str(payload, CALL_NUMBER_KEYS) {
                Some(number) => Classification::Event(RealtimeEvent::NewVoicemail {
                    phone_number: crate::signature::normalize_phone(number),
                    start_time: first_i64(payload, START_KEYS).unwrap_or(0),
                }),
                None => malformed(name, payload),
            }
        }
        "contact_changed" | "contactChanged" | "contact_updated" => {
            Classification::Event(RealtimeEvent::ContactChanged {
                phone_number: first_str(payload, CALL_NUMBER_KEYS)
                    .map(crate::signature::normalize_phone),
            })
        }
        "typing_start" | "typing" => match first_str(payload, CONVERSATION_KEYS) {
            Some(number) => Classification::Event(RealtimeEvent::TypingStart {
                conversation: crate::signature::normalize_phone(number),
            }),
            None => malformed(name, payload),
        },
        "typing_stop" | "typingStop" => match first_str(payload, CONVERSATION_KEYS) {
            Some(number) => Classification::Event(RealtimeEvent::TypingStop {
                conversation: crate::signature::normalize_phone(number),
            }),
            None => malformed(name, payload),
        },
        "presence" | "presence_update" => match first_str(payload, CALL_NUMBER_KEYS) {
            Some(number) => {
                let online = payload
                    .get("online")
                    .and_then(Value::as_bool)
                    .or_else(|| {
                        first_str(payload, &["status", "state"])
                            .map(|s| matches!(s, "online" | "available"))
                    })
                    .unwrap_or(false);
                Classification::Event(RealtimeEvent::Presence {
                    phone_number: crate::signature::normalize_phone(number),
                    online,
                })
            }
            None => malformed(name, payload),
        },
        "error" => Classification::Event(RealtimeEvent::ServerError {
            message: first_str(payload, &["message", "error", "reason"])
                .unwrap_or("unknown server error")
                .to_string(),
        }),
        other => {
            debug!("unknown realtime event '{}', dropping", other);
            Classification::Unknown
        }
    }
}

fn classify_message(payload: &Value) -> Classification {
    // Групповые сообщения вне области 1:1-диалогов
    if has_any(payload, GROUP_KEYS) {
        debug!("group message suppressed");
        return Classification::Suppressed;
    }
    let from = first_str(payload, FROM_KEYS);
    let to = first_str(payload, TO_KEYS);
    let body = first_str(payload, BODY_KEYS);
    match (from, to, body) {
        (Some(from), Some(to), Some(body)) => Classification::Event(RealtimeEvent::NewMessage {
            from: from.to_string(),
            to: to.to_string(),
            body: body.to_string(),
            media_urls: string_list(payload, MEDIA_KEYS),
            created_at: first_i64(payload, CREATED_KEYS).unwrap_or_else(crate::db::now_ms),
        }),
        _ => malformed("new_message", payload),
    }
}

fn classify_call(payload: &Value) -> Classification {
    let number = match first_str(payload, CALL_NUMBER_KEYS) {
        Some(n) => n,
        None => return malformed("new_call", payload),
    };
    let direction = match first_str(payload, &["direction"]) {
        Some("outgoing") | Some("outbound") => CallDirection::Outgoing,
        _ => CallDirection::Incoming,
    };
    let call_type = match first_str(payload, &["callType", "call_type", "type"]) {
        Some("answered") | Some("completed") => CallType::Answered,
        Some("rejected") | Some("declined") => CallType::Rejected,
        Some("voicemail") => CallType::Voicemail,
        Some("blocked") => CallType::Blocked,
        _ => CallType::Missed,
    };
    Classification::Event(RealtimeEvent::NewCall {
        phone_number: crate::signature::normalize_phone(number),
        direction,
        call_type,
        duration: first_i64(payload, DURATION_KEYS).unwrap_or(0).max(0),
        start_time: first_i64(payload, START_KEYS).unwrap_or_else(crate::db::now_ms),
    })
}

fn malformed(name: &str, payload: &Value) -> Classification {
    warn!("malformed '{}' event payload: {}", name, payload);
    Classification::Malformed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_with_camel_case_aliases() {
        let c = classify(
            "newMessage",
            &json!({
                "fromNumber": "+15559876543",
                "toNumber": "5551234567",
                "messageBody": "hello",
                "createdAt": 1_700_000_000_000i64
            }),
        );
        match c {
            Classification::Event(RealtimeEvent::NewMessage { from, body, .. }) => {
                assert_eq!(from, "+15559876543");
                assert_eq!(body, "hello");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_message_with_snake_case_aliases() {
        let c = classify(
            "new_message",
            &json!({
                "from": "5559876543",
                "to": "5551234567",
                "text": "hi",
                "timestamp": "1700000000000"
            }),
        );
        match c {
            Classification::Event(RealtimeEvent::NewMessage { created_at, .. }) => {
                assert_eq!(created_at, 1_700_000_000_000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_group_message_suppressed() {
        let c = classify(
            "new_message",
            &json!({
                "from": "5559876543",
                "to": "5551234567",
                "body": "group chatter",
                "groupId": "g-123"
            }),
        );
        assert_eq!(c, Classification::Suppressed);
    }

    #[test]
    fn test_malformed_message_dropped_not_panicking() {
        let c = classify("new_message", &json!({ "from": "5559876543" }));
        assert_eq!(c, Classification::Malformed);
        let c = classify("new_message", &json!(null));
        assert_eq!(c, Classification::Malformed);
        let c = classify("new_message", &json!([1, 2, 3]));
        assert_eq!(c, Classification::Malformed);
    }

    #[test]
    fn test_call_prefers_most_specific_number_field() {
        let c = classify(
            "new_call",
            &json!({
                "callerNumber": "5550000001",
                "from": "5550000002",
                "direction": "incoming",
                "type": "answered",
                "duration": 42,
                "startTime": 1_700_000_000_000i64
            }),
        );
        match c {
            Classification::Event(RealtimeEvent::NewCall {
                phone_number,
                call_type,
                duration,
                ..
            }) => {
                assert_eq!(phone_number, "5550000001", "callerNumber специфичнее from");
                assert_eq!(call_type, CallType::Answered);
                assert_eq!(duration, 42);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_name() {
        assert_eq!(classify("lunar_phase", &json!({})), Classification::Unknown);
    }

    #[test]
    fn test_presence_from_status_string() {
        let c = classify(
            "presence_update",
            &json!({ "phoneNumber": "5559876543", "status": "online" })
        );
        match c {
            Classification::Event(RealtimeEvent::Presence { online, .. }) => assert!(online),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_delivered_and_read() {
        let d = classify("delivered", &json!({ "conversationId": "+15559876543" }));
        assert_eq!(
            d,
            Classification::Event(RealtimeEvent::MessageDelivered {
                conversation: "5559876543".into()
            })
        );
        let r = classify("message_read", &json!({ "phone_number": "5559876543" }));
        assert_eq!(
            r,
            Classification::Event(RealtimeEvent::MessageRead {
                conversation: "5559876543".into()
            })
        );
    }
}
