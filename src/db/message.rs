// src/db/message.rs
//
// Сообщения. Вставка идемпотентна: INSERT OR IGNORE по уникальной сигнатуре,
// выигрывает первый записавший, повторная вставка - это Ok(false), а не ошибка.
// Обновление диалога происходит в той же транзакции, что и вставка сообщения.

use rusqlite::params;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use super::monitoring::MESSAGES_DEDUPED;
use super::{now_ms, StoreResult};
use crate::signature::{normalize_phone, SignatureEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageDirection {
    Incoming = 0,
    Outgoing = 1,
}

impl MessageDirection {
    pub fn to_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for MessageDirection {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageDirection::Incoming),
            1 => Ok(MessageDirection::Outgoing),
            _ => Err(format!("Invalid MessageDirection value: {}", value)),
        }
    }
}

/// Статусы транспорта. Порядок значим: upgrade_status повышает статус только
/// вперёд (Pending -> ... -> Read), Failed назначается явно и никогда не
/// перетирается повышением.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MessageStatus {
    Pending = 0,
    Sending = 1,
    Sent = 2,
    Delivered = 3,
    Received = 4,
    Read = 5,
    Failed = 6,
}

impl MessageStatus {
    pub fn to_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for MessageStatus {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageStatus::Pending),
            1 => Ok(MessageStatus::Sending),
            2 => Ok(MessageStatus::Sent),
            3 => Ok(MessageStatus::Delivered),
            4 => Ok(MessageStatus::Received),
            5 => Ok(MessageStatus::Read),
            6 => Ok(MessageStatus::Failed),
            _ => Err(format!("Invalid MessageStatus value: {}", value)),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: String,
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    pub direction: MessageDirection,
    pub status: MessageStatus,
    pub media_urls: Vec<String>,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub delivered_at: Option<i64>,
    pub signature: String,
}

impl Message {
    /// Исходящее сообщение: диалог ведётся по нормализованному номеру получателя.
    pub fn outgoing(
        engine: &SignatureEngine,
        from: &str,
        to: &str,
        body: &str,
        media_urls: Vec<String>,
        created_at: i64,
    ) -> Self {
        let signature = engine.compute(from, to, body, created_at);
        Self {
            id: Uuid::now_v7(),
            conversation_id: normalize_phone(to),
            from_number: normalize_phone(from),
            to_number: normalize_phone(to),
            body: body.to_string(),
            direction: MessageDirection::Outgoing,
            status: MessageStatus::Pending,
            media_urls,
            created_at,
            sent_at: None,
            delivered_at: None,
            signature,
        }
    }

    /// Входящее сообщение (из realtime-события или из синхронизации).
    pub fn incoming(
        engine: &SignatureEngine,
        from: &str,
        to: &str,
        body: &str,
        media_urls: Vec<String>,
        created_at: i64,
    ) -> Self {
        let signature = engine.compute(from, to, body, created_at);
        Self {
            id: Uuid::now_v7(),
            conversation_id: normalize_phone(from),
            from_number: normalize_phone(from),
            to_number: normalize_phone(to),
            body: body.to_string(),
            direction: MessageDirection::Incoming,
            status: MessageStatus::Received,
            media_urls,
            created_at,
            sent_at: None,
            delivered_at: None,
            signature,
        }
    }
}

const MESSAGE_COLUMNS: &str = r#"id, conversation_id, from_number, to_number, body,
    direction, status, media_urls, created_at, sent_at, delivered_at, signature"#;

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_blob: Vec<u8> = row.get(0)?;
    let id = Uuid::from_slice(&id_blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let direction_raw: i64 = row.get(5)?;
    let status_raw: i64 = row.get(6)?;
    let media_raw: Option<String> = row.get(7)?;
    let media_urls = match media_raw {
        Some(json) => serde_json::from_str(&json).unwrap_or_default(),
        None => Vec::new(),
    };
    Ok(Message {
        id,
        conversation_id: row.get(1)?,
        from_number: row.get(2)?,
        to_number: row.get(3)?,
        body: row.get(4)?,
        direction: MessageDirection::try_from(direction_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Integer,
                e.into(),
            )
        })?,
        status: MessageStatus::try_from(status_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Integer,
                e.into(),
            )
        })?,
        media_urls,
        created_at: row.get(8)?,
        sent_at: row.get(9)?,
        delivered_at: row.get(10)?,
        signature: row.get(11)?,
    })
}

pub struct MessageRepo {
    conn: Arc<Connection>,
}

impl MessageRepo {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Идемпотентная вставка. Возвращает true, если строка реально записана,
    /// и false при коллизии сигнатуры (дубликат из другого источника).
    ///
    /// Диалог создаётся/обновляется в той же транзакции: last_message сдвигается
    /// только вперёд по времени, счётчик непрочитанного растёт на входящих.
    pub async fn insert_if_absent(&self, message: Message) -> StoreResult<bool> {
        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = tx.execute(
                    r#"INSERT OR IGNORE INTO message (
                        id, conversation_id, from_number, to_number, body,
                        direction, status, media_urls, created_at, sent_at,
                        delivered_at, signature
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"#,
                    params![
                        message.id.as_bytes().to_vec(),
                        message.conversation_id,
                        message.from_number,
                        message.to_number,
                        message.body,
                        message.direction.to_i64(),
                        message.status.to_i64(),
                        serde_json::to_string(&message.media_urls).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?,
                        message.created_at,
                        message.sent_at,
                        message.delivered_at,
                        message.signature,
                    ],
                )?;
                let inserted = changed == 1;
                if inserted {
                    let unread_inc = i64::from(
                        message.direction == MessageDirection::Incoming
                            && message.status != MessageStatus::Read,
                    );
                    let now = now_ms();
                    tx.execute(
                        r#"INSERT INTO conversation (
                            id, last_message, last_message_time, unread_count,
                            created_at, updated_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                         ON CONFLICT (id) DO UPDATE SET
                            last_message = CASE
                                WHEN excluded.last_message_time >= conversation.last_message_time
                                THEN excluded.last_message
                                ELSE conversation.last_message
                            END,
                            last_message_time = CASE
                                WHEN excluded.last_message_time >= conversation.last_message_time
                                THEN excluded.last_message_time
                                ELSE conversation.last_message_time
                            END,
                            unread_count = conversation.unread_count + ?4,
                            updated_at = excluded.updated_at"#,
                        params![
                            message.conversation_id,
                            message.body,
                            message.created_at,
                            unread_inc,
                            now,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?;
        if !inserted {
            MESSAGES_DEDUPED.inc();
        }
        Ok(inserted)
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<Option<Message>> {
        let sql = format!("SELECT {} FROM message WHERE id = ?1", MESSAGE_COLUMNS);
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![id.as_bytes().to_vec()])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_message(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(found)
    }

    pub async fn get_by_signature(&self, signature: &str) -> StoreResult<Option<Message>> {
        let sql = format!(
            "SELECT {} FROM message WHERE signature = ?1",
            MESSAGE_COLUMNS
        );
        let signature = signature.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![signature])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_message(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(found)
    }

    pub async fn get_for_conversation(
        &self,
        conversation_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Message>> {
        let sql = format!(
            r#"SELECT {} FROM message
             WHERE conversation_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3"#,
            MESSAGE_COLUMNS
        );
        let conversation_id = conversation_id.to_string();
        let messages = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![conversation_id, limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(messages)
    }

    pub async fn get_by_status(&self, status: MessageStatus) -> StoreResult<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM message WHERE status = ?1 ORDER BY created_at ASC",
            MESSAGE_COLUMNS
        );
        let messages = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![status.to_i64()])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(messages)
    }

    pub async fn set_status(&self, id: Uuid, status: MessageStatus) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE message SET status = ?1 WHERE id = ?2",
                    params![status.to_i64(), id.as_bytes().to_vec()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn mark_sent(&self, id: Uuid, sent_at: i64) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"UPDATE message
                     SET status = ?1, sent_at = COALESCE(sent_at, ?2)
                     WHERE id = ?3"#,
                    params![
                        MessageStatus::Sent.to_i64(),
                        sent_at,
                        id.as_bytes().to_vec()
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Отправка не удалась: сообщение остаётся видимым и повторяемым.
    /// Failed назначается только из Pending/Sending, подтверждённый статус
    /// обратно не понижаем.
    pub async fn mark_failed(&self, id: Uuid) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"UPDATE message SET status = ?1
                     WHERE id = ?2 AND status IN (?3, ?4)"#,
                    params![
                        MessageStatus::Failed.to_i64(),
                        id.as_bytes().to_vec(),
                        MessageStatus::Pending.to_i64(),
                        MessageStatus::Sending.to_i64(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Повышает статус строго вперёд. Failed повышением не перетирается
    /// и сам ничего не перетирает.
    pub async fn upgrade_status_by_signature(
        &self,
        signature: &str,
        status: MessageStatus,
        sent_at: Option<i64>,
        delivered_at: Option<i64>,
    ) -> StoreResult<bool> {
        let signature = signature.to_string();
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    r#"UPDATE message
                     SET status = ?2,
                         sent_at = COALESCE(sent_at, ?3),
                         delivered_at = COALESCE(delivered_at, ?4)
                     WHERE signature = ?1
                       AND status < ?2
                       AND status != ?5"#,
                    params![
                        signature,
                        status.to_i64(),
                        sent_at,
                        delivered_at,
                        MessageStatus::Failed.to_i64(),
                    ],
                )?;
                Ok(changed == 1)
            })
            .await?;
        Ok(changed)
    }

    /// Пользователь открыл диалог: входящие становятся прочитанными,
    /// счётчик непрочитанного обнуляется. Одна транзакция.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"UPDATE message SET status = ?1
                     WHERE conversation_id = ?2 AND direction = ?3 AND status = ?4"#,
                    params![
                        MessageStatus::Read.to_i64(),
                        conversation_id,
                        MessageDirection::Incoming.to_i64(),
                        MessageStatus::Received.to_i64(),
                    ],
                )?;
                tx.execute(
                    "UPDATE conversation SET unread_count = 0, updated_at = ?1 WHERE id = ?2",
                    params![now_ms(), conversation_id],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Сервер сообщил о доставке: исходящие Sent -> Delivered.
    pub async fn apply_remote_delivered(&self, conversation_id: &str) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"UPDATE message
                     SET status = ?1, delivered_at = COALESCE(delivered_at, ?2)
                     WHERE conversation_id = ?3 AND direction = ?4 AND status = ?5"#,
                    params![
                        MessageStatus::Delivered.to_i64(),
                        now_ms(),
                        conversation_id,
                        MessageDirection::Outgoing.to_i64(),
                        MessageStatus::Sent.to_i64(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Собеседник прочитал: исходящие Sent/Delivered -> Read.
    pub async fn apply_remote_read(&self, conversation_id: &str) -> StoreResult<()> {
        let conversation_id = conversation_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"UPDATE message SET status = ?1
                     WHERE conversation_id = ?2 AND direction = ?3 AND status IN (?4, ?5)"#,
                    params![
                        MessageStatus::Read.to_i64(),
                        conversation_id,
                        MessageDirection::Outgoing.to_i64(),
                        MessageStatus::Sent.to_i64(),
                        MessageStatus::Delivered.to_i64(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_many(&self, ids: Vec<Uuid>) -> StoreResult<usize> {
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut deleted = 0usize;
                {
                    let mut stmt = tx.prepare("DELETE FROM message WHERE id = ?1")?;
                    for id in &ids {
                        deleted += stmt.execute(params![id.as_bytes().to_vec()])?;
                    }
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_db;
    use crate::signature::HashBackend;

    fn engine() -> SignatureEngine {
        SignatureEngine::new(300_000, HashBackend::Sha256)
    }

    async fn setup() -> MessageRepo {
        let conn = open_in_memory_db().await.expect("in-memory db");
        MessageRepo::new(conn)
    }

    #[tokio::test]
    async fn test_double_insert_is_single_row() {
        let repo = setup().await;
        let e = engine();
        let t = 1_700_000_000_000i64;

        let a = Message::outgoing(&e, "5551234567", "5559876543", "Hi", vec![], t);
        let b = Message::outgoing(&e, "5551234567", "5559876543", "Hi", vec![], t);

        assert!(repo.insert_if_absent(a).await.unwrap());
        assert!(!repo.insert_if_absent(b).await.unwrap(), "дубликат - это Ok(false)");

        let msgs = repo.get_for_conversation("5559876543", 10, 0).await.unwrap();
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn test_jittered_timestamp_dedups() {
        let repo = setup().await;
        let e = engine();
        let t = 1_700_000_000_000i64;
        let t0 = t - t.rem_euclid(300_000);

        // Локальная отправка в t0, серверная копия того же сообщения через 90 секунд
        let local = Message::outgoing(&e, "5551234567", "5559876543", "Hi", vec![], t0);
        let synced = Message::outgoing(&e, "+15551234567", "5559876543", "Hi", vec![], t0 + 90_000);
        let sig = local.signature.clone();

        assert!(repo.insert_if_absent(local).await.unwrap());
        assert!(!repo.insert_if_absent(synced).await.unwrap());

        // PENDING -> SENT при подтверждении с сервера, строка одна
        assert!(repo
            .upgrade_status_by_signature(&sig, MessageStatus::Sent, Some(t0 + 90_000), None)
            .await
            .unwrap());
        let stored = repo.get_by_signature(&sig).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.sent_at, Some(t0 + 90_000));
    }

    #[tokio::test]
    async fn test_six_minutes_apart_two_rows() {
        let repo = setup().await;
        let e = engine();
        let t = 1_700_000_000_000i64;
        let t0 = t - t.rem_euclid(300_000);

        let a = Message::outgoing(&e, "5551234567", "5559876543", "Hi", vec![], t0);
        let b = Message::outgoing(&e, "5551234567", "5559876543", "Hi", vec![], t0 + 360_000);

        assert!(repo.insert_if_absent(a).await.unwrap());
        assert!(repo.insert_if_absent(b).await.unwrap());

        let msgs = repo.get_for_conversation("5559876543", 10, 0).await.unwrap();
        assert_eq!(msgs.len(), 2, "6 минут - разные корзины, повтор легален");
    }

    #[tokio::test]
    async fn test_incoming_bumps_unread() {
        let repo = setup().await;
        let e = engine();
        let t = 1_700_000_000_000i64;

        let a = Message::incoming(&e, "5559876543", "5551234567", "ping", vec![], t);
        let b = Message::incoming(&e, "5559876543", "5551234567", "ping again", vec![], t + 1000);
        repo.insert_if_absent(a).await.unwrap();
        repo.insert_if_absent(b).await.unwrap();

        let unread: i64 = repo
            .conn
            .call(|c| {
                Ok(c.query_row(
                    "SELECT unread_count FROM conversation WHERE id = '5559876543'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(unread, 2);

        repo.mark_conversation_read("5559876543").await.unwrap();
        let unread: i64 = repo
            .conn
            .call(|c| {
                Ok(c.query_row(
                    "SELECT unread_count FROM conversation WHERE id = '5559876543'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(unread, 0);

        let msgs = repo.get_for_conversation("5559876543", 10, 0).await.unwrap();
        assert!(msgs.iter().all(|m| m.status == MessageStatus::Read));
    }

    #[tokio::test]
    async fn test_failed_not_overwritten_by_upgrade() {
        let repo = setup().await;
        let e = engine();
        let msg = Message::outgoing(&e, "5551234567", "5559876543", "oops", vec![], 1_700_000_000_000);
        let id = msg.id;
        let sig = msg.signature.clone();
        repo.insert_if_absent(msg).await.unwrap();

        repo.set_status(id, MessageStatus::Sending).await.unwrap();
        repo.mark_failed(id).await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);

        // Запоздавшее "delivered" с сервера не воскрешает проваленную отправку
        assert!(!repo
            .upgrade_status_by_signature(&sig, MessageStatus::Delivered, None, Some(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_remote_read_receipt() {
        let repo = setup().await;
        let e = engine();
        let msg = Message::outgoing(&e, "5551234567", "5559876543", "Hi", vec![], 1_700_000_000_000);
        let id = msg.id;
        repo.insert_if_absent(msg).await.unwrap();
        repo.mark_sent(id, 1_700_000_001_000).await.unwrap();

        repo.apply_remote_delivered("5559876543").await.unwrap();
        assert_eq!(
            repo.get(id).await.unwrap().unwrap().status,
            MessageStatus::Delivered
        );

        repo.apply_remote_read("5559876543").await.unwrap();
        assert_eq!(
            repo.get(id).await.unwrap().unwrap().status,
            MessageStatus::Read
        );
    }

    #[tokio::test]
    async fn test_delete_many() {
        let repo = setup().await;
        let e = engine();
        let a = Message::incoming(&e, "5559876543", "5551234567", "a", vec![], 1_000_000);
        let b = Message::incoming(&e, "5559876543", "5551234567", "b", vec![], 2_000_000);
        let ids = vec![a.id, b.id];
        repo.insert_if_absent(a).await.unwrap();
        repo.insert_if_absent(b).await.unwrap();

        assert_eq!(repo.delete_many(ids).await.unwrap(), 2);
        assert!(repo
            .get_for_conversation("5559876543", 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_media_urls_roundtrip() {
        let repo = setup().await;
        let e = engine();
        let urls = vec!["https://cdn.example.com/a.jpg".to_string()];
        let msg = Message::incoming(&e, "5559876543", "5551234567", "photo", urls.clone(), 1_700_000_000_000);
        let id = msg.id;
        repo.insert_if_absent(msg).await.unwrap();
        assert_eq!(repo.get(id).await.unwrap().unwrap().media_urls, urls);
    }
}
