// src/db/call.rs
//
// История звонков. Инвариант: не больше одной записи на (номер, окно 60 секунд).
// Запись из синхронизации или realtime-события, попавшая в окно существующей,
// обновляет её, а не вставляет вторую; заметки (notes) принадлежат клиенту
// и при обновлении с сервера не перетираются.

use rusqlite::params;
use std::sync::Arc;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use super::monitoring::CALL_HISTORY_WRITES;
use super::{now_ms, StoreResult};
use crate::signature::normalize_phone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CallDirection {
    Incoming = 0,
    Outgoing = 1,
}

impl CallDirection {
    pub fn to_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for CallDirection {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CallDirection::Incoming),
            1 => Ok(CallDirection::Outgoing),
            _ => Err(format!("Invalid CallDirection value: {}", value)),
        }
    }
}

/// Терминальный тип звонка в истории (не live-статус сессии).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CallType {
    Answered = 0,
    Missed = 1,
    Rejected = 2,
    Voicemail = 3,
    Blocked = 4,
}

impl CallType {
    pub fn to_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for CallType {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CallType::Answered),
            1 => Ok(CallType::Missed),
            2 => Ok(CallType::Rejected),
            3 => Ok(CallType::Voicemail),
            4 => Ok(CallType::Blocked),
            _ => Err(format!("Invalid CallType value: {}", value)),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub phone_number: String,
    pub direction: CallDirection,
    pub call_type: CallType,
    /// Секунды от соединения до разъединения, 0 если соединения не было.
    pub duration: i64,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub line_number: i64,
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CallRecord {
    pub fn new(
        phone_number: &str,
        direction: CallDirection,
        call_type: CallType,
        duration: i64,
        start_time: i64,
        end_time: Option<i64>,
        line_number: i64,
    ) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::now_v7(),
            phone_number: normalize_phone(phone_number),
            direction,
            call_type,
            duration,
            start_time,
            end_time,
            line_number,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Результат записи с дедупликацией по окну.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted(Uuid),
    Merged(Uuid),
}

impl SaveOutcome {
    pub fn id(self) -> Uuid {
        match self {
            SaveOutcome::Inserted(id) | SaveOutcome::Merged(id) => id,
        }
    }
}

const CALL_COLUMNS: &str = r#"id, phone_number, direction, call_type, duration,
    start_time, end_time, line_number, notes, created_at, updated_at"#;

fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
    let id_blob: Vec<u8> = row.get(0)?;
    let id = Uuid::from_slice(&id_blob).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let direction_raw: i64 = row.get(2)?;
    let type_raw: i64 = row.get(3)?;
    Ok(CallRecord {
        id,
        phone_number: row.get(1)?,
        direction: CallDirection::try_from(direction_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Integer, e.into())
        })?,
        call_type: CallType::try_from(type_raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Integer, e.into())
        })?,
        duration: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        line_number: row.get(7)?,
        notes: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub struct CallRepo {
    conn: Arc<Connection>,
    dedup_window_ms: i64,
}

impl CallRepo {
    pub fn new(conn: Arc<Connection>, dedup_window_ms: i64) -> Self {
        Self {
            conn,
            dedup_window_ms,
        }
    }

    /// Записывает звонок с дедупликацией: если по тому же номеру уже есть
    /// запись со start_time в пределах окна, обновляем её. Существующие
    /// notes сохраняются, длительность берём наибольшую из двух.
    pub async fn save_with_dedup(&self, record: CallRecord) -> StoreResult<SaveOutcome> {
        let window = self.dedup_window_ms;
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<Vec<u8>> = {
                    let mut stmt = tx.prepare(
                        r#"SELECT id FROM call
                         WHERE phone_number = ?1
                           AND start_time BETWEEN ?2 - ?3 AND ?2 + ?3
                         LIMIT 1"#,
                    )?;
                    let mut rows =
                        stmt.query(params![record.phone_number, record.start_time, window])?;
                    match rows.next()? {
                        Some(row) => Some(row.get(0)?),
                        None => None,
                    }
                };
                let outcome = match existing {
                    Some(id_blob) => {
                        tx.execute(
                            r#"UPDATE call SET
                                call_type = ?1,
                                duration = MAX(duration, ?2),
                                end_time = COALESCE(?3, end_time),
                                line_number = ?4,
                                notes = COALESCE(notes, ?5),
                                updated_at = ?6
                             WHERE id = ?7"#,
                            params![
                                record.call_type.to_i64(),
                                record.duration,
                                record.end_time,
                                record.line_number,
                                record.notes,
                                now_ms(),
                                id_blob,
                            ],
                        )?;
                        let id = Uuid::from_slice(&id_blob).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                rusqlite::types::Type::Blob,
                                Box::new(e),
                            )
                        })?;
                        SaveOutcome::Merged(id)
                    }
                    None => {
                        tx.execute(
                            r#"INSERT INTO call (
                                id, phone_number, direction, call_type, duration,
                                start_time, end_time, line_number, notes,
                                created_at, updated_at
                             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
                            params![
                                record.id.as_bytes().to_vec(),
                                record.phone_number,
                                record.direction.to_i64(),
                                record.call_type.to_i64(),
                                record.duration,
                                record.start_time,
                                record.end_time,
                                record.line_number,
                                record.notes,
                                record.created_at,
                                record.updated_at,
                            ],
                        )?;
                        SaveOutcome::Inserted(record.id)
                    }
                };
                tx.commit()?;
                Ok(outcome)
            })
            .await?;
        CALL_HISTORY_WRITES.inc();
        Ok(outcome)
    }

    pub async fn get(&self, id: Uuid) -> StoreResult<Option<CallRecord>> {
        let sql = format!("SELECT {} FROM call WHERE id = ?1", CALL_COLUMNS);
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![id.as_bytes().to_vec()])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_call(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(found)
    }

    pub async fn get_paginated(&self, limit: i64, offset: i64) -> StoreResult<Vec<CallRecord>> {
        let sql = format!(
            r#"SELECT {} FROM call
             ORDER BY start_time DESC
             LIMIT ?1 OFFSET ?2"#,
            CALL_COLUMNS
        );
        let list = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_call(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(list)
    }

    /// Заметка пользователя к звонку: локальный атрибут, сервер о нём не знает.
    pub async fn set_notes(&self, id: Uuid, notes: Option<String>) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE call SET notes = ?1, updated_at = ?2 WHERE id = ?3",
                    params![notes, now_ms(), id.as_bytes().to_vec()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM call WHERE id = ?1",
                    params![id.as_bytes().to_vec()],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_db;

    async fn setup() -> CallRepo {
        let conn = open_in_memory_db().await.expect("in-memory db");
        CallRepo::new(conn, 60_000)
    }

    #[tokio::test]
    async fn test_30s_apart_merges() {
        let repo = setup().await;
        let t = 1_700_000_000_000i64;

        let a = CallRecord::new("+15551234567", CallDirection::Incoming, CallType::Missed, 0, t, None, 1);
        let b = CallRecord::new("5551234567", CallDirection::Incoming, CallType::Answered, 42, t + 30_000, Some(t + 72_000), 1);

        let first = repo.save_with_dedup(a).await.unwrap();
        assert!(matches!(first, SaveOutcome::Inserted(_)));
        let second = repo.save_with_dedup(b).await.unwrap();
        assert!(matches!(second, SaveOutcome::Merged(_)));
        assert_eq!(first.id(), second.id());

        let stored = repo.get(first.id()).await.unwrap().unwrap();
        assert_eq!(stored.call_type, CallType::Answered);
        assert_eq!(stored.duration, 42);
    }

    #[tokio::test]
    async fn test_90s_apart_two_records() {
        let repo = setup().await;
        let t = 1_700_000_000_000i64;

        let a = CallRecord::new("5551234567", CallDirection::Outgoing, CallType::Answered, 10, t, Some(t + 10_000), 1);
        let b = CallRecord::new("5551234567", CallDirection::Outgoing, CallType::Answered, 5, t + 90_000, Some(t + 95_000), 1);

        assert!(matches!(repo.save_with_dedup(a).await.unwrap(), SaveOutcome::Inserted(_)));
        assert!(matches!(repo.save_with_dedup(b).await.unwrap(), SaveOutcome::Inserted(_)));
        assert_eq!(repo.get_paginated(10, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_notes_survive_merge() {
        let repo = setup().await;
        let t = 1_700_000_000_000i64;

        let a = CallRecord::new("5551234567", CallDirection::Incoming, CallType::Answered, 30, t, Some(t + 30_000), 1);
        let id = repo.save_with_dedup(a).await.unwrap().id();
        repo.set_notes(id, Some("перезвонить в среду".into())).await.unwrap();

        // Серверная копия того же звонка: без заметок
        let b = CallRecord::new("5551234567", CallDirection::Incoming, CallType::Answered, 30, t + 5_000, Some(t + 35_000), 1);
        let merged = repo.save_with_dedup(b).await.unwrap();
        assert_eq!(merged.id(), id);
        assert_eq!(
            repo.get(id).await.unwrap().unwrap().notes.as_deref(),
            Some("перезвонить в среду")
        );
    }

    #[tokio::test]
    async fn test_different_numbers_do_not_merge() {
        let repo = setup().await;
        let t = 1_700_000_000_000i64;
        let a = CallRecord::new("5551234567", CallDirection::Incoming, CallType::Missed, 0, t, None, 1);
        let b = CallRecord::new("5559876543", CallDirection::Incoming, CallType::Missed, 0, t, None, 1);
        repo.save_with_dedup(a).await.unwrap();
        repo.save_with_dedup(b).await.unwrap();
        assert_eq!(repo.get_paginated(10, 0).await.unwrap().len(), 2);
    }
}
