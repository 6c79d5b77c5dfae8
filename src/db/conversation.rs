// src/db/conversation.rs
//
// Диалоги - производные данные: строка создаётся и обновляется вставкой
// сообщений (см. message.rs), здесь - чтение списка, флаги и явное удаление
// пользователем с каскадом на сообщения.

use rusqlite::params;
use std::sync::Arc;
use tokio_rusqlite::Connection;

use super::{now_ms, StoreResult};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Conversation {
    pub id: String,
    pub last_message: String,
    pub last_message_time: i64,
    pub unread_count: i64,
    pub is_archived: bool,
    pub is_muted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        last_message: row.get(1)?,
        last_message_time: row.get(2)?,
        unread_count: row.get(3)?,
        is_archived: row.get::<_, i64>(4)? != 0,
        is_muted: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const CONVERSATION_COLUMNS: &str = r#"id, last_message, last_message_time, unread_count,
    is_archived, is_muted, created_at, updated_at"#;

pub struct ConversationRepo {
    conn: Arc<Connection>,
}

impl ConversationRepo {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<Conversation>> {
        let sql = format!(
            "SELECT {} FROM conversation WHERE id = ?1",
            CONVERSATION_COLUMNS
        );
        let id = id.to_string();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_conversation(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(found)
    }

    /// Список для экрана диалогов: свежие сверху, архив опционально.
    pub async fn get_all(&self, include_archived: bool) -> StoreResult<Vec<Conversation>> {
        let sql = format!(
            r#"SELECT {} FROM conversation
             WHERE (?1 OR is_archived = 0)
             ORDER BY last_message_time DESC"#,
            CONVERSATION_COLUMNS
        );
        let list = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![include_archived])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_conversation(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(list)
    }

    pub async fn set_archived(&self, id: &str, archived: bool) -> StoreResult<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE conversation SET is_archived = ?1, updated_at = ?2 WHERE id = ?3",
                    params![archived, now_ms(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn set_muted(&self, id: &str, muted: bool) -> StoreResult<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE conversation SET is_muted = ?1, updated_at = ?2 WHERE id = ?3",
                    params![muted, now_ms(), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Явное удаление пользователем. Каскад на сообщения, одна транзакция.
    pub async fn delete_with_messages(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM message WHERE conversation_id = ?1", params![id])?;
                tx.execute("DELETE FROM conversation WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Суммарное непрочитанное для бейджа приложения.
    pub async fn total_unread(&self) -> StoreResult<i64> {
        let total = self
            .conn
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COALESCE(SUM(unread_count), 0) FROM conversation WHERE is_muted = 0",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::message::{Message, MessageRepo};
    use crate::db::open_in_memory_db;
    use crate::signature::{HashBackend, SignatureEngine};

    async fn setup() -> (ConversationRepo, MessageRepo) {
        let conn = open_in_memory_db().await.expect("in-memory db");
        (
            ConversationRepo::new(conn.clone()),
            MessageRepo::new(conn),
        )
    }

    fn engine() -> SignatureEngine {
        SignatureEngine::new(300_000, HashBackend::Sha256)
    }

    #[tokio::test]
    async fn test_created_on_first_message() {
        let (convs, msgs) = setup().await;
        let e = engine();
        let m = Message::incoming(&e, "5559876543", "5551234567", "hello", vec![], 1_700_000_000_000);
        msgs.insert_if_absent(m).await.unwrap();

        let conv = convs.get("5559876543").await.unwrap().unwrap();
        assert_eq!(conv.last_message, "hello");
        assert_eq!(conv.unread_count, 1);
    }

    #[tokio::test]
    async fn test_ordering_and_archive_filter() {
        let (convs, msgs) = setup().await;
        let e = engine();
        msgs.insert_if_absent(Message::incoming(&e, "5550000001", "5551234567", "a", vec![], 1_000_000))
            .await
            .unwrap();
        msgs.insert_if_absent(Message::incoming(&e, "5550000002", "5551234567", "b", vec![], 2_000_000))
            .await
            .unwrap();

        let all = convs.get_all(true).await.unwrap();
        assert_eq!(all[0].id, "5550000002", "свежий диалог сверху");

        convs.set_archived("5550000002", true).await.unwrap();
        let visible = convs.get_all(false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "5550000001");
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let (convs, msgs) = setup().await;
        let e = engine();
        msgs.insert_if_absent(Message::incoming(&e, "5550000001", "5551234567", "a", vec![], 1_000_000))
            .await
            .unwrap();
        msgs.insert_if_absent(Message::incoming(&e, "5550000001", "5551234567", "b", vec![], 2_000_000))
            .await
            .unwrap();

        convs.delete_with_messages("5550000001").await.unwrap();
        assert!(convs.get("5550000001").await.unwrap().is_none());
        assert!(msgs
            .get_for_conversation("5550000001", 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_muted_excluded_from_badge() {
        let (convs, msgs) = setup().await;
        let e = engine();
        msgs.insert_if_absent(Message::incoming(&e, "5550000001", "5551234567", "a", vec![], 1_000_000))
            .await
            .unwrap();
        msgs.insert_if_absent(Message::incoming(&e, "5550000002", "5551234567", "b", vec![], 2_000_000))
            .await
            .unwrap();
        assert_eq!(convs.total_unread().await.unwrap(), 2);

        convs.set_muted("5550000002", true).await.unwrap();
        assert_eq!(convs.total_unread().await.unwrap(), 1);
    }
}
