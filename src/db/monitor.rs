// src/db/monitor.rs
//
// Монитор изменений. Хранилище - единственный владелец состояния, поэтому
// подписчики (список диалогов, бейдж непрочитанного) слушают не писателей,
// а саму базу: preupdate-hook SQLite ловит INSERT/UPDATE/DELETE, события
// уходят в mpsc-очередь, отдельная задача раздаёт их по broadcast-каналу.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, warn};
use rusqlite::hooks::{Action, PreUpdateCase, PreUpdateNewValueAccessor, PreUpdateOldValueAccessor};
use rusqlite::types::ValueRef;
use tokio::sync::{broadcast, mpsc};
use tokio_rusqlite::Connection;

use super::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Message,
    Conversation,
    Call,
    Contact,
    Other,
}

impl EntityKind {
    fn from_table(table: &str) -> Self {
        match table {
            "message" => EntityKind::Message,
            "conversation" => EntityKind::Conversation,
            "call" => EntityKind::Call,
            "contact" => EntityKind::Contact,
            _ => EntityKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
    Unknown,
}

/// Событие изменения, получаемое из preupdate-hook.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub op: ChangeOp,
    pub rowid: i64,
    /// Старые и новые значения строки в отладочном виде ("col_i" -> строка).
    pub old_values: Option<Vec<(String, String)>>,
    pub new_values: Option<Vec<(String, String)>>,
}

/// Сбор значений для старой строки.
fn collect_old_values(acc: &PreUpdateOldValueAccessor) -> Vec<(String, String)> {
    let col_count = acc.get_column_count();
    let mut out = Vec::new();
    for i in 0..col_count {
        if let Ok(val) = acc.get_old_column_value(i) {
            out.push((format!("col_{}", i), value_to_string(val)));
        }
    }
    out
}

/// Сбор значений для новой строки.
fn collect_new_values(acc: &PreUpdateNewValueAccessor) -> Vec<(String, String)> {
    let col_count = acc.get_column_count();
    let mut out = Vec::new();
    for i in 0..col_count {
        if let Ok(val) = acc.get_new_column_value(i) {
            out.push((format!("col_{}", i), value_to_string(val)));
        }
    }
    out
}

/// Преобразование ValueRef в строку (blob - base64).
fn value_to_string(v: ValueRef<'_>) -> String {
    match v {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(r) => r.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).to_string(),
        ValueRef::Blob(b) => BASE64.encode(b),
    }
}

pub struct ChangeMonitor {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeMonitor {
    /// Регистрирует hook и запускает диспетчер. Вызывается один раз при
    /// инициализации базы.
    pub async fn install(conn: &Connection) -> StoreResult<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<ChangeEvent>();

        conn.call(move |conn| {
            conn.preupdate_hook(Some(
                move |action: Action, _db: &str, table: &str, case: &PreUpdateCase| {
                    let op = match action {
                        Action::SQLITE_INSERT => ChangeOp::Insert,
                        Action::SQLITE_DELETE => ChangeOp::Delete,
                        Action::SQLITE_UPDATE => ChangeOp::Update,
                        _ => ChangeOp::Unknown,
                    };
                    let (rowid, old_values, new_values) = match case {
                        PreUpdateCase::Insert(new_acc) => (
                            new_acc.get_new_row_id(),
                            None,
                            Some(collect_new_values(new_acc)),
                        ),
                        PreUpdateCase::Delete(old_acc) => (
                            old_acc.get_old_row_id(),
                            Some(collect_old_values(old_acc)),
                            None,
                        ),
                        PreUpdateCase::Update {
                            old_value_accessor,
                            new_value_accessor,
                        } => (
                            new_value_accessor.get_new_row_id(),
                            Some(collect_old_values(old_value_accessor)),
                            Some(collect_new_values(new_value_accessor)),
                        ),
                        PreUpdateCase::Unknown => (0, None, None),
                    };
                    let event = ChangeEvent {
                        entity: EntityKind::from_table(table),
                        op,
                        rowid,
                        old_values,
                        new_values,
                    };
                    if let Err(e) = raw_tx.send(event) {
                        warn!("change monitor queue closed: {}", e);
                    }
                },
            ));
            Ok(())
        })
        .await?;

        let (tx, _) = broadcast::channel(256);
        let fanout = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                debug!(
                    "db change: {:?} {:?} rowid={}",
                    event.entity, event.op, event.rowid
                );
                // Ошибка значит "нет подписчиков" - это нормально
                let _ = fanout.send(event);
            }
        });

        Ok(Self { tx })
    }

    /// Подписка на изменения. Отстающий подписчик получает Lagged, а не
    /// блокирует остальных.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_db;
    use rusqlite::params;
    use std::time::Duration;

    #[tokio::test]
    async fn test_insert_event_reaches_subscriber() {
        let conn = open_in_memory_db().await.unwrap();
        let monitor = ChangeMonitor::install(&conn).await.unwrap();
        let mut rx = monitor.subscribe();

        conn.call(|c| {
            c.execute(
                r#"INSERT INTO conversation (id, created_at, updated_at)
                 VALUES ('5551234567', 1, 1)"#,
                params![],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for change event")
            .expect("channel closed");
        assert_eq!(event.entity, EntityKind::Conversation);
        assert_eq!(event.op, ChangeOp::Insert);
        assert!(event.new_values.is_some());
    }

    #[tokio::test]
    async fn test_delete_event() {
        let conn = open_in_memory_db().await.unwrap();
        let monitor = ChangeMonitor::install(&conn).await.unwrap();
        let mut rx = monitor.subscribe();

        conn.call(|c| {
            c.execute(
                r#"INSERT INTO conversation (id, created_at, updated_at)
                 VALUES ('5551234567', 1, 1)"#,
                params![],
            )?;
            c.execute("DELETE FROM conversation WHERE id = '5551234567'", params![])?;
            Ok(())
        })
        .await
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.op, ChangeOp::Insert);
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.op, ChangeOp::Delete);
        assert!(second.new_values.is_none());
        assert!(second.old_values.is_some());
    }
}
