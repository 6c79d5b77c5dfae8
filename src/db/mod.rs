// src/db/mod.rs
//
// Локальное хранилище: единственный владелец персистентного состояния.
// Все писатели (локальные действия, синхронизация, realtime-события) проходят
// через репозитории этого модуля; идемпотентность вставки сообщений
// обеспечивается уникальным индексом по сигнатуре на уровне SQLite.

pub mod cache;
pub mod call;
pub mod contact;
pub mod conversation;
pub mod message;
pub mod migrations;
pub mod monitor;
pub mod monitoring;
pub mod schema;

use std::sync::Arc;

use thiserror::Error;
use tokio_rusqlite::{Connection, OpenFlags};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql: {0}")]
    Sql(#[from] tokio_rusqlite::Error),
    #[error("corrupted row: {0}")]
    Corrupted(String),
    #[error("not found")]
    NotFound,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Текущее время в unix-миллисекундах.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Открывает зашифрованную (SQLCipher) базу и прогоняет миграции.
pub async fn open_encrypted_db(path: &str, key: &str) -> StoreResult<Arc<Connection>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )
    .await?;
    let key = key.replace('\'', "''");
    conn.call(move |conn| {
        conn.execute_batch(&format!("PRAGMA key = '{}';", key))?;
        Ok(())
    })
    .await?;
    migrations::setup_migrations(&conn).await?;
    Ok(Arc::new(conn))
}

/// База в памяти: для тестов и демо.
pub async fn open_in_memory_db() -> StoreResult<Arc<Connection>> {
    let conn = Connection::open_in_memory().await?;
    migrations::setup_migrations(&conn).await?;
    Ok(Arc::new(conn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let conn = open_in_memory_db().await.unwrap();
        let ver: i32 = conn
            .call(|c| Ok(c.query_row("PRAGMA user_version;", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(ver, migrations::LATEST_SCHEMA_VERSION);
    }
}
