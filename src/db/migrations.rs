use tokio_rusqlite::{Connection, Result};

use crate::db::schema::{SCHEMA_V1, SCHEMA_V2};

/// Последняя версия схемы, которую знает это ядро.
pub const LATEST_SCHEMA_VERSION: i32 = 2;

pub async fn setup_migrations(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        // Узнаём текущую версию схемы
        let ver: i32 = conn.query_row("PRAGMA user_version;", [], |r| r.get(0))?;

        // Если 0 -> выполняем SCHEMA_V1
        if ver < 1 {
            conn.execute_batch(SCHEMA_V1)?;
        }

        // v2: сигнатура сообщения + уникальный индекс (с бэкфиллом по id)
        if ver < 2 {
            conn.execute_batch(SCHEMA_V2)?;
        }

        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    #[tokio::test]
    async fn test_fresh_db_gets_latest_version() {
        let conn = Connection::open_in_memory().await.unwrap();
        setup_migrations(&conn).await.unwrap();
        let ver: i32 = conn
            .call(|c| Ok(c.query_row("PRAGMA user_version;", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(ver, LATEST_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().await.unwrap();
        setup_migrations(&conn).await.unwrap();
        // Повторный прогон ничего не ломает
        setup_migrations(&conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_v2_backfill_no_collisions() {
        let conn = Connection::open_in_memory().await.unwrap();
        // Поднимаем только v1 и вставляем "старые" строки без сигнатуры
        conn.call(|c| {
            c.execute_batch(SCHEMA_V1)?;
            for i in 0..3u8 {
                let id = uuid::Uuid::now_v7();
                c.execute(
                    r#"INSERT INTO message (
                        id, conversation_id, from_number, to_number, body,
                        direction, status, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 4, ?6)"#,
                    params![
                        id.as_bytes().to_vec(),
                        "5551234567",
                        "5551234567",
                        "5559876543",
                        format!("old {}", i),
                        1_700_000_000_000i64 + i as i64
                    ],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        setup_migrations(&conn).await.unwrap();

        let (total, distinct): (i64, i64) = conn
            .call(|c| {
                let total: i64 =
                    c.query_row("SELECT COUNT(*) FROM message", [], |r| r.get(0))?;
                let distinct: i64 = c.query_row(
                    "SELECT COUNT(DISTINCT signature) FROM message",
                    [],
                    |r| r.get(0),
                )?;
                Ok((total, distinct))
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(distinct, 3, "бэкфилл не должен породить коллизий");
    }
}
