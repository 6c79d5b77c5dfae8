// src/db/contact.rs
//
// Контакты. Сервер владеет именем/почтой/аватаром, клиент - флагами
// is_favorite / is_blocked. Полная замена таблицы при синхронизации легальна
// (данные производные), но только после снимка локальных флагов, которые
// реконсилятор прикрепляет обратно.

use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rusqlite::Connection;

use super::cache::CacheHandler;
use super::{now_ms, StoreResult};
use crate::signature::normalize_phone;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Contact {
    pub phone_number: String,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub picture_url: Option<String>,
    pub is_favorite: bool,
    pub is_blocked: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Contact {
    pub fn new(phone_number: &str) -> Self {
        let now = now_ms();
        Self {
            phone_number: normalize_phone(phone_number),
            first_name: String::new(),
            last_name: String::new(),
            email: None,
            picture_url: None,
            is_favorite: false,
            is_blocked: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.phone_number.clone()
        } else {
            full.to_string()
        }
    }
}

/// Локальные флаги контакта, снятые до записи серверного снапшота.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactPrefs {
    pub is_favorite: bool,
    pub is_blocked: bool,
}

const CONTACT_COLUMNS: &str = r#"phone_number, first_name, last_name, email, picture_url,
    is_favorite, is_blocked, created_at, updated_at"#;

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        phone_number: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        picture_url: row.get(4)?,
        is_favorite: row.get::<_, i64>(5)? != 0,
        is_blocked: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub struct ContactRepo {
    conn: Arc<Connection>,
    cache: CacheHandler,
}

impl ContactRepo {
    pub fn new(conn: Arc<Connection>, cache: CacheHandler) -> Self {
        Self { conn, cache }
    }

    pub async fn get(&self, phone_number: &str) -> StoreResult<Option<Contact>> {
        let key = normalize_phone(phone_number);
        if let Some(hit) = self.cache.get_contact(&key) {
            return Ok(Some(hit));
        }
        let sql = format!(
            "SELECT {} FROM contact WHERE phone_number = ?1",
            CONTACT_COLUMNS
        );
        let lookup = key.clone();
        let found = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![lookup])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_contact(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        if let Some(contact) = &found {
            self.cache.put_contact(key, contact.clone());
        }
        Ok(found)
    }

    pub async fn get_paginated(&self, offset: i64, limit: i64) -> StoreResult<Vec<Contact>> {
        let sql = format!(
            r#"SELECT {} FROM contact
             ORDER BY first_name, last_name, phone_number
             LIMIT ?1 OFFSET ?2"#,
            CONTACT_COLUMNS
        );
        let list = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![limit, offset])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_contact(row)?);
                }
                Ok(out)
            })
            .await?;
        Ok(list)
    }

    /// Снимок локальных флагов по нормализованному номеру. Одноразовый:
    /// реконсилятор строит его в начале прохода и выбрасывает в конце,
    /// между проходами снимок не живёт.
    pub async fn snapshot_preferences(&self) -> StoreResult<HashMap<String, ContactPrefs>> {
        let map = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT phone_number, is_favorite, is_blocked FROM contact
                     WHERE is_favorite != 0 OR is_blocked != 0"#,
                )?;
                let mut rows = stmt.query([])?;
                let mut out = HashMap::new();
                while let Some(row) = rows.next()? {
                    let number: String = row.get(0)?;
                    out.insert(
                        number,
                        ContactPrefs {
                            is_favorite: row.get::<_, i64>(1)? != 0,
                            is_blocked: row.get::<_, i64>(2)? != 0,
                        },
                    );
                }
                Ok(out)
            })
            .await?;
        Ok(map)
    }

    /// Полная замена таблицы серверным снапшотом (флаги уже прикреплены
    /// вызывающей стороной). Одна транзакция, кэш сбрасывается.
    pub async fn replace_all(&self, contacts: Vec<Contact>) -> StoreResult<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM contact", [])?;
                {
                    let mut stmt = tx.prepare(
                        r#"INSERT OR REPLACE INTO contact (
                            phone_number, first_name, last_name, email, picture_url,
                            is_favorite, is_blocked, created_at, updated_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
                    )?;
                    for c in &contacts {
                        stmt.execute(params![
                            c.phone_number,
                            c.first_name,
                            c.last_name,
                            c.email,
                            c.picture_url,
                            c.is_favorite,
                            c.is_blocked,
                            c.created_at,
                            c.updated_at,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        self.cache.clear();
        Ok(())
    }

    /// Точечный upsert (например, по realtime-событию contact-changed).
    /// Локальные флаги существующей строки не трогаем.
    pub async fn upsert_remote(&self, contact: Contact) -> StoreResult<()> {
        let key = contact.phone_number.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO contact (
                        phone_number, first_name, last_name, email, picture_url,
                        is_favorite, is_blocked, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT (phone_number) DO UPDATE SET
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        email = excluded.email,
                        picture_url = excluded.picture_url,
                        updated_at = excluded.updated_at"#,
                    params![
                        contact.phone_number,
                        contact.first_name,
                        contact.last_name,
                        contact.email,
                        contact.picture_url,
                        contact.is_favorite,
                        contact.is_blocked,
                        contact.created_at,
                        contact.updated_at,
                    ],
                )?;
                Ok(())
            })
            .await?;
        self.cache.invalidate(&key);
        Ok(())
    }

    pub async fn set_favorite(&self, phone_number: &str, favorite: bool) -> StoreResult<()> {
        let key = normalize_phone(phone_number);
        let update = key.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE contact SET is_favorite = ?1, updated_at = ?2 WHERE phone_number = ?3",
                    params![favorite, now_ms(), update],
                )?;
                Ok(())
            })
            .await?;
        self.cache.invalidate(&key);
        Ok(())
    }

    pub async fn set_blocked(&self, phone_number: &str, blocked: bool) -> StoreResult<()> {
        let key = normalize_phone(phone_number);
        let update = key.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE contact SET is_blocked = ?1, updated_at = ?2 WHERE phone_number = ?3",
                    params![blocked, now_ms(), update],
                )?;
                Ok(())
            })
            .await?;
        self.cache.invalidate(&key);
        Ok(())
    }

    /// Быстрая проверка для входящих звонков.
    pub async fn is_blocked(&self, phone_number: &str) -> StoreResult<bool> {
        Ok(self
            .get(phone_number)
            .await?
            .map(|c| c.is_blocked)
            .unwrap_or(false))
    }

    pub async fn delete(&self, phone_number: &str) -> StoreResult<()> {
        let key = normalize_phone(phone_number);
        let del = key.clone();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM contact WHERE phone_number = ?1", params![del])?;
                Ok(())
            })
            .await?;
        self.cache.invalidate(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory_db;

    async fn setup() -> ContactRepo {
        let conn = open_in_memory_db().await.expect("in-memory db");
        ContactRepo::new(conn, CacheHandler::new(16))
    }

    fn named(number: &str, first: &str) -> Contact {
        Contact {
            first_name: first.to_string(),
            ..Contact::new(number)
        }
    }

    #[tokio::test]
    async fn test_favorite_survives_replace() {
        let repo = setup().await;
        repo.replace_all(vec![named("5551234567", "Anna")]).await.unwrap();
        repo.set_favorite("5551234567", true).await.unwrap();

        // Серверный снапшот без информации об избранном
        let prefs = repo.snapshot_preferences().await.unwrap();
        let mut fresh = named("+1 (555) 123-4567", "Anna K");
        if let Some(p) = prefs.get(&fresh.phone_number) {
            fresh.is_favorite = p.is_favorite;
            fresh.is_blocked = p.is_blocked;
        }
        repo.replace_all(vec![fresh]).await.unwrap();

        let stored = repo.get("5551234567").await.unwrap().unwrap();
        assert!(stored.is_favorite, "флаг обязан пережить ресинк");
        assert_eq!(stored.first_name, "Anna K");
    }

    #[tokio::test]
    async fn test_upsert_remote_keeps_flags() {
        let repo = setup().await;
        repo.replace_all(vec![named("5551234567", "Anna")]).await.unwrap();
        repo.set_blocked("5551234567", true).await.unwrap();

        repo.upsert_remote(named("5551234567", "Anna Updated")).await.unwrap();
        let stored = repo.get("5551234567").await.unwrap().unwrap();
        assert!(stored.is_blocked);
        assert_eq!(stored.first_name, "Anna Updated");
    }

    #[tokio::test]
    async fn test_cache_invalidation() {
        let repo = setup().await;
        repo.replace_all(vec![named("5551234567", "Anna")]).await.unwrap();
        // Прогреваем кэш
        assert!(repo.get("5551234567").await.unwrap().is_some());
        repo.delete("5551234567").await.unwrap();
        assert!(repo.get("5551234567").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_is_blocked_unknown_number() {
        let repo = setup().await;
        assert!(!repo.is_blocked("5550001111").await.unwrap());
    }

    #[tokio::test]
    async fn test_display_name_falls_back_to_number() {
        let c = Contact::new("5551234567");
        assert_eq!(c.display_name(), "5551234567");
        let n = named("5551234567", "Anna");
        assert_eq!(n.display_name(), "Anna");
    }
}
