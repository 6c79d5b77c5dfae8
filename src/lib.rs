// src/lib.rs
//
// Ядро мобильного коммуникационного клиента: телефония (SIP через внешний
// call-control бэкенд) и сообщения (SMS/MMS) поверх локального SQLite-кэша.
// Три независимых источника данных - локальные действия, фоновая
// синхронизация и realtime-события - сводятся в одну непротиворечивую
// ленту через сигнатурную дедупликацию в db::message и оконную
// дедупликацию звонков в db::call.

pub mod call;
pub mod config;
pub mod db;
pub mod realtime;
pub mod remote;
pub mod signature;
pub mod sync;
pub mod transport;

use std::sync::Arc;

use tokio_rusqlite::Connection;

pub use config::CoreConfig;
pub use db::StoreError;

use db::cache::{CacheHandler, ContactNameCache};
use db::call::CallRepo;
use db::contact::ContactRepo;
use db::conversation::ConversationRepo;
use db::message::MessageRepo;
use db::monitor::ChangeMonitor;

/// Собранное ядро: соединение, репозитории, кэши и монитор изменений.
/// Создаётся один раз на приложение; репозитории дёшево клонируются через Arc.
pub struct CommsCore {
    pub conn: Arc<Connection>,
    pub config: Arc<CoreConfig>,
    pub messages: Arc<MessageRepo>,
    pub conversations: Arc<ConversationRepo>,
    pub calls: Arc<CallRepo>,
    pub contacts: Arc<ContactRepo>,
    pub monitor: ChangeMonitor,
    pub name_cache: Arc<ContactNameCache>,
}

impl CommsCore {
    /// Открывает зашифрованную базу, прогоняет миграции, ставит монитор.
    pub async fn open(path: &str, key: &str, config: CoreConfig) -> Result<Self, StoreError> {
        let conn = db::open_encrypted_db(path, key).await?;
        Self::build(conn, config).await
    }

    /// База в памяти: для тестов и демо.
    pub async fn open_in_memory(config: CoreConfig) -> Result<Self, StoreError> {
        let conn = db::open_in_memory_db().await?;
        Self::build(conn, config).await
    }

    async fn build(conn: Arc<Connection>, config: CoreConfig) -> Result<Self, StoreError> {
        let monitor = ChangeMonitor::install(&conn).await?;
        let cache = CacheHandler::new(config.contact_cache_capacity);
        let config = Arc::new(config);
        Ok(Self {
            messages: Arc::new(MessageRepo::new(conn.clone())),
            conversations: Arc::new(ConversationRepo::new(conn.clone())),
            calls: Arc::new(CallRepo::new(conn.clone(), config.call_dedup_window_ms)),
            contacts: Arc::new(ContactRepo::new(conn.clone(), cache)),
            monitor,
            name_cache: Arc::new(ContactNameCache::new()),
            config,
            conn,
        })
    }

    /// Перестраивает карту имён (после синхронизации контактов это делает
    /// сам реконсилятор).
    pub async fn reload_name_cache(&self) -> Result<(), StoreError> {
        let all = self.contacts.get_paginated(0, i64::MAX).await?;
        self.name_cache.load(&all);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_core() {
        let core = CommsCore::open_in_memory(CoreConfig::default())
            .await
            .expect("core should open");
        assert_eq!(core.conversations.total_unread().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_name_cache_reload() {
        let core = CommsCore::open_in_memory(CoreConfig::default()).await.unwrap();
        let mut c = db::contact::Contact::new("5551234567");
        c.first_name = "Anna".into();
        core.contacts.replace_all(vec![c]).await.unwrap();

        core.reload_name_cache().await.unwrap();
        assert_eq!(
            core.name_cache.name_for("5551234567").as_deref(),
            Some("Anna")
        );
    }
}
