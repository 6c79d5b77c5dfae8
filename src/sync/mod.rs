// src/sync/mod.rs
//
// Фоновая сверка с сервером. Три независимых источника правды (контакты,
// звонки, сообщения) сверяются по отдельности: упавший класс не откатывает
// остальные, это штатный частичный успех. Внутри класса порядок жёсткий:
// снимок локальных атрибутов -> постраничная выгрузка -> merge.
//
// Отмена: прерывание future между транзакциями безопасно, каждая сущность
// пишется одной транзакцией; наполовину слитой сущности не бывает.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::config::CoreConfig;
use crate::db::cache::ContactNameCache;
use crate::db::call::{CallDirection, CallRecord, CallRepo, CallType};
use crate::db::contact::{Contact, ContactPrefs, ContactRepo};
use crate::db::message::{Message, MessageRepo, MessageStatus};
use crate::db::monitoring::{measure_db_operation, SYNC_PASSES};
use crate::db::{now_ms, StoreError};
use crate::remote::{RemoteApi, RemoteCall, RemoteContact, RemoteError, RemoteMessage};
use crate::signature::{normalize_phone, SignatureEngine};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Итог прохода по одному классу сущностей.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub fetched: usize,
    pub inserted: usize,
    pub merged: usize,
    pub preserved: usize,
}

/// Итог всего прохода: классы независимы, частичный успех - норма.
#[derive(Debug)]
pub struct SyncReport {
    pub contacts: Result<ClassStats, SyncError>,
    pub calls: Result<ClassStats, SyncError>,
    pub messages: Result<ClassStats, SyncError>,
}

impl SyncReport {
    pub fn all_ok(&self) -> bool {
        self.contacts.is_ok() && self.calls.is_ok() && self.messages.is_ok()
    }
}

pub struct SyncReconciler {
    api: Arc<dyn RemoteApi>,
    contacts: Arc<ContactRepo>,
    calls: Arc<CallRepo>,
    messages: Arc<MessageRepo>,
    name_cache: Arc<ContactNameCache>,
    engine: SignatureEngine,
    owner_number: String,
    page_size: i64,
}

impl SyncReconciler {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        contacts: Arc<ContactRepo>,
        calls: Arc<CallRepo>,
        messages: Arc<MessageRepo>,
        name_cache: Arc<ContactNameCache>,
        owner_number: &str,
        cfg: &CoreConfig,
    ) -> Self {
        Self {
            api,
            contacts,
            calls,
            messages,
            name_cache,
            engine: SignatureEngine::from_config(cfg),
            owner_number: normalize_phone(owner_number),
            page_size: cfg.sync_page_size,
        }
    }

    /// Полный проход: после логина, по push-подсказке или по таймеру.
    pub async fn sync_all(&self) -> SyncReport {
        let contacts = self.run_class("contacts", self.sync_contacts()).await;
        let calls = self.run_class("calls", self.sync_calls()).await;
        let messages = self.run_class("messages", self.sync_messages()).await;
        SyncReport {
            contacts,
            calls,
            messages,
        }
    }

    async fn run_class<F>(&self, entity: &str, pass: F) -> Result<ClassStats, SyncError>
    where
        F: std::future::Future<Output = Result<ClassStats, SyncError>>,
    {
        let result = measure_db_operation(entity, pass).await;
        match &result {
            Ok(stats) => {
                SYNC_PASSES.with_label_values(&[entity, "ok"]).inc();
                info!(
                    "sync {}: fetched={} inserted={} merged={} preserved={}",
                    entity, stats.fetched, stats.inserted, stats.merged, stats.preserved
                );
            }
            Err(e) => {
                SYNC_PASSES.with_label_values(&[entity, "error"]).inc();
                warn!("sync {} failed, local view untouched: {}", entity, e);
            }
        }
        result
    }

    /// Контакты: производные данные, полная замена легальна, но только после
    /// снимка локальных флагов.
    pub async fn sync_contacts(&self) -> Result<ClassStats, SyncError> {
        // Шаг 1: снимок до любой записи. Одноразовый, между проходами не живёт.
        let prefs = self.contacts.snapshot_preferences().await?;

        // Шаг 2: выгрузка целиком (при ошибке сети база не тронута)
        let remote = self.fetch_all(|limit, offset| {
            let api = self.api.clone();
            let owner = self.owner_number.clone();
            async move { api.get_contacts(&owner, limit, offset).await }
        })
        .await?;

        // Шаг 3-4: маппинг с прикреплением флагов и полная замена
        let fetched = remote.len();
        let mut preserved = 0usize;
        let mapped: Vec<Contact> = remote
            .into_iter()
            .map(|rc| map_contact(rc, &prefs, &mut preserved))
            .collect();
        let inserted = mapped.len();
        self.contacts.replace_all(mapped).await?;

        // Имя-кэш строится от свежей таблицы
        let all = self.contacts.get_paginated(0, i64::MAX).await?;
        self.name_cache.load(&all);

        Ok(ClassStats {
            fetched,
            inserted,
            merged: 0,
            preserved,
        })
    }

    /// Звонки: каждый пишется через дедуп-окно, заметки переживают merge.
    pub async fn sync_calls(&self) -> Result<ClassStats, SyncError> {
        let remote = self.fetch_all(|limit, offset| {
            let api = self.api.clone();
            let owner = self.owner_number.clone();
            async move { api.get_calls(&owner, limit, offset).await }
        })
        .await?;

        let mut stats = ClassStats {
            fetched: remote.len(),
            ..ClassStats::default()
        };
        for rc in remote {
            let record = map_call(rc);
            match self.calls.save_with_dedup(record).await? {
                crate::db::call::SaveOutcome::Inserted(_) => stats.inserted += 1,
                crate::db::call::SaveOutcome::Merged(_) => stats.merged += 1,
            }
        }
        Ok(stats)
    }

    /// Сообщения: только идемпотентные вставки по сигнатуре. Полной замены
    /// нет и быть не может - она бы стёрла транспортное состояние
    /// неотправленных сообщений.
    pub async fn sync_messages(&self) -> Result<ClassStats, SyncError> {
        let remote = self.fetch_all(|limit, offset| {
            let api = self.api.clone();
            let owner = self.owner_number.clone();
            async move { api.get_messages(&owner, limit, offset).await }
        })
        .await?;

        let mut stats = ClassStats {
            fetched: remote.len(),
            ..ClassStats::default()
        };
        for rm in remote {
            let (message, remote_status) = map_message(rm, &self.engine, &self.owner_number);
            let signature = message.signature.clone();
            if self.messages.insert_if_absent(message).await? {
                stats.inserted += 1;
            } else {
                stats.merged += 1;
            }
            // Серверный статус повышает локальный (PENDING -> SENT и т.д.),
            // но никогда не понижает
            if let Some(status) = remote_status {
                self.messages
                    .upgrade_status_by_signature(&signature, status, Some(now_ms()), None)
                    .await?;
            }
        }
        Ok(stats)
    }

    /// Постраничная выгрузка: offset растёт на размер страницы, отсутствие
    /// has_more означает конец списка.
    async fn fetch_all<T, F, Fut>(&self, fetch_page: F) -> Result<Vec<T>, RemoteError>
    where
        F: Fn(i64, i64) -> Fut,
        Fut: std::future::Future<Output = Result<crate::remote::Page<T>, RemoteError>>,
    {
        let mut items = Vec::new();
        let mut offset = 0i64;
        loop {
            let page = fetch_page(self.page_size, offset).await?;
            let count = page.items.len() as i64;
            let has_more = page.more();
            items.extend(page.items);
            if !has_more || count == 0 {
                break;
            }
            offset += count;
        }
        Ok(items)
    }
}

fn map_contact(
    rc: RemoteContact,
    prefs: &HashMap<String, ContactPrefs>,
    preserved: &mut usize,
) -> Contact {
    let mut contact = Contact::new(&rc.phone_number);
    contact.first_name = rc.first_name.unwrap_or_default();
    contact.last_name = rc.last_name.unwrap_or_default();
    contact.email = rc.email;
    contact.picture_url = rc.picture_url;
    if let Some(p) = prefs.get(&contact.phone_number) {
        contact.is_favorite = p.is_favorite;
        contact.is_blocked = p.is_blocked;
        *preserved += 1;
    }
    contact
}

fn map_call(rc: RemoteCall) -> CallRecord {
    let direction = match rc.direction.to_ascii_lowercase().as_str() {
        "outgoing" | "outbound" => CallDirection::Outgoing,
        _ => CallDirection::Incoming,
    };
    // Неизвестный тип не роняет проход: считаем звонок пропущенным
    let call_type = match rc.call_type.to_ascii_lowercase().as_str() {
        "answered" | "completed" => CallType::Answered,
        "rejected" | "declined" => CallType::Rejected,
        "voicemail" => CallType::Voicemail,
        "blocked" => CallType::Blocked,
        _ => CallType::Missed,
    };
    let mut record = CallRecord::new(
        &rc.phone_number,
        direction,
        call_type,
        rc.duration.max(0),
        rc.start_time,
        rc.end_time,
        rc.line_number.unwrap_or(0),
    );
    if let Some(id) = rc.id {
        record.id = id;
    }
    record
}

fn map_message(
    rm: RemoteMessage,
    engine: &SignatureEngine,
    owner: &str,
) -> (Message, Option<MessageStatus>) {
    let incoming = match rm.direction.to_ascii_lowercase().as_str() {
        "outgoing" | "outbound" => false,
        "incoming" | "inbound" => true,
        // Направление не пришло: определяем по номеру владельца
        _ => normalize_phone(&rm.from_number) != owner,
    };
    let media = rm.media_urls.unwrap_or_default();
    let message = if incoming {
        Message::incoming(
            engine,
            &rm.from_number,
            &rm.to_number,
            &rm.body,
            media,
            rm.created_at,
        )
    } else {
        Message::outgoing(
            engine,
            &rm.from_number,
            &rm.to_number,
            &rm.body,
            media,
            rm.created_at,
        )
    };
    // Статус с сервера применяется отдельным повышением, чтобы не перетирать
    // более продвинутый локальный
    let remote_status = rm.status.as_deref().map(|s| match s.to_ascii_lowercase().as_str() {
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        _ if incoming => MessageStatus::Received,
        _ => MessageStatus::Sent,
    });
    (message, remote_status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::cache::CacheHandler;
    use crate::db::open_in_memory_db;
    use crate::remote::mock::MockRemoteApi;
    use crate::remote::Page;
    use std::sync::atomic::Ordering;

    struct Fixture {
        api: Arc<MockRemoteApi>,
        reconciler: SyncReconciler,
        contacts: Arc<ContactRepo>,
        calls: Arc<CallRepo>,
        messages: Arc<MessageRepo>,
    }

    async fn setup() -> Fixture {
        let conn = open_in_memory_db().await.expect("in-memory db");
        let cfg = CoreConfig::default();
        let api = Arc::new(MockRemoteApi::new());
        let contacts = Arc::new(ContactRepo::new(conn.clone(), CacheHandler::new(16)));
        let calls = Arc::new(CallRepo::new(conn.clone(), cfg.call_dedup_window_ms));
        let messages = Arc::new(MessageRepo::new(conn));
        let name_cache = Arc::new(ContactNameCache::new());
        let reconciler = SyncReconciler::new(
            api.clone(),
            contacts.clone(),
            calls.clone(),
            messages.clone(),
            name_cache,
            "+15551234567",
            &cfg,
        );
        Fixture {
            api,
            reconciler,
            contacts,
            calls,
            messages,
        }
    }

    fn remote_contact(number: &str, first: &str) -> RemoteContact {
        RemoteContact {
            phone_number: number.to_string(),
            first_name: Some(first.to_string()),
            last_name: None,
            email: None,
            picture_url: None,
        }
    }

    #[tokio::test]
    async fn test_favorite_preserved_through_sync() {
        let fx = setup().await;
        fx.contacts
            .replace_all(vec![{
                let mut c = Contact::new("5551230001");
                c.first_name = "Anna".into();
                c
            }])
            .await
            .unwrap();
        fx.contacts.set_favorite("5551230001", true).await.unwrap();

        // Сервер ничего не знает про избранное
        fx.api.contact_pages.lock().unwrap().push(Page {
            items: vec![remote_contact("+15551230001", "Anna K")],
            has_more: Some(false),
        });

        let stats = fx.reconciler.sync_contacts().await.unwrap();
        assert_eq!(stats.preserved, 1);

        let stored = fx.contacts.get("5551230001").await.unwrap().unwrap();
        assert!(stored.is_favorite);
        assert_eq!(stored.first_name, "Anna K");
    }

    #[tokio::test]
    async fn test_pagination_until_has_more_false() {
        let fx = setup().await;
        {
            let mut pages = fx.api.contact_pages.lock().unwrap();
            pages.push(Page {
                items: vec![remote_contact("5551230001", "A")],
                has_more: Some(true),
            });
            pages.push(Page {
                items: vec![remote_contact("5551230002", "B")],
                has_more: None, // отсутствие has_more = конец списка
            });
        }
        let stats = fx.reconciler.sync_contacts().await.unwrap();
        assert_eq!(stats.fetched, 2);
        assert_eq!(fx.contacts.get_paginated(0, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let fx = setup().await;
        fx.api.contact_pages.lock().unwrap().push(Page {
            items: vec![remote_contact("5551230001", "A")],
            has_more: Some(false),
        });
        fx.api.fail_calls.store(true, Ordering::SeqCst);

        let report = fx.reconciler.sync_all().await;
        assert!(report.contacts.is_ok(), "контакты прошли");
        assert!(report.calls.is_err(), "звонки упали");
        assert!(report.messages.is_ok());
        assert!(!report.all_ok());

        // Упавший класс не тронул базу
        assert!(fx.calls.get_paginated(10, 0).await.unwrap().is_empty());
        assert_eq!(fx.contacts.get_paginated(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_synced_copy_of_local_send_upgrades_status() {
        let fx = setup().await;
        let engine = SignatureEngine::from_config(&CoreConfig::default());
        let t = 1_700_000_000_000i64;
        let t0 = t - t.rem_euclid(300_000);

        // Локальная отправка лежит в Pending
        let local = Message::outgoing(&engine, "5551234567", "5559876543", "Hi", vec![], t0);
        let sig = local.signature.clone();
        fx.messages.insert_if_absent(local).await.unwrap();

        // Сервер отдаёт ту же отправку со своим временем (90 секунд спустя)
        fx.api.message_pages.lock().unwrap().push(Page {
            items: vec![RemoteMessage {
                from_number: "+15551234567".into(),
                to_number: "5559876543".into(),
                body: "Hi".into(),
                direction: "outgoing".into(),
                status: Some("sent".into()),
                media_urls: None,
                created_at: t0 + 90_000,
            }],
            has_more: Some(false),
        });

        let stats = fx.reconciler.sync_messages().await.unwrap();
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.merged, 1);

        let stored = fx.messages.get_by_signature(&sig).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent, "PENDING -> SENT, строка одна");
        let all = fx
            .messages
            .get_for_conversation("5559876543", 10, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_call_dedup_on_sync() {
        let fx = setup().await;
        let t = 1_700_000_000_000i64;
        // Локально записанный звонок
        fx.calls
            .save_with_dedup(CallRecord::new(
                "5559876543",
                CallDirection::Incoming,
                CallType::Answered,
                30,
                t,
                Some(t + 30_000),
                1,
            ))
            .await
            .unwrap();

        // Серверная копия в пределах окна
        fx.api.call_pages.lock().unwrap().push(Page {
            items: vec![RemoteCall {
                id: None,
                phone_number: "+15559876543".into(),
                direction: "incoming".into(),
                call_type: "answered".into(),
                duration: 30,
                start_time: t + 10_000,
                end_time: Some(t + 40_000),
                line_number: Some(1),
            }],
            has_more: Some(false),
        });

        let stats = fx.reconciler.sync_calls().await.unwrap();
        assert_eq!(stats.merged, 1);
        assert_eq!(stats.inserted, 0);
        assert_eq!(fx.calls.get_paginated(10, 0).await.unwrap().len(), 1);
    }
}
