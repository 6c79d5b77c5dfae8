// src/db/cache.rs

use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use super::contact::Contact;

/// Тип кэша для записей контактов, ключ - нормализованный номер.
pub type ContactCache = LruCache<String, Contact>;

/// Структура для управления LRU-кэшем контактов (горячий путь ContactRepo::get).
#[derive(Clone)]
pub struct CacheHandler {
    pub contact_cache: Arc<Mutex<ContactCache>>,
}

impl CacheHandler {
    /// Создаёт новый кэш с заданной ёмкостью
    pub fn new(capacity: usize) -> Self {
        Self {
            contact_cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity must be nonzero"),
            ))),
        }
    }

    /// Пытается получить контакт по номеру из кэша
    pub fn get_contact(&self, number: &str) -> Option<Contact> {
        let mut cache = self.contact_cache.lock().unwrap();
        cache.get(number).cloned()
    }

    /// Добавляет или обновляет запись контакта в кэше
    pub fn put_contact(&self, number: String, contact: Contact) {
        let mut cache = self.contact_cache.lock().unwrap();
        cache.put(number, contact);
    }

    pub fn invalidate(&self, number: &str) {
        let mut cache = self.contact_cache.lock().unwrap();
        cache.pop(number);
    }

    pub fn clear(&self) {
        let mut cache = self.contact_cache.lock().unwrap();
        cache.clear();
    }
}

/// Ленивая карта "номер -> отображаемое имя" для списков звонков и диалогов.
/// Загрузка и сброс берут эксклюзивную блокировку, чтение после загрузки
/// конкурентное. O(1) на запрос, не ходит в базу.
#[derive(Default)]
pub struct ContactNameCache {
    inner: RwLock<Option<HashMap<String, String>>>,
}

impl ContactNameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Перестраивает карту по списку контактов.
    pub fn load(&self, contacts: &[Contact]) {
        let map: HashMap<String, String> = contacts
            .iter()
            .map(|c| (c.phone_number.clone(), c.display_name()))
            .collect();
        *self.inner.write().unwrap() = Some(map);
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().unwrap().is_some()
    }

    /// None - кэш не загружен или номера нет; вызывающий решает, что показывать.
    pub fn name_for(&self, number: &str) -> Option<String> {
        self.inner
            .read()
            .unwrap()
            .as_ref()
            .and_then(|m| m.get(number).cloned())
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_eviction() {
        let handler = CacheHandler::new(2);
        handler.put_contact("1".into(), Contact::new("5550000001"));
        handler.put_contact("2".into(), Contact::new("5550000002"));
        handler.put_contact("3".into(), Contact::new("5550000003"));
        // Ёмкость 2: самый старый вытеснен
        assert!(handler.get_contact("1").is_none());
        assert!(handler.get_contact("3").is_some());
    }

    #[test]
    fn test_name_cache_lifecycle() {
        let cache = ContactNameCache::new();
        assert!(!cache.is_loaded());
        assert_eq!(cache.name_for("5551234567"), None);

        let mut c = Contact::new("5551234567");
        c.first_name = "Anna".into();
        cache.load(&[c]);
        assert!(cache.is_loaded());
        assert_eq!(cache.name_for("5551234567").as_deref(), Some("Anna"));

        cache.clear();
        assert!(!cache.is_loaded());
    }
}
