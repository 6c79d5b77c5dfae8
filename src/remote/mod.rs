// src/remote/mod.rs
//
// Контракт удалённого сервиса. Сам HTTP-транспорт (ретраи, перехватчики,
// авторизация) живёт снаружи; ядру нужен только этот трейт. Ответы мутаций
// несут success=false как нормальный отказ, а не как ошибку транспорта.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network: {0}")]
    Network(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Страница списка. Отсутствие has_more в ответе трактуется как конец списка.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub has_more: Option<bool>,
}

impl<T> Page<T> {
    pub fn more(&self) -> bool {
        self.has_more.unwrap_or(false)
    }

    pub fn last() -> Self {
        Self {
            items: Vec::new(),
            has_more: Some(false),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteContact {
    pub phone_number: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCall {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub phone_number: String,
    pub direction: String,
    pub call_type: String,
    #[serde(default)]
    pub duration: i64,
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub line_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    pub direction: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub media_urls: Option<Vec<String>>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get_contacts(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Page<RemoteContact>, RemoteError>;

    async fn get_calls(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Page<RemoteCall>, RemoteError>;

    async fn get_messages(
        &self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Page<RemoteMessage>, RemoteError>;

    async fn send_message(&self, req: &SendMessageRequest) -> Result<MutationResponse, RemoteError>;

    async fn save_call(&self, call: &RemoteCall) -> Result<MutationResponse, RemoteError>;

    async fn save_contact(&self, contact: &RemoteContact)
        -> Result<MutationResponse, RemoteError>;

    async fn delete_contact(&self, phone_number: &str) -> Result<MutationResponse, RemoteError>;

    async fn toggle_favorite(
        &self,
        phone_number: &str,
        favorite: bool,
    ) -> Result<MutationResponse, RemoteError>;

    async fn mark_read(&self, conversation_id: &str) -> Result<MutationResponse, RemoteError>;

    async fn bulk_delete_messages(&self, ids: &[Uuid]) -> Result<MutationResponse, RemoteError>;
}

#[cfg(test)]
pub mod mock {
    //! Заглушка удалённого сервиса для тестов: страницы задаются заранее,
    //! мутации считаются и могут быть переключены в отказ.

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockRemoteApi {
        pub contact_pages: Mutex<Vec<Page<RemoteContact>>>,
        pub call_pages: Mutex<Vec<Page<RemoteCall>>>,
        pub message_pages: Mutex<Vec<Page<RemoteMessage>>>,
        pub fail_calls: AtomicBool,
        pub fail_sends: AtomicBool,
        pub reject_sends: AtomicBool,
        pub sends: AtomicUsize,
    }

    impl MockRemoteApi {
        pub fn new() -> Self {
            Self::default()
        }

        fn next_page<T: Clone>(pages: &Mutex<Vec<Page<T>>>) -> Page<T> {
            let mut guard = pages.lock().unwrap();
            if guard.is_empty() {
                Page::last()
            } else {
                guard.remove(0)
            }
        }
    }

    #[async_trait]
    impl RemoteApi for MockRemoteApi {
        async fn get_contacts(
            &self,
            _owner: &str,
            _limit: i64,
            _offset: i64,
        ) -> Result<Page<RemoteContact>, RemoteError> {
            Ok(Self::next_page(&self.contact_pages))
        }

        async fn get_calls(
            &self,
            _owner: &str,
            _limit: i64,
            _offset: i64,
        ) -> Result<Page<RemoteCall>, RemoteError> {
            if self.fail_calls.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("connection reset".into()));
            }
            Ok(Self::next_page(&self.call_pages))
        }

        async fn get_messages(
            &self,
            _owner: &str,
            _limit: i64,
            _offset: i64,
        ) -> Result<Page<RemoteMessage>, RemoteError> {
            Ok(Self::next_page(&self.message_pages))
        }

        async fn send_message(
            &self,
            _req: &SendMessageRequest,
        ) -> Result<MutationResponse, RemoteError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(RemoteError::Network("timeout".into()));
            }
            if self.reject_sends.load(Ordering::SeqCst) {
                return Ok(MutationResponse {
                    success: false,
                    message: Some("quota exceeded".into()),
                });
            }
            Ok(MutationResponse {
                success: true,
                message: None,
            })
        }

        async fn save_call(&self, _call: &RemoteCall) -> Result<MutationResponse, RemoteError> {
            Ok(MutationResponse {
                success: true,
                message: None,
            })
        }

        async fn save_contact(
            &self,
            _contact: &RemoteContact,
        ) -> Result<MutationResponse, RemoteError> {
            Ok(MutationResponse {
                success: true,
                message: None,
            })
        }

        async fn delete_contact(
            &self,
            _phone_number: &str,
        ) -> Result<MutationResponse, RemoteError> {
            Ok(MutationResponse {
                success: true,
                message: None,
            })
        }

        async fn toggle_favorite(
            &self,
            _phone_number: &str,
            _favorite: bool,
        ) -> Result<MutationResponse, RemoteError> {
            Ok(MutationResponse {
                success: true,
                message: None,
            })
        }

        async fn mark_read(&self, _conversation_id: &str) -> Result<MutationResponse, RemoteError> {
            Ok(MutationResponse {
                success: true,
                message: None,
            })
        }

        async fn bulk_delete_messages(
            &self,
            _ids: &[Uuid],
        ) -> Result<MutationResponse, RemoteError> {
            Ok(MutationResponse {
                success: true,
                message: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_absent_has_more_is_end() {
        let page: Page<RemoteContact> =
            serde_json::from_str(r#"{"items": []}"#).expect("page without has_more");
        assert!(!page.more());
    }

    #[test]
    fn test_mutation_response_decode() {
        let resp: MutationResponse =
            serde_json::from_str(r#"{"success": false, "message": "bad number"}"#).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("bad number"));
    }
}
