#![forbid(unsafe_code)]

//! Test doubles shared by the unit tests of several modules.

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use crate::client::{
    Document, DocumentAttribute, DocumentDescriptor, InboundMessage, Media, NetworkClient,
};
use crate::error::ClientError;
use crate::metadata::VideoMetadata;

pub fn sample_video(id: i64) -> VideoMetadata {
    VideoMetadata {
        id,
        caption: format!("Video {id}"),
        width: Some(1280),
        height: Some(720),
        duration: Some(60),
        mime_type: "video/mp4".into(),
        size: 1024,
        date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        channel_id: 100,
        file_reference: Some("0102".into()),
        file_name: format!("video_{id}.mp4"),
        download_url: String::new(),
        bot_name: String::new(),
    }
}

pub fn video_message(chat_id: i64, document_id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        id: document_id,
        chat_id,
        sender_id: Some(chat_id),
        text: text.into(),
        date: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        media: Some(Media::Document(Document {
            id: document_id,
            access_hash: 1,
            file_reference: Some(vec![0x01, 0x02]),
            mime_type: "video/mp4".into(),
            size: 2048,
            dc_id: 4,
            attributes: vec![
                DocumentAttribute::Video {
                    w: Some(640),
                    h: Some(360),
                    duration: Some(12),
                },
                DocumentAttribute::Filename {
                    file_name: format!("clip_{document_id}.mp4"),
                },
            ],
        })),
    }
}

pub fn text_message(chat_id: i64, id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        id,
        chat_id,
        sender_id: Some(chat_id),
        text: text.into(),
        date: None,
        media: None,
    }
}

/// Search result scripted for one publisher.
pub enum SearchScript {
    Messages(Vec<InboundMessage>),
    Private,
    Fail(String),
    Hang,
}

/// In-memory [`NetworkClient`] whose answers are scripted per test.
#[derive(Default)]
pub struct ScriptedClient {
    pub connected: AtomicBool,
    pub authorized: AtomicBool,
    pub entities: Mutex<HashMap<String, i64>>,
    pub searches: Mutex<HashMap<i64, SearchScript>>,
    pub updates: Mutex<VecDeque<InboundMessage>>,
    pub download_payload: Mutex<Option<Vec<u8>>>,
    pub session: Mutex<Option<String>>,
    pub require_password: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_authorized: AtomicBool,
    pub fail_ping: AtomicBool,
    pub connect_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
    pub ping_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
    pub sent_codes: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn authorized() -> Self {
        let client = Self::default();
        client.connected.store(true, Ordering::SeqCst);
        client.authorized.store(true, Ordering::SeqCst);
        *client.session.lock() = Some("1AaBbCcDdEeFfGgHhIiJjKkLl".into());
        client
    }

    pub fn with_entity(self, name: &str, id: i64) -> Self {
        self.entities.lock().insert(name.to_string(), id);
        self
    }

    pub fn with_search(self, chat_id: i64, script: SearchScript) -> Self {
        self.searches.lock().insert(chat_id, script);
        self
    }

    pub fn with_download(self, bytes: &[u8]) -> Self {
        *self.download_payload.lock() = Some(bytes.to_vec());
        self
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkClient for ScriptedClient {
    async fn connect(&self) -> Result<(), ClientError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_authorized(&self) -> Result<bool, ClientError> {
        if self.fail_authorized.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection reset".into()));
        }
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn start(&self) -> Result<(), ClientError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.authorized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::Unauthorized)
        }
    }

    async fn resolve_entity(&self, name: &str) -> Result<i64, ClientError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.entities
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| ClientError::Request(format!("no entity named {name}")))
    }

    async fn ping(&self) -> Result<(), ClientError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("ping timed out".into()));
        }
        Ok(())
    }

    async fn search_messages(
        &self,
        chat_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ClientError> {
        let hang = matches!(self.searches.lock().get(&chat_id), Some(SearchScript::Hang));
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        match self.searches.lock().get(&chat_id) {
            Some(SearchScript::Messages(messages)) => Ok(messages
                .iter()
                .filter(|m| m.text.contains(query))
                .take(limit)
                .cloned()
                .collect()),
            Some(SearchScript::Private) => Err(ClientError::ChannelPrivate(chat_id.to_string())),
            Some(SearchScript::Fail(reason)) => Err(ClientError::Request(reason.clone())),
            Some(SearchScript::Hang) | None => Ok(Vec::new()),
        }
    }

    async fn download_document(
        &self,
        _document: &DocumentDescriptor,
        dest: &Path,
    ) -> Result<(), ClientError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let payload = self.download_payload.lock().clone();
        match payload {
            Some(bytes) => {
                tokio::fs::write(dest, bytes).await?;
                Ok(())
            }
            None => {
                // Leave partial bytes behind to prove the caller cleans up.
                tokio::fs::write(dest, b"partial").await?;
                Err(ClientError::Transport("connection reset".into()))
            }
        }
    }

    async fn next_update(&self) -> Result<Option<InboundMessage>, ClientError> {
        let next = self.updates.lock().pop_front();
        if next.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(next)
    }

    async fn send_code(&self, phone: &str) -> Result<(), ClientError> {
        self.sent_codes.lock().push(phone.to_string());
        Ok(())
    }

    async fn sign_in(&self, _phone: &str, code: &str) -> Result<(), ClientError> {
        if self.require_password.load(Ordering::SeqCst) {
            return Err(ClientError::PasswordRequired);
        }
        if code != "12345" {
            return Err(ClientError::Request("PHONE_CODE_INVALID".into()));
        }
        self.authorized.store(true, Ordering::SeqCst);
        *self.session.lock() = Some("1SignedInSessionTokenValue".into());
        Ok(())
    }

    async fn session_string(&self) -> Result<Option<String>, ClientError> {
        Ok(self.session.lock().clone())
    }
}
