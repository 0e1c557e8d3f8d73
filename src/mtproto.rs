#![forbid(unsafe_code)]

//! [`NetworkClient`] over MTProto, backed by `grammers-client`.
//!
//! The session token handed out by [`NetworkClient::session_string`] is the
//! hex encoding of a serialized `grammers_session::Session`; `SESSION_STRING`
//! takes the same format on the way back in. Publishers resolved through
//! [`NetworkClient::resolve_entity`] are remembered as packed chats so later
//! searches can address them by numeric id alone.

use std::{collections::HashMap, path::Path, time::Duration};

use async_trait::async_trait;
use grammers_client::types::{LoginToken, Media as NetworkMedia, Message};
use grammers_client::{Client, Config, InitParams, SignInError, Update};
use grammers_mtsender::InvocationError;
use grammers_session::{PackedChat, Session};
use grammers_tl_types as tl;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::client::{
    Document, DocumentAttribute, DocumentDescriptor, InboundMessage, Media, NetworkClient,
};
use crate::config::GatewayConfig;
use crate::error::ClientError;

/// How long one `next_update` call waits before reporting an idle period.
const UPDATE_WAIT: Duration = Duration::from_secs(25);
/// `upload.getFile` chunk size; must divide 1 MiB.
const DOWNLOAD_CHUNK: i32 = 512 * 1024;

struct PendingCode {
    phone: String,
    token: LoginToken,
}

pub struct MtprotoClient {
    api_id: i32,
    api_hash: String,
    /// Serialized session used for the next connect. Refreshed whenever a
    /// live client is dropped so the auth key survives reconnects.
    saved_session: Mutex<Option<Vec<u8>>>,
    client: RwLock<Option<Client>>,
    chats: RwLock<HashMap<i64, PackedChat>>,
    /// Access hash and data centre of every document seen, keyed by id.
    documents: RwLock<HashMap<i64, (i64, i32)>>,
    pending_code: Mutex<Option<PendingCode>>,
}

impl MtprotoClient {
    pub fn new(api_id: i32, api_hash: impl Into<String>, session_string: Option<&str>) -> Self {
        Self {
            api_id,
            api_hash: api_hash.into(),
            saved_session: Mutex::new(session_string.and_then(decode_session)),
            client: RwLock::new(None),
            chats: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            pending_code: Mutex::new(None),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.api_id,
            config.api_hash.clone(),
            config.session_string.as_deref(),
        )
    }

    fn live(&self) -> Result<Client, ClientError> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| ClientError::Transport("not connected".to_string()))
    }

    /// Maps a grammers failure. Anything that is not an RPC answer means the
    /// connection is unusable, so the client is dropped and the next
    /// keep-alive pass reconnects from the saved session.
    fn invocation_error(&self, err: InvocationError) -> ClientError {
        match err {
            InvocationError::Rpc(rpc) => classify_rpc(rpc.code, &rpc.name),
            other => {
                self.disconnect();
                ClientError::Transport(other.to_string())
            }
        }
    }

    fn disconnect(&self) {
        if let Some(client) = self.client.write().take() {
            *self.saved_session.lock() = Some(client.session().save());
            warn!("dropped network connection");
        }
    }

    fn inbound(&self, message: &Message) -> InboundMessage {
        InboundMessage {
            id: i64::from(message.id()),
            chat_id: message.chat().id(),
            sender_id: message.sender().map(|sender| sender.id()),
            text: message.text().to_string(),
            date: Some(message.date()),
            media: message.media().map(|media| self.media(media)),
        }
    }

    fn media(&self, media: NetworkMedia) -> Media {
        match media {
            NetworkMedia::Document(document) => match convert_document(&document.raw) {
                Some(document) => {
                    self.documents
                        .write()
                        .insert(document.id, (document.access_hash, document.dc_id));
                    Media::Document(document)
                }
                None => Media::Other,
            },
            NetworkMedia::Photo(_) => Media::Photo,
            _ => Media::Other,
        }
    }

    /// Fills in the access hash and data centre a rebuilt descriptor lacks,
    /// when the document went through this client before.
    fn file_location(&self, document: &DocumentDescriptor) -> (tl::enums::InputFileLocation, i32) {
        let (access_hash, dc_id) = match (document.access_hash, document.dc_id) {
            (0, 0) => self
                .documents
                .read()
                .get(&document.id)
                .copied()
                .unwrap_or((0, 0)),
            known => known,
        };
        let location = tl::enums::InputFileLocation::InputDocumentFileLocation(
            tl::types::InputDocumentFileLocation {
                id: document.id,
                access_hash,
                file_reference: document.file_reference.clone(),
                thumb_size: String::new(),
            },
        );
        (location, dc_id)
    }
}

#[async_trait]
impl NetworkClient for MtprotoClient {
    async fn connect(&self) -> Result<(), ClientError> {
        if self.client.read().is_some() {
            return Ok(());
        }
        let session = match self.saved_session.lock().as_deref() {
            Some(bytes) => Session::load(bytes).unwrap_or_else(|err| {
                warn!(error = %err, "stored session is unreadable, starting a fresh one");
                Session::new()
            }),
            None => Session::new(),
        };
        let client = Client::connect(Config {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params: InitParams {
                catch_up: false,
                ..Default::default()
            },
        })
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))?;
        *self.client.write() = Some(client);
        debug!("connected to the network");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.client.read().is_some()
    }

    async fn is_authorized(&self) -> Result<bool, ClientError> {
        let client = self.live()?;
        client
            .is_authorized()
            .await
            .map_err(|err| self.invocation_error(err))
    }

    /// A stored session is either authorized already or needs the code
    /// exchange; there is nothing else to complete.
    async fn start(&self) -> Result<(), ClientError> {
        if self.is_authorized().await? {
            Ok(())
        } else {
            Err(ClientError::Unauthorized)
        }
    }

    async fn resolve_entity(&self, name: &str) -> Result<i64, ClientError> {
        let client = self.live()?;
        let username = name.trim().trim_start_matches('@');
        match client.resolve_username(username).await {
            Ok(Some(chat)) => {
                let id = chat.id();
                self.chats.write().insert(id, chat.pack());
                Ok(id)
            }
            Ok(None) => Err(ClientError::ChannelPrivate(name.to_string())),
            Err(err) => Err(self.invocation_error(err)),
        }
    }

    async fn ping(&self) -> Result<(), ClientError> {
        let client = self.live()?;
        client
            .get_me()
            .await
            .map(|_| ())
            .map_err(|err| self.invocation_error(err))
    }

    async fn search_messages(
        &self,
        chat_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ClientError> {
        let chat = self
            .chats
            .read()
            .get(&chat_id)
            .copied()
            .ok_or_else(|| ClientError::ChannelPrivate(chat_id.to_string()))?;
        let client = self.live()?;
        let mut messages = client.search_messages(chat).query(query).limit(limit);
        let mut found = Vec::new();
        while let Some(message) = messages
            .next()
            .await
            .map_err(|err| self.invocation_error(err))?
        {
            found.push(self.inbound(&message));
        }
        Ok(found)
    }

    async fn download_document(
        &self,
        document: &DocumentDescriptor,
        dest: &Path,
    ) -> Result<(), ClientError> {
        let client = self.live()?;
        let (location, home_dc) = self.file_location(document);
        let mut dc = (home_dc != 0).then_some(home_dc);
        let mut file = tokio::fs::File::create(dest).await?;
        let mut offset: i64 = 0;
        loop {
            let request = tl::functions::upload::GetFile {
                precise: false,
                cdn_supported: false,
                location: location.clone(),
                offset,
                limit: DOWNLOAD_CHUNK,
            };
            let reply = match dc {
                Some(dc_id) => client.invoke_in_dc(&request, dc_id).await,
                None => client.invoke(&request).await,
            };
            let bytes = match reply {
                Ok(tl::enums::upload::File::File(chunk)) => chunk.bytes,
                Ok(tl::enums::upload::File::CdnRedirect(_)) => {
                    return Err(ClientError::Request(
                        "document is only served from a CDN".to_string(),
                    ));
                }
                Err(InvocationError::Rpc(rpc)) if rpc.name == "FILE_MIGRATE" && dc.is_none() => {
                    let target = rpc.value.and_then(|value| i32::try_from(value).ok());
                    debug!(document = document.id, dc = ?target, "document lives on another data centre");
                    dc = Some(target.ok_or_else(|| {
                        ClientError::Request("FILE_MIGRATE without a data centre".to_string())
                    })?);
                    continue;
                }
                Err(err) => return Err(self.invocation_error(err)),
            };
            file.write_all(&bytes).await?;
            if bytes.len() < DOWNLOAD_CHUNK as usize {
                break;
            }
            offset += bytes.len() as i64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn next_update(&self) -> Result<Option<InboundMessage>, ClientError> {
        let client = self.live()?;
        match tokio::time::timeout(UPDATE_WAIT, client.next_update()).await {
            Err(_) => Ok(None),
            Ok(Ok(Update::NewMessage(message))) => Ok(Some(self.inbound(&message))),
            Ok(Ok(_)) => Ok(None),
            Ok(Err(err)) => Err(self.invocation_error(err)),
        }
    }

    async fn send_code(&self, phone: &str) -> Result<(), ClientError> {
        let client = self.live()?;
        let token = client
            .request_login_code(phone)
            .await
            .map_err(|err| ClientError::Request(err.to_string()))?;
        *self.pending_code.lock() = Some(PendingCode {
            phone: phone.to_string(),
            token,
        });
        info!(phone, "login code requested");
        Ok(())
    }

    async fn sign_in(&self, phone: &str, code: &str) -> Result<(), ClientError> {
        let client = self.live()?;
        let pending = self
            .pending_code
            .lock()
            .take()
            .filter(|pending| pending.phone == phone)
            .ok_or_else(|| ClientError::Request(format!("no login code was requested for {phone}")))?;
        match client.sign_in(&pending.token, code).await {
            Ok(_) => {
                *self.saved_session.lock() = Some(client.session().save());
                Ok(())
            }
            Err(SignInError::PasswordRequired(_)) => Err(ClientError::PasswordRequired),
            Err(SignInError::InvalidCode) => {
                *self.pending_code.lock() = Some(pending);
                Err(ClientError::Request("PHONE_CODE_INVALID".to_string()))
            }
            Err(err) => Err(ClientError::Request(err.to_string())),
        }
    }

    async fn session_string(&self) -> Result<Option<String>, ClientError> {
        let client = self.live()?;
        Ok(Some(hex::encode(client.session().save())))
    }
}

fn decode_session(raw: &str) -> Option<Vec<u8>> {
    match hex::decode(raw.trim()) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "SESSION_STRING is not a hex encoded session, ignoring it");
            None
        }
    }
}

/// Maps an RPC error name to the gateway's client error taxonomy.
fn classify_rpc(code: i32, name: &str) -> ClientError {
    match name {
        "CHANNEL_PRIVATE" | "CHANNEL_INVALID" | "CHANNEL_BANNED" | "CHAT_ADMIN_REQUIRED"
        | "USERNAME_INVALID" | "USERNAME_NOT_OCCUPIED" => ClientError::ChannelPrivate(name.to_string()),
        "SESSION_PASSWORD_NEEDED" => ClientError::PasswordRequired,
        "AUTH_KEY_UNREGISTERED" | "SESSION_REVOKED" | "SESSION_EXPIRED" | "USER_DEACTIVATED" => {
            ClientError::Unauthorized
        }
        _ => ClientError::Request(format!("{code} {name}")),
    }
}

fn convert_document(raw: &tl::types::MessageMediaDocument) -> Option<Document> {
    let Some(tl::enums::Document::Document(document)) = &raw.document else {
        return None;
    };
    Some(Document {
        id: document.id,
        access_hash: document.access_hash,
        file_reference: Some(document.file_reference.clone()),
        mime_type: document.mime_type.clone(),
        size: document.size,
        dc_id: document.dc_id,
        attributes: document.attributes.iter().map(convert_attribute).collect(),
    })
}

fn convert_attribute(attribute: &tl::enums::DocumentAttribute) -> DocumentAttribute {
    match attribute {
        tl::enums::DocumentAttribute::Video(video) => DocumentAttribute::Video {
            w: Some(video.w),
            h: Some(video.h),
            duration: Some(video.duration as i64),
        },
        tl::enums::DocumentAttribute::Filename(name) => DocumentAttribute::Filename {
            file_name: name.file_name.clone(),
        },
        _ => DocumentAttribute::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_errors_map_to_client_errors() {
        assert!(matches!(
            classify_rpc(400, "CHANNEL_PRIVATE"),
            ClientError::ChannelPrivate(ref name) if name == "CHANNEL_PRIVATE"
        ));
        assert!(matches!(
            classify_rpc(400, "USERNAME_NOT_OCCUPIED"),
            ClientError::ChannelPrivate(_)
        ));
        assert!(matches!(
            classify_rpc(401, "SESSION_PASSWORD_NEEDED"),
            ClientError::PasswordRequired
        ));
        assert!(matches!(
            classify_rpc(401, "AUTH_KEY_UNREGISTERED"),
            ClientError::Unauthorized
        ));
        assert!(matches!(
            classify_rpc(420, "FLOOD_WAIT"),
            ClientError::Request(ref msg) if msg == "420 FLOOD_WAIT"
        ));
    }

    #[test]
    fn session_strings_are_hex() {
        assert_eq!(decode_session(" 0a0b "), Some(vec![0x0a, 0x0b]));
        assert_eq!(decode_session(""), None);
        assert_eq!(decode_session("1BVtsOK-telethon"), None);
    }

    #[tokio::test]
    async fn calls_before_connect_are_transport_errors() {
        let client = MtprotoClient::new(1, "hash", None);
        assert!(!client.is_connected().await);
        assert!(matches!(
            client.is_authorized().await,
            Err(ClientError::Transport(_))
        ));
        assert!(matches!(client.ping().await, Err(ClientError::Transport(_))));
        assert!(matches!(
            client.session_string().await,
            Err(ClientError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn unknown_chat_is_reported_private() {
        let client = MtprotoClient::new(1, "hash", None);
        assert!(matches!(
            client.search_messages(-100, "test", 50).await,
            Err(ClientError::ChannelPrivate(ref id)) if id == "-100"
        ));
    }

    #[test]
    fn rebuilt_descriptor_reuses_known_location() {
        let client = MtprotoClient::new(1, "hash", None);
        client.documents.write().insert(42, (777, 4));
        let descriptor = DocumentDescriptor::builder()
            .id(42)
            .file_reference_hex("0102")
            .file_name("clip.mp4")
            .build()
            .unwrap();

        let (location, dc) = client.file_location(&descriptor);
        assert_eq!(dc, 4);
        let tl::enums::InputFileLocation::InputDocumentFileLocation(location) = location else {
            panic!("expected a document location");
        };
        assert_eq!(location.access_hash, 777);
        assert_eq!(location.file_reference, vec![0x01, 0x02]);

        let unseen = DocumentDescriptor { id: 43, ..descriptor };
        assert_eq!(client.file_location(&unseen).1, 0);
    }
}
