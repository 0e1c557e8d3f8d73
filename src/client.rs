#![forbid(unsafe_code)]

//! Seam between the gateway and the external messaging network.
//!
//! The types here mirror what the network hands us for a message: a chat, a
//! sender, optional text and optional media. Only documents matter to the
//! gateway; everything else is kept as an opaque [`Media::Other`].

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ClientError;

/// Operations the gateway needs from a signed-in network session.
///
/// Implementations are not required to be safe for concurrent use from
/// arbitrary threads: the gateway only ever drives them from the
/// [`crate::executor::NetworkExecutor`] context.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn connect(&self) -> Result<(), ClientError>;

    async fn is_connected(&self) -> bool;

    async fn is_authorized(&self) -> Result<bool, ClientError>;

    /// Completes authorization from the stored session, if it can.
    async fn start(&self) -> Result<(), ClientError>;

    /// Resolves a public publisher name (e.g. `@channel`) to its numeric id.
    async fn resolve_entity(&self, name: &str) -> Result<i64, ClientError>;

    /// Cheap request used as a liveness probe.
    async fn ping(&self) -> Result<(), ClientError>;

    /// Server-side text search over the most recent `limit` messages of a chat.
    async fn search_messages(
        &self,
        chat_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, ClientError>;

    /// Fetches the bytes of `document` into `dest`, overwriting it.
    async fn download_document(
        &self,
        document: &DocumentDescriptor,
        dest: &Path,
    ) -> Result<(), ClientError>;

    /// Waits for the next inbound message. `Ok(None)` means the wait elapsed
    /// with nothing new.
    async fn next_update(&self) -> Result<Option<InboundMessage>, ClientError>;

    async fn send_code(&self, phone: &str) -> Result<(), ClientError>;

    async fn sign_in(&self, phone: &str, code: &str) -> Result<(), ClientError>;

    /// Serialized session token, only meaningful once authorized.
    async fn session_string(&self) -> Result<Option<String>, ClientError>;
}

/// A message as delivered by the network, either pushed or returned by search.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: i64,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub text: String,
    pub date: Option<DateTime<Utc>>,
    pub media: Option<Media>,
}

#[derive(Debug, Clone)]
pub enum Media {
    Document(Document),
    Photo,
    Other,
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Option<Vec<u8>>,
    pub mime_type: String,
    pub size: i64,
    pub dc_id: i32,
    pub attributes: Vec<DocumentAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentAttribute {
    Video {
        w: Option<i32>,
        h: Option<i32>,
        duration: Option<i64>,
    },
    Filename {
        file_name: String,
    },
    Other,
}

impl Document {
    pub fn video_attribute(&self) -> Option<&DocumentAttribute> {
        self.attributes
            .iter()
            .find(|attr| matches!(attr, DocumentAttribute::Video { .. }))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.attributes.iter().find_map(|attr| match attr {
            DocumentAttribute::Filename { file_name } => Some(file_name.as_str()),
            _ => None,
        })
    }
}

/// Minimal document description sufficient for the network to fetch bytes.
///
/// Required: `id`, `file_reference`. Synthesized: `access_hash` and `dc_id`
/// are zero (the network resolves them when a file reference is supplied),
/// `date` is the build time and the only attribute is the file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDescriptor {
    pub id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub date: DateTime<Utc>,
    pub mime_type: String,
    pub size: i64,
    pub dc_id: i32,
    pub file_name: String,
}

#[derive(Debug, Default)]
pub struct DocumentDescriptorBuilder {
    id: Option<i64>,
    file_reference_hex: Option<String>,
    mime_type: Option<String>,
    size: Option<i64>,
    file_name: Option<String>,
}

/// Reasons a descriptor cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("file reference is not valid hex")]
    InvalidFileReference,
    #[error("size must not be negative")]
    NegativeSize,
}

impl DocumentDescriptor {
    pub fn builder() -> DocumentDescriptorBuilder {
        DocumentDescriptorBuilder::default()
    }
}

impl DocumentDescriptorBuilder {
    pub fn id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn file_reference_hex(mut self, hex: impl Into<String>) -> Self {
        self.file_reference_hex = Some(hex.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn build(self) -> Result<DocumentDescriptor, DescriptorError> {
        let id = self.id.ok_or(DescriptorError::Missing("id"))?;
        let raw = self
            .file_reference_hex
            .ok_or(DescriptorError::Missing("file_reference"))?;
        let file_reference =
            hex::decode(raw.trim()).map_err(|_| DescriptorError::InvalidFileReference)?;
        if file_reference.is_empty() {
            return Err(DescriptorError::Missing("file_reference"));
        }
        let size = self.size.unwrap_or(0);
        if size < 0 {
            return Err(DescriptorError::NegativeSize);
        }
        Ok(DocumentDescriptor {
            id,
            access_hash: 0,
            file_reference,
            date: Utc::now(),
            mime_type: self
                .mime_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size,
            dc_id: 0,
            file_name: self.file_name.ok_or(DescriptorError::Missing("file_name"))?,
        })
    }
}
