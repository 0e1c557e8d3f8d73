#![forbid(unsafe_code)]

//! Normalized video metadata and the extractor that produces it.
//!
//! All structs in this module mirror how metadata is exposed by the API.

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::client::{DocumentAttribute, InboundMessage, Media};

/// File name used when a document carries no filename attribute.
pub const DEFAULT_FILE_NAME: &str = "video_file";

/// Characters escaped when a file name becomes a URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A video found in a publisher's feed.
///
/// `id` is the network's document id and the dedup key in the recent cache.
/// Without `file_reference` the video cannot be downloaded later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoMetadata {
    pub id: i64,
    pub caption: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub mime_type: String,
    pub size: i64,
    pub date: DateTime<Utc>,
    pub channel_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_reference: Option<String>,
    pub file_name: String,
    #[serde(default)]
    pub download_url: String,
    #[serde(default)]
    pub bot_name: String,
}

impl VideoMetadata {
    /// Fills the derived fields: publisher label and public download link.
    pub fn with_source(mut self, bot_name: impl Into<String>, public_url: &str) -> Self {
        self.bot_name = bot_name.into();
        self.download_url = download_url(public_url, self.id, &self.file_name);
        self
    }
}

/// Builds `{public_url}/videos/download/{id}/{file_name}`.
pub fn download_url(public_url: &str, id: i64, file_name: &str) -> String {
    format!(
        "{}/videos/download/{}/{}",
        public_url.trim_end_matches('/'),
        id,
        utf8_percent_encode(file_name, PATH_SEGMENT)
    )
}

/// Maps a raw message to a video record, or `None` when it is not a document
/// carrying a video attribute. Derived fields are left empty.
pub fn extract(message: &InboundMessage) -> Option<VideoMetadata> {
    let Some(Media::Document(document)) = &message.media else {
        return None;
    };
    let (width, height, duration) = match document.video_attribute()? {
        DocumentAttribute::Video { w, h, duration } => (*w, *h, *duration),
        _ => (None, None, None),
    };

    let file_name = document
        .file_name()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(DEFAULT_FILE_NAME)
        .to_string();
    let caption = if message.text.trim().is_empty() {
        file_name.clone()
    } else {
        message.text.clone()
    };

    Some(VideoMetadata {
        id: document.id,
        caption,
        width,
        height,
        duration,
        mime_type: document.mime_type.clone(),
        size: document.size,
        date: message.date.unwrap_or_else(Utc::now),
        channel_id: message.chat_id,
        file_reference: document
            .file_reference
            .as_deref()
            .filter(|bytes| !bytes.is_empty())
            .map(hex::encode),
        file_name,
        download_url: String::new(),
        bot_name: String::new(),
    })
}
