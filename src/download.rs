#![forbid(unsafe_code)]

//! On-demand media downloads backed by a flat file cache.
//!
//! Files live at `{download_dir}/{document_id}_{file_name}`. Once a file is
//! there it is served as-is on every later request. Bytes are first written
//! to a hidden temp file in the same directory and renamed into place, so a
//! failed fetch never leaves a truncated file under the final name.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::cache::RecentVideoCache;
use crate::client::{DocumentDescriptor, NetworkClient};
use crate::error::GatewayError;
use crate::security::ensure_plain_file_name;

pub const UNRESOLVABLE_MESSAGE: &str =
    "File not accessible or could not be downloaded (file reference not found).";

pub struct DownloadResolver {
    dir: PathBuf,
    cache: Arc<RecentVideoCache>,
    in_flight: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl DownloadResolver {
    pub fn new(dir: impl Into<PathBuf>, cache: Arc<RecentVideoCache>) -> Self {
        Self {
            dir: dir.into(),
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic on-disk location for a document.
    pub fn local_path(&self, document_id: i64, file_name: &str) -> Result<PathBuf, GatewayError> {
        ensure_plain_file_name(file_name)?;
        Ok(self.dir.join(format!("{document_id}_{file_name}")))
    }

    /// Returns the local file if it was downloaded before.
    pub async fn cached(
        &self,
        document_id: i64,
        file_name: &str,
    ) -> Result<Option<PathBuf>, GatewayError> {
        let path = self.local_path(document_id, file_name)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .unwrap_or(false)
            .then_some(path))
    }

    /// Resolves a document to a local file, fetching it if needed.
    ///
    /// Documents that are not in the recent cache, or that carry no file
    /// reference, cannot be fetched and yield [`GatewayError::NotFound`].
    /// Fetch failures are logged and reported the same way.
    pub async fn download(
        &self,
        client: &dyn NetworkClient,
        document_id: i64,
        file_name: &str,
    ) -> Result<PathBuf, GatewayError> {
        let path = self.local_path(document_id, file_name)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }

        let key_lock = self
            .in_flight
            .lock()
            .entry(path.clone())
            .or_default()
            .clone();
        let result = {
            let _guard = key_lock.lock().await;
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                Ok(path.clone())
            } else {
                self.fetch(client, document_id, file_name, &path).await
            }
        };

        let mut in_flight = self.in_flight.lock();
        if Arc::strong_count(&key_lock) <= 2 {
            in_flight.remove(&path);
        }
        result
    }

    async fn fetch(
        &self,
        client: &dyn NetworkClient,
        document_id: i64,
        file_name: &str,
        path: &Path,
    ) -> Result<PathBuf, GatewayError> {
        let Some(record) = self.cache.find(document_id) else {
            warn!(document_id, "document not in recent cache; cannot download");
            return Err(GatewayError::NotFound(UNRESOLVABLE_MESSAGE.to_string()));
        };
        let Some(file_reference) = record.file_reference else {
            warn!(document_id, "cached document has no file reference");
            return Err(GatewayError::NotFound(UNRESOLVABLE_MESSAGE.to_string()));
        };

        let descriptor = DocumentDescriptor::builder()
            .id(document_id)
            .file_reference_hex(file_reference)
            .mime_type(record.mime_type)
            .size(record.size)
            .file_name(file_name)
            .build()
            .map_err(|err| {
                warn!(document_id, error = %err, "cannot rebuild document descriptor");
                GatewayError::NotFound(UNRESOLVABLE_MESSAGE.to_string())
            })?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let partial = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.dir)?;

        info!(document_id, file = %file_name, "downloading document");
        if let Err(err) = client.download_document(&descriptor, partial.path()).await {
            warn!(document_id, error = %err, "document download failed");
            return Err(GatewayError::NotFound(UNRESOLVABLE_MESSAGE.to_string()));
        }

        partial.persist(path).map_err(|err| GatewayError::Io(err.error))?;
        info!(document_id, path = %path.display(), "document stored");
        Ok(path.to_path_buf())
    }
}
