#![forbid(unsafe_code)]

//! The gateway service object.
//!
//! Constructed once at startup and shared with every HTTP handler. It owns
//! the recent cache, the publisher mapping and the session state, and routes
//! every network call through the [`NetworkExecutor`].

use std::{collections::BTreeMap, path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;
use tracing::info;

use crate::cache::RecentVideoCache;
use crate::config::{
    CALLER_GRACE, GatewayConfig, KEEPALIVE_INTERVAL, RECENT_CACHE_CAPACITY, SEARCH_MESSAGE_LIMIT,
    SEARCH_TIMEOUT,
};
use crate::download::DownloadResolver;
use crate::entities::EntityResolver;
use crate::error::GatewayError;
use crate::executor::NetworkExecutor;
use crate::listener::InboundListener;
use crate::metadata::VideoMetadata;
use crate::search::SearchEngine;
use crate::session::{CodeOutcome, LoginOutcome, SessionManager};

/// Tunables for a [`Gateway`]. Production values come from [`GatewayConfig`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub publishers: Vec<String>,
    pub public_url: String,
    pub download_dir: PathBuf,
    pub cache_capacity: usize,
    pub search_limit: usize,
    pub search_timeout: Duration,
    pub caller_grace: Duration,
    pub keepalive_interval: Duration,
    pub session_loaded: bool,
    pub persist_session_to: Option<PathBuf>,
}

impl GatewaySettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            publishers: config.publishers.clone(),
            public_url: config.public_url.clone(),
            download_dir: config.download_dir.clone(),
            cache_capacity: RECENT_CACHE_CAPACITY,
            search_limit: SEARCH_MESSAGE_LIMIT,
            search_timeout: SEARCH_TIMEOUT,
            caller_grace: CALLER_GRACE,
            keepalive_interval: KEEPALIVE_INTERVAL,
            session_loaded: config.session_string.is_some(),
            persist_session_to: Some(config.env_path.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EntityStatus {
    pub resolved: bool,
}

/// Payload of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub authorized: bool,
    pub session_loaded: bool,
    pub session_string_start: Option<String>,
    pub cached_videos: usize,
    pub bot_entities: BTreeMap<String, EntityStatus>,
    pub bots_configurados: Vec<String>,
}

pub struct Gateway {
    executor: NetworkExecutor,
    cache: Arc<RecentVideoCache>,
    resolver: Arc<EntityResolver>,
    session: Arc<SessionManager>,
    listener: Arc<InboundListener>,
    search: Arc<SearchEngine>,
    downloads: Arc<DownloadResolver>,
    keepalive_interval: Duration,
    caller_timeout: Duration,
}

impl Gateway {
    pub fn new(settings: GatewaySettings, executor: NetworkExecutor) -> Self {
        let cache = Arc::new(RecentVideoCache::new(settings.cache_capacity));
        let resolver = Arc::new(EntityResolver::new(settings.publishers));
        let session = Arc::new(SessionManager::new(
            resolver.clone(),
            settings.session_loaded,
            settings.persist_session_to,
        ));
        let listener = Arc::new(InboundListener::new(
            resolver.clone(),
            cache.clone(),
            settings.public_url.clone(),
        ));
        let search = Arc::new(SearchEngine::new(
            resolver.clone(),
            settings.public_url,
            settings.search_limit,
            settings.search_timeout,
        ));
        let downloads = Arc::new(DownloadResolver::new(settings.download_dir, cache.clone()));

        Self {
            executor,
            cache,
            resolver,
            session,
            listener,
            search,
            downloads,
            keepalive_interval: settings.keepalive_interval,
            caller_timeout: settings.search_timeout + settings.caller_grace,
        }
    }

    pub fn cache(&self) -> &RecentVideoCache {
        &self.cache
    }

    pub fn publishers(&self) -> &[String] {
        self.resolver.publishers()
    }

    /// One connection/authorization/resolution pass on the executor.
    pub async fn ensure_connected(&self) -> Result<bool, GatewayError> {
        let session = self.session.clone();
        self.executor
            .submit(self.caller_timeout, move |client| async move {
                session.ensure_connected(client.as_ref()).await
            })
            .await?
    }

    /// Starts the keep-alive loop and the inbound listener on the executor.
    pub fn start_background(&self) -> Result<(), GatewayError> {
        let session = self.session.clone();
        let period = self.keepalive_interval;
        self.executor
            .spawn_background("keepalive", move |client| async move {
                session.run_keepalive(client, period).await
            })?;

        let listener = self.listener.clone();
        self.executor
            .spawn_background("listener", move |client| async move {
                listener.run(client).await
            })?;
        info!(interval = ?period, "background tasks started");
        Ok(())
    }

    pub fn recent(&self, limit: usize) -> Vec<VideoMetadata> {
        self.cache.snapshot(limit)
    }

    pub async fn search(&self, query: &str) -> Result<Vec<VideoMetadata>, GatewayError> {
        let search = self.search.clone();
        let query = query.to_string();
        self.executor
            .submit(self.caller_timeout, move |client| async move {
                search.search(client, &query).await
            })
            .await?
    }

    /// Resolves a document to a local file. A file already on disk is returned
    /// without touching the network.
    pub async fn download(&self, document_id: i64, file_name: &str) -> Result<PathBuf, GatewayError> {
        if let Some(path) = self.downloads.cached(document_id, file_name).await? {
            return Ok(path);
        }
        let downloads = self.downloads.clone();
        let file_name = file_name.to_string();
        self.executor
            .submit(self.caller_timeout, move |client| async move {
                downloads
                    .download(client.as_ref(), document_id, &file_name)
                    .await
            })
            .await?
    }

    pub async fn status(&self) -> GatewayStatus {
        let session = self.session.clone();
        let authorized = self
            .executor
            .submit(self.caller_timeout, move |client| async move {
                session.refresh_authorization(client.as_ref()).await
            })
            .await
            .unwrap_or(false);

        let session_string_start = if authorized {
            self.session
                .current_session_token()
                .map(|token| token.chars().take(20).collect())
        } else {
            None
        };

        let bot_entities = self
            .resolver
            .statuses()
            .into_iter()
            .map(|(name, resolved)| (name, EntityStatus { resolved }))
            .collect();

        GatewayStatus {
            authorized,
            session_loaded: self.session.session_loaded(),
            session_string_start,
            cached_videos: self.cache.len(),
            bot_entities,
            bots_configurados: self.publishers().to_vec(),
        }
    }

    pub async fn login(&self, phone: &str) -> Result<LoginOutcome, GatewayError> {
        let session = self.session.clone();
        let phone = phone.to_string();
        self.executor
            .submit(self.caller_timeout, move |client| async move {
                session.request_code(client.as_ref(), &phone).await
            })
            .await
    }

    pub async fn submit_code(&self, code: &str) -> Result<CodeOutcome, GatewayError> {
        let session = self.session.clone();
        let code = code.to_string();
        self.executor
            .submit(self.caller_timeout, move |client| async move {
                session.submit_code(client.as_ref(), &code).await
            })
            .await?
    }
}
